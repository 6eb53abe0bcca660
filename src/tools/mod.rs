//! Tool definitions, calls, results, and the parameter schema model.
//!
//! Definitions are what the LLM sees; the registry (see [`registry`])
//! validates arguments against the schema before any handler runs.

pub mod registry;
pub mod sandbox;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use registry::{ToolHandler, ToolRegistry};

/// Parameter value types a tool schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
}

/// One named, typed parameter in a tool schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
    /// Restrict a string parameter to these values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
    /// Maximum length for string parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: true,
            allowed_values: Vec::new(),
            max_length: None,
        }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    pub fn with_allowed_values(mut self, values: &[&str]) -> Self {
        self.allowed_values = values.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }
}

/// How the dispatcher must treat a tool's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamRole {
    /// No special handling.
    #[default]
    Plain,
    /// Filesystem path: must resolve inside the allow-list roots.
    Path,
    /// Script text: scanned against the deny-substring list.
    Script,
    /// Outbound user-visible content: requires `confirmed=true` unless the
    /// tool is marked `silent_ok`.
    Outbound,
}

/// A tool offered to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    /// Sandbox roles by parameter name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub param_roles: BTreeMap<String, ParamRole>,
    /// May run concurrently with other parallel-safe tools in the same
    /// LLM round.
    #[serde(default)]
    pub parallel_safe: bool,
    /// Outbound parameters may go out without a `confirmed` argument.
    #[serde(default)]
    pub silent_ok: bool,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, params: Vec<ParamSpec>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params,
            param_roles: BTreeMap::new(),
            parallel_safe: false,
            silent_ok: false,
        }
    }

    pub fn with_param_role(mut self, param: &str, role: ParamRole) -> Self {
        self.param_roles.insert(param.to_string(), role);
        self
    }

    pub fn parallel_safe(mut self) -> Self {
        self.parallel_safe = true;
        self
    }

    pub fn silent_ok(mut self) -> Self {
        self.silent_ok = true;
        self
    }
}

/// A structured request from the LLM to run one tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique within one LLM response.
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, Value>,
}

/// Outcome of one tool invocation; at most one per call id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    /// Payload on success, error description otherwise.
    pub content: String,
    pub is_error: bool,
    /// Error kind string when `is_error` (matches the stage taxonomy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ToolResult {
    pub fn ok(call_id: &str, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.to_string(),
            content: content.into(),
            is_error: false,
            error_kind: None,
        }
    }

    pub fn error(call_id: &str, kind: &str, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.to_string(),
            content: message.into(),
            is_error: true,
            error_kind: Some(kind.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_builder_sets_flags() {
        let def = ToolDefinition::new(
            "send_message",
            "Send a message",
            vec![ParamSpec::required("body", ParamKind::String, "Message body")],
        )
        .with_param_role("body", ParamRole::Outbound)
        .parallel_safe();

        assert!(def.parallel_safe);
        assert!(!def.silent_ok);
        assert_eq!(def.param_roles["body"], ParamRole::Outbound);
    }

    #[test]
    fn result_constructors() {
        let ok = ToolResult::ok("t1", "done");
        assert!(!ok.is_error);
        let err = ToolResult::error("t1", "ToolValidationFailed", "bad arg");
        assert!(err.is_error);
        assert_eq!(err.error_kind.as_deref(), Some("ToolValidationFailed"));
    }
}
