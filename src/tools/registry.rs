//! Tool registry and dispatcher.
//!
//! Owns the set of available tools, validates every call against its
//! schema and the sandbox, and executes the handler under a per-invocation
//! timeout. Validation failures come back as error results, never as
//! panics or exceptions — the LLM gets to see them and try again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::sandbox::Sandbox;
use super::{ParamKind, ParamRole, ParamSpec, ToolCall, ToolDefinition, ToolResult};

/// Default per-invocation timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Uniform handler signature: arguments map in, text payload out.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: &Map<String, Value>) -> anyhow::Result<String>;
}

struct Entry {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

pub struct ToolRegistry {
    tools: HashMap<String, Entry>,
    sandbox: Sandbox,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(sandbox: Sandbox, timeout: Option<Duration>) -> Self {
        Self {
            tools: HashMap::new(),
            sandbox,
            timeout: timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT),
        }
    }

    /// Register (or replace) a tool.
    pub fn register(&mut self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        debug!(tool = %definition.name, "Tool registered");
        self.tools.insert(
            definition.name.clone(),
            Entry {
                definition,
                handler,
            },
        );
    }

    /// Definitions offered to the LLM, sorted by name for stable prompts.
    pub fn list(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|e| e.definition.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Whether a tool may run concurrently with other parallel-safe tools.
    pub fn is_parallel_safe(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .map(|e| e.definition.parallel_safe)
            .unwrap_or(false)
    }

    /// Validate and execute one call. Always returns a result for the
    /// call id; failures are encoded, not raised.
    pub async fn invoke(&self, call: &ToolCall) -> ToolResult {
        let Some(entry) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "Unknown tool requested");
            return ToolResult::error(
                &call.id,
                "ToolNotFound",
                format!("no such tool: {}", call.name),
            );
        };

        if let Err(reason) = self.validate(&entry.definition, &call.arguments) {
            debug!(tool = %call.name, %reason, "Tool arguments rejected");
            return ToolResult::error(&call.id, "ToolValidationFailed", reason);
        }

        match tokio::time::timeout(self.timeout, entry.handler.call(&call.arguments)).await {
            Ok(Ok(payload)) => ToolResult::ok(&call.id, payload),
            Ok(Err(e)) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                ToolResult::error(&call.id, "ToolExecutionFailed", e.to_string())
            }
            Err(_) => {
                warn!(tool = %call.name, timeout = ?self.timeout, "Tool timed out");
                ToolResult::error(
                    &call.id,
                    "ToolExecutionFailed",
                    format!("timed out after {:?}", self.timeout),
                )
            }
        }
    }

    /// Schema + sandbox checks, in that order.
    fn validate(
        &self,
        def: &ToolDefinition,
        args: &Map<String, Value>,
    ) -> Result<(), String> {
        for spec in &def.params {
            match args.get(&spec.name) {
                None if spec.required => {
                    return Err(format!("missing required argument: {}", spec.name));
                }
                None => {}
                Some(value) => check_kind(spec, value)?,
            }
        }

        // Unknown arguments are rejected; `confirmed` is the one meta
        // argument every tool implicitly accepts.
        for key in args.keys() {
            if key != "confirmed" && !def.params.iter().any(|p| &p.name == key) {
                return Err(format!("unexpected argument: {key}"));
            }
        }

        for (param, role) in &def.param_roles {
            let Some(value) = args.get(param) else {
                continue;
            };
            match role {
                ParamRole::Plain => {}
                ParamRole::Path => {
                    let raw = value
                        .as_str()
                        .ok_or_else(|| format!("{param} must be a string path"))?;
                    self.sandbox.check_path(raw)?;
                }
                ParamRole::Script => {
                    let raw = value
                        .as_str()
                        .ok_or_else(|| format!("{param} must be a string script"))?;
                    self.sandbox.check_script(raw)?;
                }
                ParamRole::Outbound => {
                    self.sandbox.check_outbound(args, def.silent_ok)?;
                }
            }
        }

        Ok(())
    }
}

fn check_kind(spec: &ParamSpec, value: &Value) -> Result<(), String> {
    let ok = match spec.kind {
        ParamKind::String => value.is_string(),
        ParamKind::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
        ParamKind::Number => value.is_number(),
        ParamKind::Boolean => value.is_boolean(),
        ParamKind::Array => value.is_array(),
    };
    if !ok {
        return Err(format!(
            "argument {} has the wrong type (expected {:?})",
            spec.name, spec.kind
        ));
    }

    if let Some(s) = value.as_str() {
        if !spec.allowed_values.is_empty() && !spec.allowed_values.iter().any(|v| v == s) {
            return Err(format!(
                "argument {} must be one of {:?}",
                spec.name, spec.allowed_values
            ));
        }
        if let Some(max) = spec.max_length {
            if s.len() > max {
                return Err(format!(
                    "argument {} exceeds the maximum length of {max}",
                    spec.name
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn call(&self, args: &Map<String, Value>) -> anyhow::Result<String> {
            Ok(args
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string())
        }
    }

    struct SlowTool;

    #[async_trait]
    impl ToolHandler for SlowTool {
        async fn call(&self, _args: &Map<String, Value>) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".to_string())
        }
    }

    struct FailTool;

    #[async_trait]
    impl ToolHandler for FailTool {
        async fn call(&self, _args: &Map<String, Value>) -> anyhow::Result<String> {
            anyhow::bail!("device unreachable")
        }
    }

    fn registry() -> ToolRegistry {
        let tmp = std::env::temp_dir();
        let sandbox = Sandbox::with_roots(vec![tmp], vec![]);
        let mut reg = ToolRegistry::new(sandbox, Some(Duration::from_millis(200)));
        reg.register(
            ToolDefinition::new(
                "echo",
                "Echo text back",
                vec![ParamSpec::required("text", ParamKind::String, "Text to echo")
                    .with_max_length(100)],
            ),
            Arc::new(EchoTool),
        );
        reg
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "t1".to_string(),
            name: name.to_string(),
            arguments: args.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn dispatches_to_handler() {
        let reg = registry();
        let result = reg.invoke(&call("echo", json!({"text": "hello"}))).await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hello");
        assert_eq!(result.call_id, "t1");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let reg = registry();
        let result = reg.invoke(&call("teleport", json!({}))).await;
        assert!(result.is_error);
        assert_eq!(result.error_kind.as_deref(), Some("ToolNotFound"));
    }

    #[tokio::test]
    async fn missing_required_argument_fails_validation() {
        let reg = registry();
        let result = reg.invoke(&call("echo", json!({}))).await;
        assert!(result.is_error);
        assert_eq!(result.error_kind.as_deref(), Some("ToolValidationFailed"));
    }

    #[tokio::test]
    async fn wrong_type_fails_validation() {
        let reg = registry();
        let result = reg.invoke(&call("echo", json!({"text": 42}))).await;
        assert_eq!(result.error_kind.as_deref(), Some("ToolValidationFailed"));
    }

    #[tokio::test]
    async fn unexpected_argument_fails_validation() {
        let reg = registry();
        let result = reg
            .invoke(&call("echo", json!({"text": "hi", "extra": 1})))
            .await;
        assert_eq!(result.error_kind.as_deref(), Some("ToolValidationFailed"));
    }

    #[tokio::test]
    async fn over_length_string_fails_validation() {
        let reg = registry();
        let long = "x".repeat(101);
        let result = reg.invoke(&call("echo", json!({"text": long}))).await;
        assert_eq!(result.error_kind.as_deref(), Some("ToolValidationFailed"));
    }

    #[tokio::test]
    async fn enum_values_are_enforced() {
        let tmp = std::env::temp_dir();
        let mut reg = ToolRegistry::new(Sandbox::with_roots(vec![tmp], vec![]), None);
        reg.register(
            ToolDefinition::new(
                "set_volume",
                "Set volume",
                vec![ParamSpec::required("level", ParamKind::String, "Level")
                    .with_allowed_values(&["low", "medium", "high"])],
            ),
            Arc::new(EchoTool),
        );
        let bad = reg.invoke(&call("set_volume", json!({"level": "max"}))).await;
        assert!(bad.is_error);
        let good = reg.invoke(&call("set_volume", json!({"level": "low"}))).await;
        assert!(!good.is_error);
    }

    #[tokio::test]
    async fn handler_timeout_is_an_execution_error() {
        let tmp = std::env::temp_dir();
        let mut reg = ToolRegistry::new(
            Sandbox::with_roots(vec![tmp], vec![]),
            Some(Duration::from_millis(50)),
        );
        reg.register(
            ToolDefinition::new("slow", "Sleeps forever", vec![]),
            Arc::new(SlowTool),
        );
        let result = reg.invoke(&call("slow", json!({}))).await;
        assert!(result.is_error);
        assert_eq!(result.error_kind.as_deref(), Some("ToolExecutionFailed"));
        assert!(result.content.contains("timed out"));
    }

    #[tokio::test]
    async fn handler_error_is_an_execution_error() {
        let tmp = std::env::temp_dir();
        let mut reg = ToolRegistry::new(Sandbox::with_roots(vec![tmp], vec![]), None);
        reg.register(
            ToolDefinition::new("fail", "Always fails", vec![]),
            Arc::new(FailTool),
        );
        let result = reg.invoke(&call("fail", json!({}))).await;
        assert_eq!(result.error_kind.as_deref(), Some("ToolExecutionFailed"));
        assert!(result.content.contains("device unreachable"));
    }

    #[tokio::test]
    async fn script_role_blocks_denied_phrases() {
        let tmp = std::env::temp_dir();
        let mut reg = ToolRegistry::new(Sandbox::with_roots(vec![tmp], vec![]), None);
        reg.register(
            ToolDefinition::new(
                "execute_script",
                "Run an automation script",
                vec![ParamSpec::required("script", ParamKind::String, "Script body")],
            )
            .with_param_role("script", ParamRole::Script),
            Arc::new(EchoTool),
        );
        let result = reg
            .invoke(&call(
                "execute_script",
                json!({"script": "do shell script \"rm -rf /\""}),
            ))
            .await;
        assert_eq!(result.error_kind.as_deref(), Some("ToolValidationFailed"));
    }

    #[tokio::test]
    async fn outbound_role_requires_confirmed() {
        let tmp = std::env::temp_dir();
        let mut reg = ToolRegistry::new(Sandbox::with_roots(vec![tmp], vec![]), None);
        reg.register(
            ToolDefinition::new(
                "send_message",
                "Send a message",
                vec![ParamSpec::required("text", ParamKind::String, "Body")],
            )
            .with_param_role("text", ParamRole::Outbound),
            Arc::new(EchoTool),
        );
        let refused = reg
            .invoke(&call("send_message", json!({"text": "hi"})))
            .await;
        assert_eq!(refused.error_kind.as_deref(), Some("ToolValidationFailed"));

        let sent = reg
            .invoke(&call("send_message", json!({"text": "hi", "confirmed": true})))
            .await;
        assert!(!sent.is_error);
    }

    #[test]
    fn list_is_sorted_and_complete() {
        let reg = registry();
        let defs = reg.list();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }
}
