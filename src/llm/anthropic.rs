//! Anthropic messages API provider.
//!
//! The messages endpoint keeps the system prompt out of the message list
//! and represents tool traffic as typed content blocks (`tool_use` from
//! the model, `tool_result` back from us inside a user message).

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::LlmConfig;
use crate::conversation::{Message, Role};
use crate::error::StageError;
use crate::tools::{ToolCall, ToolDefinition};

use super::openai::kind_name;
use super::{CompletionResult, LlmProvider};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn from_config(cfg: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Anthropic provider requires an API key"))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model: cfg.model.clone(),
        })
    }
}

fn transport_error(e: reqwest::Error) -> StageError {
    if e.is_timeout() {
        StageError::LlmTimeout
    } else {
        StageError::LlmUnavailable(e.to_string())
    }
}

/// Split out the system prompt and convert the rest to Anthropic's shape.
fn encode_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system = None;
    let mut out = Vec::new();

    for m in messages {
        match m.role {
            Role::System => system = Some(m.content.clone()),
            Role::User => out.push(json!({"role": "user", "content": m.content})),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": m.content}));
                }
                for c in &m.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": c.id,
                        "name": c.name,
                        "input": Value::Object(c.arguments.clone()),
                    }));
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            Role::Tool => out.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id,
                    "content": m.content,
                }],
            })),
        }
    }

    (system, out)
}

fn encode_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            let mut properties = serde_json::Map::new();
            let mut required = Vec::new();
            for p in &t.params {
                let mut prop = serde_json::Map::new();
                prop.insert("type".to_string(), json!(kind_name(p.kind)));
                prop.insert("description".to_string(), json!(p.description));
                if !p.allowed_values.is_empty() {
                    prop.insert("enum".to_string(), json!(p.allowed_values));
                }
                properties.insert(p.name.clone(), Value::Object(prop));
                if p.required {
                    required.push(p.name.clone());
                }
            }
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
            })
        })
        .collect()
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<CompletionResult, StageError> {
        let url = format!("{}/v1/messages", self.base_url);
        let (system, encoded) = encode_messages(messages);

        let mut body = json!({
            "model": self.model,
            "messages": encoded,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(encode_tools(tools));
        }

        debug!(model = %self.model, tools = tools.len(), "Requesting message completion");
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StageError::LlmUnavailable(format!(
                "messages API error {status}: {body}"
            )));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| StageError::LlmInvalidResponse(e.to_string()))?;

        let blocks = payload["content"]
            .as_array()
            .ok_or_else(|| StageError::LlmInvalidResponse("no content blocks".into()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
                Some("tool_use") => {
                    let id = block["id"].as_str().ok_or_else(|| {
                        StageError::LlmInvalidResponse("tool_use without id".into())
                    })?;
                    let name = block["name"].as_str().ok_or_else(|| {
                        StageError::LlmInvalidResponse("tool_use without name".into())
                    })?;
                    let arguments = block["input"]
                        .as_object()
                        .cloned()
                        .ok_or_else(|| {
                            StageError::LlmInvalidResponse(format!(
                                "tool_use {name} input is not an object"
                            ))
                        })?;
                    tool_calls.push(ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments,
                    });
                }
                _ => {}
            }
        }

        if text.is_empty() && tool_calls.is_empty() {
            return Err(StageError::LlmInvalidResponse(
                "completion had neither text nor tool calls".into(),
            ));
        }

        let finish_reason = payload["stop_reason"].as_str().unwrap_or("end_turn").to_string();
        let token_count = (payload["usage"]["input_tokens"].as_u64().unwrap_or(0)
            + payload["usage"]["output_tokens"].as_u64().unwrap_or(0)) as u32;

        Ok(CompletionResult {
            text,
            tool_calls,
            finish_reason,
            token_count,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_leaves_the_message_list() {
        let messages = vec![Message::system("Be brief."), Message::user("hi")];
        let (system, encoded) = encode_messages(&messages);
        assert_eq!(system.as_deref(), Some("Be brief."));
        assert_eq!(encoded.len(), 1);
        assert_eq!(encoded[0]["role"], "user");
    }

    #[test]
    fn tool_results_become_user_blocks() {
        let messages = vec![
            Message::assistant(
                "",
                vec![ToolCall {
                    id: "tu_1".to_string(),
                    name: "echo".to_string(),
                    arguments: serde_json::Map::new(),
                }],
            ),
            Message::tool_result("tu_1", "done", Some("echo")),
        ];
        let (_system, encoded) = encode_messages(&messages);
        assert_eq!(encoded[0]["content"][0]["type"], "tool_use");
        assert_eq!(encoded[1]["role"], "user");
        assert_eq!(encoded[1]["content"][0]["type"], "tool_result");
        assert_eq!(encoded[1]["content"][0]["tool_use_id"], "tu_1");
    }

    #[test]
    fn provider_requires_api_key() {
        let cfg = LlmConfig::default();
        assert!(AnthropicProvider::from_config(&cfg).is_err());
    }
}
