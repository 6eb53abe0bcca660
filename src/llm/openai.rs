//! OpenAI-compatible chat completions provider.
//!
//! Works with any endpoint speaking the `/v1/chat/completions` wire format
//! (OpenAI, Groq, Ollama in OpenAI mode, vLLM, LM Studio). All connection
//! details come from config; nothing is hardcoded except the default
//! public endpoint.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::LlmConfig;
use crate::conversation::{Message, Role};
use crate::error::StageError;
use crate::tools::{ParamKind, ToolCall, ToolDefinition};

use super::{CompletionResult, LlmProvider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiProvider {
    pub fn from_config(cfg: &LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
        })
    }
}

/// Map transport errors onto the stage taxonomy.
fn transport_error(e: reqwest::Error) -> StageError {
    if e.is_timeout() {
        StageError::LlmTimeout
    } else {
        StageError::LlmUnavailable(e.to_string())
    }
}

/// Serialize conversation messages into the chat-completions shape.
fn encode_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id,
                "content": m.content,
            }),
            Role::Assistant if !m.tool_calls.is_empty() => json!({
                "role": "assistant",
                "content": m.content,
                "tool_calls": m.tool_calls.iter().map(|c| json!({
                    "id": c.id,
                    "type": "function",
                    "function": {
                        "name": c.name,
                        "arguments": Value::Object(c.arguments.clone()).to_string(),
                    },
                })).collect::<Vec<_>>(),
            }),
            _ => json!({
                "role": m.role.as_str(),
                "content": m.content,
            }),
        })
        .collect()
}

/// Serialize tool definitions into function-calling schemas.
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
                if let Some(max) = p.max_length {
                    prop.insert("maxLength".to_string(), json!(max));
                }
                properties.insert(p.name.clone(), Value::Object(prop));
                if p.required {
                    required.push(p.name.clone());
                }
            }
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    },
                },
            })
        })
        .collect()
}

pub(crate) fn kind_name(kind: ParamKind) -> &'static str {
    match kind {
        ParamKind::String => "string",
        ParamKind::Integer => "integer",
        ParamKind::Number => "number",
        ParamKind::Boolean => "boolean",
        ParamKind::Array => "array",
    }
}

/// Parse the tool calls out of a response message.
fn decode_tool_calls(message: &Value) -> Result<Vec<ToolCall>, StageError> {
    let Some(raw_calls) = message.get("tool_calls").and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    let mut calls = Vec::with_capacity(raw_calls.len());
    for raw in raw_calls {
        let id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StageError::LlmInvalidResponse("tool call without id".into()))?;
        let function = raw
            .get("function")
            .ok_or_else(|| StageError::LlmInvalidResponse("tool call without function".into()))?;
        let name = function
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StageError::LlmInvalidResponse("tool call without name".into()))?;
        let arguments_raw = function
            .get("arguments")
            .and_then(|v| v.as_str())
            .unwrap_or("{}");
        let arguments: serde_json::Map<String, Value> = serde_json::from_str(arguments_raw)
            .map_err(|e| {
                StageError::LlmInvalidResponse(format!(
                    "tool call {name} has malformed arguments: {e}"
                ))
            })?;
        calls.push(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        });
    }
    Ok(calls)
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<CompletionResult, StageError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut body = json!({
            "model": self.model,
            "messages": encode_messages(messages),
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": false,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(encode_tools(tools));
        }

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(key);
        }

        debug!(model = %self.model, tools = tools.len(), "Requesting chat completion");
        let resp = req.send().await.map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StageError::LlmUnavailable(format!(
                "completion API error {status}: {body}"
            )));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| StageError::LlmInvalidResponse(e.to_string()))?;

        let choice = payload["choices"]
            .get(0)
            .ok_or_else(|| StageError::LlmInvalidResponse("no choices in response".into()))?;
        let message = &choice["message"];

        let text = message["content"].as_str().unwrap_or("").to_string();
        let tool_calls = decode_tool_calls(message)?;
        let finish_reason = choice["finish_reason"].as_str().unwrap_or("stop").to_string();
        let token_count = payload["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32;

        if text.is_empty() && tool_calls.is_empty() {
            return Err(StageError::LlmInvalidResponse(
                "completion had neither text nor tool calls".into(),
            ));
        }

        Ok(CompletionResult {
            text,
            tool_calls,
            finish_reason,
            token_count,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}
