//! Language model providers.
//!
//! One polymorphic [`LlmProvider`] interface with a concrete type per wire
//! format (OpenAI-compatible chat completions, Anthropic messages) plus a
//! scripted mock for tests and offline runs. A factory reads config and
//! returns a boxed provider; the recovery layer may build a second one as a
//! per-request fallback.

pub mod anthropic;
pub mod mock;
pub mod openai;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::LlmConfig;
use crate::conversation::Message;
use crate::error::StageError;
use crate::tools::{ToolCall, ToolDefinition};

/// One completion from a provider: final text, any tool calls, and
/// bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct CompletionResult {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub token_count: u32,
}

impl CompletionResult {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: "stop".to_string(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: text.into(),
            tool_calls,
            finish_reason: "tool_calls".to_string(),
            ..Default::default()
        }
    }
}

/// Capability interface over all providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// One completion over the conversation. May suspend on network I/O;
    /// transport failures surface as `LlmTimeout` / `LlmUnavailable`,
    /// unparsable payloads as `LlmInvalidResponse`.
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<CompletionResult, StageError>;

    /// Streaming variant yielding text chunks. Unused by the default
    /// pipeline path; the default implementation completes eagerly and
    /// yields once.
    async fn stream_complete(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<BoxStream<'static, Result<String, StageError>>, StageError> {
        let result = self
            .complete(&messages, &tools, temperature, max_tokens)
            .await?;
        Ok(Box::pin(futures_util::stream::once(async move {
            Ok(result.text)
        })))
    }

    /// Provider name for logs and fallback selection.
    fn name(&self) -> &str;
}

/// Build the provider named in config.
pub fn create_provider(cfg: &LlmConfig) -> anyhow::Result<Box<dyn LlmProvider>> {
    create_named(cfg, &cfg.provider)
}

/// Build a specific provider against the same config (used for
/// `llm.fallback_provider`).
pub fn create_named(cfg: &LlmConfig, name: &str) -> anyhow::Result<Box<dyn LlmProvider>> {
    match name {
        "openai" => Ok(Box::new(openai::OpenAiProvider::from_config(cfg)?)),
        "anthropic" => Ok(Box::new(anthropic::AnthropicProvider::from_config(cfg)?)),
        "mock" => Ok(Box::new(mock::ScriptedProvider::always(
            CompletionResult::text_only("This is a mock response."),
        ))),
        other => anyhow::bail!("Unknown LLM provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn default_stream_yields_completion_text_once() {
        let provider = mock::ScriptedProvider::always(CompletionResult::text_only("chunked"));
        let mut stream = provider
            .stream_complete(vec![Message::user("hi")], vec![], 0.7, 128)
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "chunked");
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let cfg = LlmConfig::default();
        assert!(create_named(&cfg, "frontier-9000").is_err());
    }

    #[test]
    fn factory_builds_mock_without_keys() {
        let cfg = LlmConfig::default();
        assert!(create_named(&cfg, "mock").is_ok());
    }
}
