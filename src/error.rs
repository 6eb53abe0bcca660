//! Stage error taxonomy shared across the pipeline.
//!
//! Every recoverable failure inside a pipeline request is one of these
//! kinds; the recovery policy and the host event protocol both key off
//! the kind string, so variants here are stable names, not just types.

use thiserror::Error;

/// All errors produced by pipeline stages.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("audio capture failed: {0}")]
    AudioCaptureFailed(String),

    #[error("transcription returned no text")]
    SttEmpty,

    #[error("transcription confidence too low: {confidence:.2}")]
    SttLowConfidence { confidence: f32 },

    #[error("language model request timed out")]
    LlmTimeout,

    #[error("language model unavailable: {0}")]
    LlmUnavailable(String),

    #[error("language model returned an invalid response: {0}")]
    LlmInvalidResponse(String),

    #[error("unknown tool: {name}")]
    ToolNotFound { name: String },

    #[error("tool arguments rejected: {0}")]
    ToolValidationFailed(String),

    #[error("tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("speech synthesis failed: {0}")]
    TtsFailed(String),

    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    /// Stable kind string used in host events and metrics error records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AudioCaptureFailed(_) => "AudioCaptureFailed",
            Self::SttEmpty => "SttEmpty",
            Self::SttLowConfidence { .. } => "SttLowConfidence",
            Self::LlmTimeout => "LlmTimeout",
            Self::LlmUnavailable(_) => "LlmUnavailable",
            Self::LlmInvalidResponse(_) => "LlmInvalidResponse",
            Self::ToolNotFound { .. } => "ToolNotFound",
            Self::ToolValidationFailed(_) => "ToolValidationFailed",
            Self::ToolExecutionFailed(_) => "ToolExecutionFailed",
            Self::TtsFailed(_) => "TtsFailed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// True for LLM transport failures that the retry policy may re-attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LlmTimeout | Self::LlmUnavailable(_))
    }
}
