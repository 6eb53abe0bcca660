//! Configuration loading and validation.
//!
//! A single `assistant_config.json` in the data directory holds every
//! tunable. All fields have defaults so an empty (or missing) file yields a
//! runnable configuration; `validate()` rejects combinations the pipeline
//! cannot honor before any component is constructed.

pub mod paths;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use paths::get_data_dir;

/// What to do with an utterance that arrives while one is already being
/// processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Queue the new utterance (depth 1) behind the in-flight one.
    Coalesce,
    /// Drop the new utterance, keep processing the old one.
    #[default]
    DropNewest,
    /// Abandon the queued utterance (if any) in favor of the new one.
    DropOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate for the whole pipeline. Must match the wake detector's
    /// expected rate.
    pub sample_rate: u32,
    /// Rolling pre-wake window kept in the circular buffer, seconds.
    pub buffer_duration_seconds: f64,
    /// Wake detector sensitivity, 0.0 (strict) .. 1.0 (loose).
    pub wake_sensitivity: f32,
    /// Hard cap on a single utterance, seconds.
    pub max_utterance_seconds: f64,
    /// How much pre-wake audio to prepend to a wake-triggered utterance.
    pub wake_prefix_ms: u64,
    /// Input device name; `None` uses the system default.
    pub input_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            buffer_duration_seconds: 3.0,
            wake_sensitivity: 0.5,
            max_utterance_seconds: 30.0,
            wake_prefix_ms: 500,
            input_device: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Trailing silence that ends an utterance, milliseconds.
    pub silence_ms: u64,
    /// Minimum speech before silence can end an utterance, milliseconds.
    pub min_speech_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_ms: 500,
            min_speech_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Maximum user/assistant turn pairs kept in context.
    pub max_turns: usize,
    /// Approximate token budget for the whole context.
    pub max_context_tokens: usize,
    /// Idle time after which the session (conversation) resets, seconds.
    pub session_timeout_seconds: u64,
    /// System prompt prepended to every completion request.
    pub system_prompt: Option<String>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_context_tokens: 4096,
            session_timeout_seconds: 1800,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bound on LLM→tool→LLM rounds per request.
    pub max_tool_iterations: usize,
    pub backpressure_policy: BackpressurePolicy,
    /// Return to LISTENING (rather than IDLE) after speaking.
    pub auto_relisten: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: 5,
            backpressure_policy: BackpressurePolicy::default(),
            auto_relisten: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// One of: "cloud", "mock".
    pub adapter: String,
    /// Transcription language (no autodetect).
    pub language: String,
    pub timeout_seconds: u64,
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            adapter: "cloud".to_string(),
            language: "en".to_string(),
            timeout_seconds: 10,
            api_key: None,
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// One of: "openai", "anthropic", "mock".
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    /// Retry budget for timeouts / transport failures.
    pub retry_max: u32,
    /// Provider to switch to (for one request) when the primary exhausts
    /// its retries.
    pub fallback_provider: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            temperature: 0.7,
            max_tokens: 1024,
            timeout_seconds: 60,
            retry_max: 3,
            fallback_provider: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// One of: "cloud", "mock".
    pub adapter: String,
    pub voice: String,
    pub rate_wpm: u32,
    /// Playback volume, 0.0 .. 1.0.
    pub volume: f32,
    pub timeout_seconds: u64,
    pub api_key: Option<String>,
    /// Output device name; `None` uses the system default.
    pub output_device: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            adapter: "cloud".to_string(),
            voice: "alloy".to_string(),
            rate_wpm: 180,
            volume: 1.0,
            timeout_seconds: 30,
            api_key: None,
            output_device: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Interval for the periodic summary log line, seconds. 0 disables it.
    pub log_interval_seconds: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolsConfig {
    /// Root directories file-touching tools may reach. Empty means the
    /// built-in defaults (documents/downloads/desktop).
    pub allow_paths: Vec<PathBuf>,
    /// Directories always refused, even under an allowed root.
    pub deny_paths: Vec<PathBuf>,
    /// Deny-list substrings to waive for script tools (normally empty).
    pub allow_dangerous_substrings: Vec<String>,
    /// Per-invocation tool timeout, seconds.
    pub timeout_seconds: Option<u64>,
}

/// Complete validated configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub conversation: ConversationConfig,
    pub pipeline: PipelineConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub metrics: MetricsConfig,
    pub tools: ToolsConfig,
}

/// The wake detector models are trained at a fixed rate.
pub const WAKE_DETECTOR_SAMPLE_RATE: u32 = 16_000;

impl AssistantConfig {
    /// Read `assistant_config.json` from the data directory. A missing or
    /// unparsable file yields the defaults (with a warning for the latter).
    pub fn load() -> Self {
        Self::load_from(&get_data_dir().join("assistant_config.json"))
    }

    /// Read configuration from an explicit path.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("Failed to parse {}: {} — using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {} — using defaults", path.display(), e);
                }
                Self::default()
            }
        }
    }

    /// Reject configurations the pipeline cannot honor.
    pub fn validate(&self) -> Result<(), String> {
        if self.audio.sample_rate != WAKE_DETECTOR_SAMPLE_RATE {
            return Err(format!(
                "audio.sample_rate must be {} (wake detector rate), got {}",
                WAKE_DETECTOR_SAMPLE_RATE, self.audio.sample_rate
            ));
        }
        if !(0.0..=1.0).contains(&self.audio.wake_sensitivity) {
            return Err(format!(
                "audio.wake_sensitivity must be in [0, 1], got {}",
                self.audio.wake_sensitivity
            ));
        }
        if self.audio.buffer_duration_seconds <= 0.0 {
            return Err("audio.buffer_duration_seconds must be positive".to_string());
        }
        if self.audio.max_utterance_seconds <= 0.0 {
            return Err("audio.max_utterance_seconds must be positive".to_string());
        }
        if self.audio.wake_prefix_ms as f64 / 1000.0 > self.audio.buffer_duration_seconds {
            return Err(format!(
                "audio.wake_prefix_ms ({}) exceeds the buffered window ({}s)",
                self.audio.wake_prefix_ms, self.audio.buffer_duration_seconds
            ));
        }
        if self.vad.silence_ms == 0 {
            return Err("vad.silence_ms must be positive".to_string());
        }
        if self.conversation.max_turns == 0 {
            return Err("conversation.max_turns must be at least 1".to_string());
        }
        if self.pipeline.max_tool_iterations == 0 {
            return Err("pipeline.max_tool_iterations must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.tts.volume) {
            return Err(format!("tts.volume must be in [0, 1], got {}", self.tts.volume));
        }
        if self.stt.language.is_empty() {
            return Err("stt.language must be set (no autodetect)".to_string());
        }
        Ok(())
    }

    /// Utterance cap in samples at the configured rate.
    pub fn max_utterance_samples(&self) -> usize {
        (self.audio.max_utterance_seconds * self.audio.sample_rate as f64) as usize
    }
}
