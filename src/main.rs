//! Assistant core entry point.
//!
//! Initializes logging and every subsystem, wires the audio pipeline to
//! the orchestrator, and runs the host protocol loop until `stop` or
//! stdin close.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use assistant_core::audio::{capture_channel, AudioPipeline, CaptureSupervisor, CircularBuffer};
use assistant_core::audio::pipeline::{PipelineSettings, EVENT_CHANNEL_CAPACITY};
use assistant_core::config::paths::{get_data_dir, get_model_dir};
use assistant_core::config::AssistantConfig;
use assistant_core::conversation::ConversationState;
use assistant_core::ipc::bridge::{emit_event, spawn_stdin_reader, spawn_stdout_writer};
use assistant_core::ipc::HostEvent;
use assistant_core::llm;
use assistant_core::metrics::Metrics;
use assistant_core::orchestrator::{Orchestrator, OrchestratorConfig};
use assistant_core::pipeline::{ExecutorSettings, PipelineExecutor, SharedConversation};
use assistant_core::recovery::RetryPolicy;
use assistant_core::stt;
use assistant_core::tools::registry::DEFAULT_TOOL_TIMEOUT;
use assistant_core::tools::sandbox::Sandbox;
use assistant_core::tools::{ParamKind, ParamSpec, ToolDefinition, ToolHandler, ToolRegistry};
use assistant_core::tts::{self, MockTts, Tts};
use assistant_core::vad::{self, UtteranceGate};
use assistant_core::wake;

/// Built-in clock tool: always safe, always available, and gives the model
/// something to answer time questions with.
struct CurrentTimeTool;

#[async_trait::async_trait]
impl ToolHandler for CurrentTimeTool {
    async fn call(
        &self,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> anyhow::Result<String> {
        let now = chrono::Local::now();
        let text = match args.get("format").and_then(|v| v.as_str()) {
            Some("time") => now.format("%H:%M").to_string(),
            _ => now.format("%A %Y-%m-%d %H:%M:%S").to_string(),
        };
        Ok(text)
    }
}

fn register_builtin_tools(registry: &mut ToolRegistry) {
    registry.register(
        ToolDefinition::new(
            "get_current_time",
            "Get the current local date and time",
            vec![ParamSpec::optional(
                "format",
                ParamKind::String,
                "Either 'time' or 'datetime'",
            )
            .with_allowed_values(&["time", "datetime"])],
        )
        .parallel_safe(),
        Arc::new(CurrentTimeTool),
    );
}

#[tokio::main]
async fn main() {
    // Initialize tracing (respects RUST_LOG env, defaults to info).
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Try to log to a file; fall back to stderr if the directory can't be
    // created. stdout stays reserved for the host protocol.
    let data_dir = get_data_dir();
    let use_file = std::fs::create_dir_all(&data_dir).is_ok();

    let _guard: Option<tracing_appender::non_blocking::WorkerGuard>;
    if use_file {
        let file_appender = tracing_appender::rolling::never(&data_dir, "assistant-core.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _guard = Some(guard);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();
    } else {
        _guard = None;
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    // ── Configuration ────────────────────────────────────────────────────
    let config = AssistantConfig::load();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        emit_event(&HostEvent::Error {
            kind: "InvalidConfig".to_string(),
            message: e,
        });
        return;
    }
    info!("Configuration loaded");

    let model_dir = get_model_dir();
    let metrics = Metrics::new(config.metrics.enabled);

    // ── Outbound protocol channel ────────────────────────────────────────
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let _writer = spawn_stdout_writer(outbound_rx);
    let cmd_rx = spawn_stdin_reader(outbound_tx.clone());

    // ── Audio subsystem ──────────────────────────────────────────────────
    let ring = Arc::new(CircularBuffer::new(
        config.audio.buffer_duration_seconds,
        config.audio.sample_rate,
    ));
    let wake_detector = wake::create_detector(&model_dir, config.audio.wake_sensitivity);
    let gate = UtteranceGate::new(
        vad::create_detector(&model_dir),
        config.audio.sample_rate,
        config.vad.silence_ms,
        config.vad.min_speech_ms,
    );

    let (producer, consumer) = capture_channel(None);
    let (capture_tx, capture_rx) = mpsc::unbounded_channel();
    let capture = CaptureSupervisor::spawn(
        producer,
        config.audio.input_device.clone(),
        config.audio.sample_rate,
        capture_tx,
    );

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (hotkey_tx, hotkey_rx) = mpsc::channel(8);
    let audio_cancel = CancellationToken::new();

    let audio_pipeline = AudioPipeline::new(
        Arc::clone(&ring),
        wake_detector,
        gate,
        PipelineSettings {
            sample_rate: config.audio.sample_rate,
            max_utterance_samples: config.max_utterance_samples(),
            wake_prefix_secs: config.audio.wake_prefix_ms as f64 / 1000.0,
        },
        events_tx,
        Arc::clone(&metrics),
    );
    let audio_task = tokio::spawn(audio_pipeline.run(consumer, hotkey_rx, audio_cancel.clone()));

    // ── STT ──────────────────────────────────────────────────────────────
    let stt_engine: Arc<dyn stt::SttEngine> = match stt::create_stt_engine(&config.stt) {
        Ok(engine) => engine,
        Err(e) => {
            warn!("STT engine failed to initialize: {} — using mock", e);
            emit_event(&HostEvent::Error {
                kind: "SttEmpty".to_string(),
                message: format!("STT not available: {e}"),
            });
            Arc::new(stt::MockStt::fixed("", 0.0))
        }
    };

    // ── LLM provider (plus optional fallback) ────────────────────────────
    let provider = match llm::create_provider(&config.llm) {
        Ok(p) => p,
        Err(e) => {
            error!("LLM provider failed to initialize: {}", e);
            emit_event(&HostEvent::Error {
                kind: "LlmUnavailable".to_string(),
                message: e.to_string(),
            });
            return;
        }
    };
    let fallback = match config.llm.fallback_provider.as_deref() {
        Some(name) => match llm::create_named(&config.llm, name) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("Fallback provider unavailable: {}", e);
                None
            }
        },
        None => None,
    };
    info!(provider = provider.name(), "LLM provider initialized");

    // ── TTS ──────────────────────────────────────────────────────────────
    let tts_engine: Arc<dyn Tts> = match tts::create_tts(&config.tts) {
        Ok(engine) => {
            info!(name = %engine.name(), "TTS engine initialized");
            Arc::from(engine)
        }
        Err(e) => {
            warn!("TTS engine failed to initialize: {} — responses will be text-only", e);
            emit_event(&HostEvent::Error {
                kind: "TtsFailed".to_string(),
                message: format!("TTS not available: {e}"),
            });
            Arc::new(MockTts::new(Duration::ZERO))
        }
    };

    // ── Tools ────────────────────────────────────────────────────────────
    let sandbox = Sandbox::from_config(&config.tools);
    let tool_timeout = config
        .tools
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TOOL_TIMEOUT);
    let mut registry = ToolRegistry::new(sandbox, Some(tool_timeout));
    register_builtin_tools(&mut registry);
    let registry = Arc::new(registry);

    // ── Conversation + executor ──────────────────────────────────────────
    let conversation: SharedConversation = Arc::new(tokio::sync::Mutex::new(
        ConversationState::new(
            config.conversation.system_prompt.clone(),
            config.conversation.max_turns,
            config.conversation.max_context_tokens,
            Duration::from_secs(config.conversation.session_timeout_seconds),
        ),
    ));

    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    let executor = Arc::new(
        PipelineExecutor::new(
            stt_engine,
            provider,
            fallback,
            registry,
            Arc::clone(&tts_engine),
            Arc::clone(&conversation),
            Arc::clone(&metrics),
            ExecutorSettings {
                language: config.stt.language.clone(),
                stt_timeout: Duration::from_secs(config.stt.timeout_seconds),
                temperature: config.llm.temperature,
                max_tokens: config.llm.max_tokens,
                max_tool_iterations: config.pipeline.max_tool_iterations,
                retry: RetryPolicy::new(config.llm.retry_max),
            },
        )
        .with_signals(signals_tx),
    );

    // ── Metrics tick ─────────────────────────────────────────────────────
    metrics.spawn_log_tick(config.metrics.log_interval_seconds, audio_cancel.clone());

    // ── Orchestrator ─────────────────────────────────────────────────────
    let (orchestrator, results_rx) = Orchestrator::new(
        executor,
        tts_engine,
        conversation,
        metrics,
        outbound_tx,
        OrchestratorConfig {
            backpressure: config.pipeline.backpressure_policy,
            auto_relisten: config.pipeline.auto_relisten,
            session_tick: Duration::from_secs(60),
        },
        Some(hotkey_tx),
        audio_cancel.clone(),
    );

    info!("Assistant core ready");
    orchestrator
        .run(cmd_rx, events_rx, signals_rx, capture_rx, results_rx)
        .await;

    // Best-effort drain: stop audio before exiting.
    audio_cancel.cancel();
    audio_task.abort();
    capture.shutdown();
    info!("Assistant core shut down");
}
