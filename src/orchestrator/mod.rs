//! Orchestrator: lifecycle, status FSM, and the host command protocol.
//!
//! Single owner of the status machine. Status lines are pushed to the host
//! *before* any side effect that depends on the new state, exactly one
//! pipeline request runs at a time, and extra utterances are queued (depth
//! 1) or dropped per the configured backpressure policy.
//!
//! ```text
//! INITIALIZING --init_done--> IDLE
//! IDLE --start--> LISTENING
//! LISTENING --utterance_ready--> PROCESSING
//! PROCESSING --result_ready--> SPEAKING | IDLE
//! SPEAKING --tts_done--> IDLE | LISTENING   (auto_relisten)
//! any --error--> ERROR,  any --stop--> STOPPED,  ERROR --reset--> IDLE
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::capture::CaptureStatus;
use crate::audio::{self, AudioEvent, Utterance};
use crate::config::BackpressurePolicy;
use crate::ipc::{reply, HostCommand, HostEvent, HostLine, Status};
use crate::metrics::Metrics;
use crate::pipeline::{PipelineExecutor, PipelineResult, PipelineSignal, SharedConversation};
use crate::tts::Tts;

/// Counter bumped when backpressure discards an utterance.
pub const UTTERANCES_DROPPED_COUNTER: &str = "pipeline.utterances_dropped";

/// How often the session-expiry check runs.
const SESSION_TICK: Duration = Duration::from_secs(60);

pub struct OrchestratorConfig {
    pub backpressure: BackpressurePolicy,
    pub auto_relisten: bool,
    pub session_tick: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backpressure: BackpressurePolicy::DropNewest,
            auto_relisten: true,
            session_tick: SESSION_TICK,
        }
    }
}

pub struct Orchestrator {
    status: Status,
    executor: Arc<PipelineExecutor>,
    tts: Arc<dyn Tts>,
    conversation: SharedConversation,
    metrics: Arc<Metrics>,
    outbound: mpsc::UnboundedSender<HostLine>,
    config: OrchestratorConfig,
    /// Hotkey injection into the audio pipeline; absent in headless tests.
    hotkey_tx: Option<mpsc::Sender<()>>,
    /// Cancelling this stops the audio pipeline task and capture thread.
    audio_cancel: CancellationToken,
    /// Depth-1 queue for the coalesce/drop_oldest policies.
    pending: Option<Utterance>,
    /// Cancel token of the in-flight request, if any.
    inflight: Option<CancellationToken>,
    /// Completed pipeline results come back on this channel.
    results_tx: mpsc::UnboundedSender<PipelineResult>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<PipelineExecutor>,
        tts: Arc<dyn Tts>,
        conversation: SharedConversation,
        metrics: Arc<Metrics>,
        outbound: mpsc::UnboundedSender<HostLine>,
        config: OrchestratorConfig,
        hotkey_tx: Option<mpsc::Sender<()>>,
        audio_cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<PipelineResult>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        (
            Self {
                status: Status::Initializing,
                executor,
                tts,
                conversation,
                metrics,
                outbound,
                config,
                hotkey_tx,
                audio_cancel,
                pending: None,
                inflight: None,
                results_tx,
            },
            results_rx,
        )
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Transition and push the status line. The push happens before the
    /// caller performs any effect that depends on the new state.
    fn set_status(&mut self, status: Status) {
        if self.status == status {
            return;
        }
        debug!(from = %self.status, to = %status, "Status transition");
        self.status = status;
        let _ = self.outbound.send(HostLine::Status {
            status,
            ts: chrono::Utc::now().timestamp_millis(),
        });
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.outbound.send(HostLine::Event(event));
    }

    /// Main loop. Consumes host commands, audio events, pipeline signals,
    /// pipeline results, and capture health until `stop` or stdin close.
    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<HostCommand>,
        mut events_rx: mpsc::Receiver<AudioEvent>,
        mut signals_rx: mpsc::UnboundedReceiver<PipelineSignal>,
        mut capture_rx: mpsc::UnboundedReceiver<CaptureStatus>,
        mut results_rx: mpsc::UnboundedReceiver<PipelineResult>,
    ) {
        self.set_status(Status::Idle);
        info!("Orchestrator ready");

        let mut session_tick = tokio::time::interval(self.config.session_tick);
        session_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        session_tick.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => {
                            info!("Command channel closed — shutting down");
                            self.shutdown();
                            break;
                        }
                    }
                }
                Some(event) = events_rx.recv() => self.handle_audio_event(event),
                Some(signal) = signals_rx.recv() => self.handle_signal(signal),
                Some(result) = results_rx.recv() => self.handle_result(result),
                Some(capture) = capture_rx.recv() => self.handle_capture(capture),
                _ = session_tick.tick() => self.session_tick(),
            }
        }
    }

    // ── Host commands ───────────────────────────────────────────────────

    /// Handle one command; returns false when the loop should exit.
    pub async fn handle_command(&mut self, cmd: HostCommand) -> bool {
        let name = cmd.name();
        match cmd {
            HostCommand::Start {} => match self.status {
                Status::Idle => {
                    self.set_status(Status::Listening);
                    self.reply_ok(name);
                }
                Status::Listening => self.reply_ok(name),
                other => self.reply_err(name, &format!("cannot start while {other}")),
            },

            HostCommand::Stop {} => {
                // Idempotent: a second stop changes nothing and still
                // acknowledges.
                if self.status != Status::Stopped {
                    self.set_status(Status::Stopped);
                    self.shutdown();
                }
                self.reply_ok(name);
                return false;
            }

            HostCommand::Interrupt {} => {
                info!("Interrupt requested");
                if let Some(cancel) = &self.inflight {
                    cancel.cancel();
                }
                self.tts.stop();
                self.pending = None;
                if matches!(self.status, Status::Processing | Status::Speaking) {
                    self.set_status(Status::Listening);
                }
                self.reply_ok(name);
            }

            HostCommand::ClearConversation {} => match self.conversation.try_lock() {
                Ok(mut convo) => {
                    convo.clear();
                    self.reply_ok(name);
                }
                Err(_) => {
                    self.reply_err(name, "conversation is busy");
                }
            },

            HostCommand::GetStatus {} => {
                let summary = match self.conversation.try_lock() {
                    Ok(convo) => json!({
                        "turns": convo.turns(),
                        "approx_tokens": convo.token_estimate(),
                        "idle_seconds": convo.idle_seconds(),
                    }),
                    Err(_) => json!(null),
                };
                let payload = json!({
                    "status": self.status,
                    "conversation": summary,
                });
                let _ = self.outbound.send(reply(name, true, payload));
            }

            HostCommand::GetMetrics {} => {
                let snapshot = self.metrics.snapshot();
                let payload = json!({ "metrics": snapshot });
                let _ = self.outbound.send(reply(name, true, payload));
            }

            HostCommand::TriggerHotkey {} => match &self.hotkey_tx {
                Some(tx) if tx.try_send(()).is_ok() => self.reply_ok(name),
                Some(_) => self.reply_err(name, "audio pipeline is not accepting input"),
                None => self.reply_err(name, "audio pipeline is not running"),
            },

            HostCommand::Reset {} => {
                // The FSM's ERROR → IDLE edge; harmless anywhere else.
                if self.status == Status::Error {
                    self.set_status(Status::Idle);
                }
                self.reply_ok(name);
            }

            HostCommand::Ping {} => self.reply_ok(name),

            HostCommand::ListAudioDevices {} => {
                let payload = json!({
                    "input": audio::list_devices(),
                    "output": audio::list_output_devices(),
                });
                let _ = self.outbound.send(reply(name, true, payload));
            }

            HostCommand::Speak { text } => {
                // Host-driven speech outside the conversation.
                let tts = Arc::clone(&self.tts);
                let cancel = CancellationToken::new();
                tokio::spawn(async move {
                    if let Err(e) = tts.speak(&text, &cancel).await {
                        warn!("Host speak failed: {}", e);
                    }
                });
                self.reply_ok(name);
            }
        }
        true
    }

    fn reply_ok(&self, name: &str) {
        let _ = self.outbound.send(reply(name, true, json!({})));
    }

    fn reply_err(&self, name: &str, message: &str) {
        let _ = self
            .outbound
            .send(reply(name, false, json!({ "error": message })));
    }

    // ── Audio events ────────────────────────────────────────────────────

    fn handle_audio_event(&mut self, event: AudioEvent) {
        match event {
            AudioEvent::WakeWord { ts_ms } => {
                self.emit(HostEvent::WakeWordDetected { ts: ts_ms });
            }
            AudioEvent::Hotkey { ts_ms } => {
                self.emit(HostEvent::HotkeyTriggered { ts: ts_ms });
            }
            AudioEvent::UtteranceReady(utterance) => self.handle_utterance(utterance),
        }
    }

    fn handle_utterance(&mut self, utterance: Utterance) {
        if self.inflight.is_some() {
            self.apply_backpressure(utterance);
            return;
        }
        match self.status {
            Status::Listening => self.start_processing(utterance),
            other => {
                debug!(status = %other, "Utterance discarded — not listening");
            }
        }
    }

    /// One request is already running; queue (depth 1) or drop.
    fn apply_backpressure(&mut self, utterance: Utterance) {
        match self.config.backpressure {
            BackpressurePolicy::DropNewest => {
                warn!("Utterance dropped (drop_newest) — pipeline busy");
                self.metrics.inc_counter(UTTERANCES_DROPPED_COUNTER);
            }
            BackpressurePolicy::Coalesce => {
                if self.pending.is_none() {
                    self.pending = Some(utterance);
                } else {
                    warn!("Utterance dropped (coalesce queue full)");
                    self.metrics.inc_counter(UTTERANCES_DROPPED_COUNTER);
                }
            }
            BackpressurePolicy::DropOldest => {
                if self.pending.is_some() {
                    self.metrics.inc_counter(UTTERANCES_DROPPED_COUNTER);
                }
                self.pending = Some(utterance);
            }
        }
    }

    fn start_processing(&mut self, utterance: Utterance) {
        // Status line goes out before the request starts.
        self.set_status(Status::Processing);

        let cancel = CancellationToken::new();
        self.inflight = Some(cancel.clone());

        let executor = Arc::clone(&self.executor);
        let results_tx = self.results_tx.clone();
        tokio::spawn(async move {
            let result = executor.run(utterance, cancel).await;
            let _ = results_tx.send(result);
        });
    }

    // ── Pipeline feedback ───────────────────────────────────────────────

    fn handle_signal(&mut self, signal: PipelineSignal) {
        match signal {
            PipelineSignal::StageError { kind, message, .. } => {
                self.emit(HostEvent::Error { kind, message });
            }
            PipelineSignal::Speaking => {
                if self.status == Status::Processing {
                    self.set_status(Status::Speaking);
                }
            }
        }
    }

    fn handle_result(&mut self, result: PipelineResult) {
        self.inflight = None;

        let cancelled = result.error_kind.as_deref() == Some("Cancelled");
        if cancelled {
            // An interrupted request completes silently; interrupt already
            // moved the status.
            debug!("Pipeline request cancelled");
        } else {
            self.emit(HostEvent::ProcessingComplete {
                success: result.success,
                transcription: result.transcription,
                response: result.response_text,
                duration_ms: result.duration_ms,
            });
        }

        if matches!(self.status, Status::Processing | Status::Speaking) {
            if self.config.auto_relisten {
                self.set_status(Status::Listening);
            } else {
                self.set_status(Status::Idle);
            }
        }

        // A queued utterance (coalesce/drop_oldest) starts now.
        if let Some(next) = self.pending.take() {
            if self.status == Status::Listening {
                self.start_processing(next);
            }
        }
    }

    fn handle_capture(&mut self, capture: CaptureStatus) {
        match capture {
            CaptureStatus::Up => debug!("Capture up"),
            CaptureStatus::Down { reason } => {
                warn!("Capture down: {} — reconnecting", reason);
            }
            CaptureStatus::Fatal { reason } => {
                // Permission denied: nothing to reconnect to.
                self.emit(HostEvent::Error {
                    kind: "AudioCaptureFailed".to_string(),
                    message: reason,
                });
                self.set_status(Status::Error);
            }
        }
    }

    fn session_tick(&mut self) {
        if let Ok(mut convo) = self.conversation.try_lock() {
            if convo.tick(Instant::now()) {
                self.emit(HostEvent::SessionExpired {});
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(cancel) = &self.inflight {
            cancel.cancel();
        }
        self.tts.stop();
        self.audio_cancel.cancel();
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationState;
    use crate::llm::mock::{MockStep, ScriptedProvider};
    use crate::llm::CompletionResult;
    use crate::pipeline::ExecutorSettings;
    use crate::recovery::RetryPolicy;
    use crate::stt::MockStt;
    use crate::tools::{sandbox::Sandbox, ToolRegistry};
    use crate::tts::MockTts;

    const RATE: u32 = 16_000;

    struct Harness {
        outbound_rx: mpsc::UnboundedReceiver<HostLine>,
        cmd_tx: mpsc::UnboundedSender<HostCommand>,
        events_tx: mpsc::Sender<AudioEvent>,
        metrics: Arc<Metrics>,
        tts: Arc<MockTts>,
        _task: tokio::task::JoinHandle<()>,
    }

    fn utterance() -> Utterance {
        Utterance::new(vec![0i16; 16_000], RATE, 0)
    }

    /// Build a full orchestrator around scripted engines and spawn its loop.
    fn harness(
        provider: ScriptedProvider,
        tts_playback: Duration,
        config: OrchestratorConfig,
    ) -> Harness {
        let metrics = Metrics::new(true);
        let conversation: SharedConversation = Arc::new(tokio::sync::Mutex::new(
            ConversationState::new(None, 10, 4096, Duration::from_secs(1800)),
        ));
        let tts = Arc::new(MockTts::new(tts_playback));
        let registry = Arc::new(ToolRegistry::new(
            Sandbox::with_roots(vec![std::env::temp_dir()], vec![]),
            None,
        ));

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let executor = Arc::new(
            PipelineExecutor::new(
                Arc::new(MockStt::fixed("what time is it", 1.0)),
                Box::new(provider),
                None,
                registry,
                tts.clone() as Arc<dyn Tts>,
                Arc::clone(&conversation),
                Arc::clone(&metrics),
                ExecutorSettings {
                    language: "en".to_string(),
                    stt_timeout: Duration::from_secs(10),
                    temperature: 0.7,
                    max_tokens: 256,
                    max_tool_iterations: 5,
                    retry: RetryPolicy::new(3),
                },
            )
            .with_signals(signals_tx),
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(4);
        let (_capture_tx, capture_rx) = mpsc::unbounded_channel();

        let (orchestrator, results_rx) = Orchestrator::new(
            executor,
            tts.clone() as Arc<dyn Tts>,
            conversation,
            Arc::clone(&metrics),
            outbound_tx,
            config,
            None,
            CancellationToken::new(),
        );

        let task = tokio::spawn(orchestrator.run(
            cmd_rx,
            events_rx,
            signals_rx,
            capture_rx,
            results_rx,
        ));

        Harness {
            outbound_rx,
            cmd_tx,
            events_tx,
            metrics,
            tts,
            _task: task,
        }
    }

    /// Drain outbound lines until `pred` matches or the timeout hits.
    async fn wait_for_line(
        rx: &mut mpsc::UnboundedReceiver<HostLine>,
        seen: &mut Vec<HostLine>,
        pred: impl Fn(&HostLine) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(line)) => {
                    let matched = pred(&line);
                    seen.push(line);
                    if matched {
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    fn is_status(line: &HostLine, status: Status) -> bool {
        matches!(line, HostLine::Status { status: s, .. } if *s == status)
    }

    fn is_processing_complete(line: &HostLine) -> bool {
        matches!(line, HostLine::Event(HostEvent::ProcessingComplete { .. }))
    }

    /// Send `start` and wait until the orchestrator is actually listening,
    /// so a following utterance cannot race the command.
    async fn start_listening(h: &mut Harness, seen: &mut Vec<HostLine>) {
        h.cmd_tx.send(HostCommand::Start {}).unwrap();
        assert!(wait_for_line(&mut h.outbound_rx, seen, |l| is_status(l, Status::Listening)).await);
    }

    #[tokio::test]
    async fn simple_qa_flow_emits_statuses_and_completion() {
        // S1: listening → processing → speaking → listening, then the
        // completion event with transcription and response.
        let provider = ScriptedProvider::always(CompletionResult::text_only("It is 3:45 PM"));
        let mut h = harness(provider, Duration::from_millis(20), OrchestratorConfig::default());

        let mut seen = Vec::new();
        start_listening(&mut h, &mut seen).await;
        h.events_tx.send(AudioEvent::UtteranceReady(utterance())).await.unwrap();

        assert!(wait_for_line(&mut h.outbound_rx, &mut seen, is_processing_complete).await);
        // The trailing transition back to listening follows the event.
        assert!(
            wait_for_line(&mut h.outbound_rx, &mut seen, |l| is_status(
                l,
                Status::Listening
            ))
            .await
        );

        // Status order: idle, listening, processing, speaking, listening.
        let statuses: Vec<Status> = seen
            .iter()
            .filter_map(|l| match l {
                HostLine::Status { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                Status::Idle,
                Status::Listening,
                Status::Processing,
                Status::Speaking,
                Status::Listening
            ]
        );

        // P7: the processing status precedes the completion event.
        let processing_idx = seen
            .iter()
            .position(|l| is_status(l, Status::Processing))
            .unwrap();
        let complete_idx = seen.iter().position(is_processing_complete).unwrap();
        assert!(processing_idx < complete_idx);

        match &seen[complete_idx] {
            HostLine::Event(HostEvent::ProcessingComplete {
                success,
                transcription,
                response,
                ..
            }) => {
                assert!(success);
                assert_eq!(transcription.as_deref(), Some("what time is it"));
                assert_eq!(response.as_deref(), Some("It is 3:45 PM"));
            }
            other => panic!("unexpected line {other:?}"),
        }

        assert_eq!(h.tts.spoken(), vec!["It is 3:45 PM".to_string()]);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        // P6: a second stop on a STOPPED orchestrator is a no-op.
        let provider = ScriptedProvider::always(CompletionResult::text_only("ok"));
        let metrics = Metrics::new(true);
        let conversation: SharedConversation = Arc::new(tokio::sync::Mutex::new(
            ConversationState::new(None, 10, 4096, Duration::from_secs(1800)),
        ));
        let tts = Arc::new(MockTts::new(Duration::ZERO));
        let registry = Arc::new(ToolRegistry::new(
            Sandbox::with_roots(vec![std::env::temp_dir()], vec![]),
            None,
        ));
        let executor = Arc::new(PipelineExecutor::new(
            Arc::new(MockStt::fixed("hi", 1.0)),
            Box::new(provider),
            None,
            registry,
            tts.clone() as Arc<dyn Tts>,
            Arc::clone(&conversation),
            Arc::clone(&metrics),
            ExecutorSettings {
                language: "en".to_string(),
                stt_timeout: Duration::from_secs(10),
                temperature: 0.7,
                max_tokens: 256,
                max_tool_iterations: 5,
                retry: RetryPolicy::new(3),
            },
        ));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (mut orchestrator, _results_rx) = Orchestrator::new(
            executor,
            tts as Arc<dyn Tts>,
            conversation,
            metrics,
            outbound_tx,
            OrchestratorConfig::default(),
            None,
            CancellationToken::new(),
        );

        assert!(!orchestrator.handle_command(HostCommand::Stop {}).await);
        assert_eq!(orchestrator.status(), Status::Stopped);

        // Drain lines from the first stop.
        let mut first_count = 0;
        while outbound_rx.try_recv().is_ok() {
            first_count += 1;
        }
        assert!(first_count >= 2); // status + reply

        assert!(!orchestrator.handle_command(HostCommand::Stop {}).await);
        assert_eq!(orchestrator.status(), Status::Stopped);
        // Second stop: only the acknowledgment, no status change.
        let mut second_lines = Vec::new();
        while let Ok(line) = outbound_rx.try_recv() {
            second_lines.push(line);
        }
        assert_eq!(second_lines.len(), 1);
        assert!(matches!(second_lines[0], HostLine::Reply(_)));
    }

    #[tokio::test]
    async fn backpressure_drop_newest_processes_first_only() {
        // P9: K utterances while busy → 1 processed, K−1 dropped and
        // counted.
        let provider = ScriptedProvider::always(CompletionResult::text_only("slow answer"))
            .with_delay(Duration::from_millis(300));
        let mut h = harness(provider, Duration::ZERO, OrchestratorConfig::default());

        let mut seen = Vec::new();
        start_listening(&mut h, &mut seen).await;
        h.events_tx.send(AudioEvent::UtteranceReady(utterance())).await.unwrap();

        // Give the first utterance time to enter PROCESSING.
        assert!(
            wait_for_line(&mut h.outbound_rx, &mut seen, |l| is_status(
                l,
                Status::Processing
            ))
            .await
        );

        for _ in 0..3 {
            h.events_tx.send(AudioEvent::UtteranceReady(utterance())).await.unwrap();
        }

        assert!(wait_for_line(&mut h.outbound_rx, &mut seen, is_processing_complete).await);
        // Exactly one completion, three drops.
        let completions = seen.iter().filter(|l| is_processing_complete(l)).count();
        assert_eq!(completions, 1);
        assert_eq!(h.metrics.counter(UTTERANCES_DROPPED_COUNTER), 3);

        // No second completion arrives afterwards.
        let mut more = Vec::new();
        let _ = tokio::time::timeout(
            Duration::from_millis(200),
            wait_for_line(&mut h.outbound_rx, &mut more, is_processing_complete),
        )
        .await;
        assert_eq!(more.iter().filter(|l| is_processing_complete(l)).count(), 0);
    }

    #[tokio::test]
    async fn coalesce_queues_exactly_one() {
        let provider = ScriptedProvider::always(CompletionResult::text_only("answer"))
            .with_delay(Duration::from_millis(200));
        let config = OrchestratorConfig {
            backpressure: BackpressurePolicy::Coalesce,
            ..Default::default()
        };
        let mut h = harness(provider, Duration::ZERO, config);

        let mut seen = Vec::new();
        start_listening(&mut h, &mut seen).await;
        h.events_tx.send(AudioEvent::UtteranceReady(utterance())).await.unwrap();

        assert!(
            wait_for_line(&mut h.outbound_rx, &mut seen, |l| is_status(
                l,
                Status::Processing
            ))
            .await
        );

        // Two more: one queued, one dropped.
        h.events_tx.send(AudioEvent::UtteranceReady(utterance())).await.unwrap();
        h.events_tx.send(AudioEvent::UtteranceReady(utterance())).await.unwrap();

        // Both the first and the queued utterance complete.
        assert!(wait_for_line(&mut h.outbound_rx, &mut seen, is_processing_complete).await);
        assert!(wait_for_line(&mut h.outbound_rx, &mut seen, is_processing_complete).await);
        assert_eq!(h.metrics.counter(UTTERANCES_DROPPED_COUNTER), 1);
    }

    #[tokio::test]
    async fn interrupt_during_speaking_stops_tts_and_relistens() {
        // S6/P8: interrupt mid-speech → no completion event, status back to
        // listening, playback stops promptly.
        let provider = ScriptedProvider::always(CompletionResult::text_only(
            "a very long answer that takes five seconds to speak",
        ));
        let mut h = harness(provider, Duration::from_secs(5), OrchestratorConfig::default());

        let mut seen = Vec::new();
        start_listening(&mut h, &mut seen).await;
        h.events_tx.send(AudioEvent::UtteranceReady(utterance())).await.unwrap();

        assert!(
            wait_for_line(&mut h.outbound_rx, &mut seen, |l| is_status(
                l,
                Status::Speaking
            ))
            .await
        );

        let interrupted_at = std::time::Instant::now();
        h.cmd_tx.send(HostCommand::Interrupt {}).unwrap();

        // Status returns to listening promptly.
        assert!(
            wait_for_line(&mut h.outbound_rx, &mut seen, |l| is_status(
                l,
                Status::Listening
            ))
            .await
        );
        assert!(interrupted_at.elapsed() < Duration::from_millis(500));

        // No processing_complete for the interrupted request.
        let mut more = Vec::new();
        let _ = tokio::time::timeout(
            Duration::from_millis(300),
            wait_for_line(&mut h.outbound_rx, &mut more, is_processing_complete),
        )
        .await;
        assert_eq!(
            seen.iter()
                .chain(more.iter())
                .filter(|l| is_processing_complete(l))
                .count(),
            0
        );
    }

    #[tokio::test]
    async fn utterances_while_idle_are_discarded_silently() {
        let provider = ScriptedProvider::always(CompletionResult::text_only("no"));
        let mut h = harness(provider, Duration::ZERO, OrchestratorConfig::default());

        // No start command: status stays idle.
        h.events_tx.send(AudioEvent::UtteranceReady(utterance())).await.unwrap();

        let mut seen = Vec::new();
        let got = tokio::time::timeout(
            Duration::from_millis(300),
            wait_for_line(&mut h.outbound_rx, &mut seen, is_processing_complete),
        )
        .await;
        assert!(got.is_err() || !got.unwrap());
        assert_eq!(h.metrics.counter(UTTERANCES_DROPPED_COUNTER), 0);
    }

    #[tokio::test]
    async fn llm_timeouts_surface_as_error_events_then_success() {
        // S4: two timeouts retried, then success; two error EVENTs plus a
        // successful completion.
        let provider = ScriptedProvider::with_fallback(
            vec![MockStep::Timeout, MockStep::Timeout],
            CompletionResult::text_only("ok after retries"),
        );
        let mut h = harness(provider, Duration::ZERO, OrchestratorConfig::default());

        let mut seen = Vec::new();
        start_listening(&mut h, &mut seen).await;
        h.events_tx.send(AudioEvent::UtteranceReady(utterance())).await.unwrap();

        assert!(wait_for_line(&mut h.outbound_rx, &mut seen, is_processing_complete).await);

        let timeout_events = seen
            .iter()
            .filter(|l| {
                matches!(
                    l,
                    HostLine::Event(HostEvent::Error { kind, .. }) if kind == "LlmTimeout"
                )
            })
            .count();
        assert_eq!(timeout_events, 2);

        match seen.iter().find(|l| is_processing_complete(l)).unwrap() {
            HostLine::Event(HostEvent::ProcessingComplete { success, response, .. }) => {
                assert!(success);
                assert_eq!(response.as_deref(), Some("ok after retries"));
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn get_status_reports_conversation_summary() {
        let provider = ScriptedProvider::always(CompletionResult::text_only("hi"));
        let mut h = harness(provider, Duration::ZERO, OrchestratorConfig::default());

        h.cmd_tx.send(HostCommand::GetStatus {}).unwrap();
        let mut seen = Vec::new();
        assert!(
            wait_for_line(&mut h.outbound_rx, &mut seen, |l| {
                matches!(l, HostLine::Reply(v) if v["response"] == "get_status")
            })
            .await
        );
        let HostLine::Reply(v) = seen.last().unwrap() else {
            unreachable!()
        };
        assert_eq!(v["ok"], true);
        assert_eq!(v["conversation"]["turns"], 0);
    }

    #[tokio::test]
    async fn session_tick_expires_and_notifies() {
        let provider = ScriptedProvider::always(CompletionResult::text_only("hello"));
        let config = OrchestratorConfig {
            session_tick: Duration::from_millis(50),
            ..Default::default()
        };
        // Short session timeout through a custom conversation.
        let metrics = Metrics::new(true);
        let conversation: SharedConversation = Arc::new(tokio::sync::Mutex::new(
            ConversationState::new(None, 10, 4096, Duration::from_millis(20)),
        ));
        {
            let mut convo = conversation.try_lock().unwrap();
            convo.add_user("stale message");
        }
        let tts = Arc::new(MockTts::new(Duration::ZERO));
        let registry = Arc::new(ToolRegistry::new(
            Sandbox::with_roots(vec![std::env::temp_dir()], vec![]),
            None,
        ));
        let executor = Arc::new(PipelineExecutor::new(
            Arc::new(MockStt::fixed("hi", 1.0)),
            Box::new(provider),
            None,
            registry,
            tts.clone() as Arc<dyn Tts>,
            Arc::clone(&conversation),
            Arc::clone(&metrics),
            ExecutorSettings {
                language: "en".to_string(),
                stt_timeout: Duration::from_secs(10),
                temperature: 0.7,
                max_tokens: 256,
                max_tool_iterations: 5,
                retry: RetryPolicy::new(3),
            },
        ));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (_events_tx, events_rx) = mpsc::channel(4);
        let (_signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (_capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (orchestrator, results_rx) = Orchestrator::new(
            executor,
            tts as Arc<dyn Tts>,
            Arc::clone(&conversation),
            metrics,
            outbound_tx,
            config,
            None,
            CancellationToken::new(),
        );
        let _task = tokio::spawn(orchestrator.run(
            cmd_rx,
            events_rx,
            signals_rx,
            capture_rx,
            results_rx,
        ));

        let mut seen = Vec::new();
        assert!(
            wait_for_line(&mut outbound_rx, &mut seen, |l| {
                matches!(l, HostLine::Event(HostEvent::SessionExpired {}))
            })
            .await
        );
        assert!(conversation.try_lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fatal_capture_error_moves_to_error_status() {
        let provider = ScriptedProvider::always(CompletionResult::text_only("hi"));
        let metrics = Metrics::new(true);
        let conversation: SharedConversation = Arc::new(tokio::sync::Mutex::new(
            ConversationState::new(None, 10, 4096, Duration::from_secs(1800)),
        ));
        let tts = Arc::new(MockTts::new(Duration::ZERO));
        let registry = Arc::new(ToolRegistry::new(
            Sandbox::with_roots(vec![std::env::temp_dir()], vec![]),
            None,
        ));
        let executor = Arc::new(PipelineExecutor::new(
            Arc::new(MockStt::fixed("hi", 1.0)),
            Box::new(provider),
            None,
            registry,
            tts.clone() as Arc<dyn Tts>,
            Arc::clone(&conversation),
            Arc::clone(&metrics),
            ExecutorSettings {
                language: "en".to_string(),
                stt_timeout: Duration::from_secs(10),
                temperature: 0.7,
                max_tokens: 256,
                max_tool_iterations: 5,
                retry: RetryPolicy::new(3),
            },
        ));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (_events_tx, events_rx) = mpsc::channel(4);
        let (_signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (orchestrator, results_rx) = Orchestrator::new(
            executor,
            tts as Arc<dyn Tts>,
            conversation,
            metrics,
            outbound_tx,
            OrchestratorConfig::default(),
            None,
            CancellationToken::new(),
        );
        let _task = tokio::spawn(orchestrator.run(
            cmd_rx,
            events_rx,
            signals_rx,
            capture_rx,
            results_rx,
        ));

        capture_tx
            .send(CaptureStatus::Fatal {
                reason: "microphone access denied".to_string(),
            })
            .unwrap();

        let mut seen = Vec::new();
        assert!(
            wait_for_line(&mut outbound_rx, &mut seen, |l| is_status(l, Status::Error)).await
        );
        assert!(seen.iter().any(|l| matches!(
            l,
            HostLine::Event(HostEvent::Error { kind, .. }) if kind == "AudioCaptureFailed"
        )));
    }
}
