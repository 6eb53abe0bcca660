//! Pipeline executor: one utterance in, one spoken (and tool-executed)
//! response out.
//!
//! Stages run strictly in sequence — transcribe, append the user turn,
//! the LLM/tool fixed point, the final assistant turn, speech — each
//! wrapped in a metrics timer and the recovery policy. The executor holds
//! the conversation's write lease from the user-turn append until the
//! final assistant turn; cancellation is checked at every stage boundary
//! and never rolls back already-appended messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::Utterance;
use crate::conversation::{ConversationState, Message};
use crate::error::StageError;
use crate::llm::{CompletionResult, LlmProvider};
use crate::metrics::Metrics;
use crate::recovery::{RetryPolicy, APOLOGY_REPEAT, APOLOGY_TROUBLE};
use crate::stt::SttEngine;
use crate::tools::{ToolRegistry, ToolResult};
use crate::tts::{SpeakOutcome, Tts};

/// Transcripts below this confidence are treated as not understood.
pub const MIN_STT_CONFIDENCE: f32 = 0.5;

/// Synthetic call id used when repairing a malformed tool-call response.
const REPAIR_CALL_ID: &str = "repair";

/// Conversation state shared with the orchestrator; the executor takes the
/// lock for the duration of a request's mutation window.
pub type SharedConversation = Arc<Mutex<ConversationState>>;

/// Signals from a running request to the orchestrator: non-fatal stage
/// problems (retried timeouts and the like, surfaced to the host as EVENT
/// lines) and the transition into speech playback.
#[derive(Debug, Clone)]
pub enum PipelineSignal {
    StageError {
        stage: String,
        kind: String,
        message: String,
    },
    /// The final response text is about to be spoken.
    Speaking,
}

/// Outcome of one pipeline request.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    /// Correlates log lines and host events for one request.
    pub request_id: String,
    pub success: bool,
    /// True when a failure was absorbed by policy (re-prompt, cancel).
    pub recovered: bool,
    pub transcription: Option<String>,
    pub response_text: Option<String>,
    pub duration_ms: u64,
    pub stage_timings_ms: HashMap<String, u64>,
    pub error_kind: Option<String>,
}

/// Everything the executor needs besides its collaborators.
pub struct ExecutorSettings {
    pub language: String,
    pub stt_timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_tool_iterations: usize,
    pub retry: RetryPolicy,
}

pub struct PipelineExecutor {
    stt: Arc<dyn SttEngine>,
    provider: Box<dyn LlmProvider>,
    fallback: Option<Box<dyn LlmProvider>>,
    tools: Arc<ToolRegistry>,
    tts: Arc<dyn Tts>,
    conversation: SharedConversation,
    metrics: Arc<Metrics>,
    settings: ExecutorSettings,
    signals: Option<mpsc::UnboundedSender<PipelineSignal>>,
}

impl PipelineExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stt: Arc<dyn SttEngine>,
        provider: Box<dyn LlmProvider>,
        fallback: Option<Box<dyn LlmProvider>>,
        tools: Arc<ToolRegistry>,
        tts: Arc<dyn Tts>,
        conversation: SharedConversation,
        metrics: Arc<Metrics>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            stt,
            provider,
            fallback,
            tools,
            tts,
            conversation,
            metrics,
            settings,
            signals: None,
        }
    }

    /// Attach a sink for pipeline signals.
    pub fn with_signals(mut self, tx: mpsc::UnboundedSender<PipelineSignal>) -> Self {
        self.signals = Some(tx);
        self
    }

    fn signal(&self, signal: PipelineSignal) {
        if let Some(tx) = &self.signals {
            let _ = tx.send(signal);
        }
    }

    fn notify(&self, stage: &str, error: &StageError) {
        self.metrics.record_error(stage, error.kind(), &error.to_string());
        self.signal(PipelineSignal::StageError {
            stage: stage.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }

    /// Process one utterance end to end.
    pub async fn run(&self, utterance: Utterance, cancel: CancellationToken) -> PipelineResult {
        let request_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut timings: HashMap<String, u64> = HashMap::new();
        let mut e2e = self.metrics.timer("e2e");
        info!(%request_id, duration_ms = utterance.duration_ms, "Pipeline request started");

        // ── Transcribe ───────────────────────────────────────────────────
        let transcript = match self.transcribe(&utterance, &cancel, &mut timings).await {
            Ok(t) => t,
            Err(e) => {
                return self
                    .fail(&request_id, e, None, started, timings, &cancel)
                    .await;
            }
        };
        info!(text = %transcript, "Transcription complete");

        // ── Conversation mutation window (write lease) ───────────────────
        let final_text = {
            let mut convo = self.conversation.lock().await;
            convo.add_user(transcript.clone());

            match self.tool_fixed_point(&mut convo, &cancel, &mut timings).await {
                Ok(text) => {
                    convo.add_assistant(text.clone(), Vec::new());
                    text
                }
                Err(e) => {
                    // Partial context stays — it is legitimate history.
                    drop(convo);
                    return self
                        .fail(&request_id, e, Some(transcript), started, timings, &cancel)
                        .await;
                }
            }
        };

        // ── Speak ────────────────────────────────────────────────────────
        self.signal(PipelineSignal::Speaking);
        let speak_outcome = self.speak(&final_text, &cancel, &mut timings).await;
        if matches!(speak_outcome, SpeakOutcome::Cancelled) {
            return self
                .fail(
                    &request_id,
                    StageError::Cancelled,
                    Some(transcript),
                    started,
                    timings,
                    &cancel,
                )
                .await;
        }

        e2e.succeed();
        timings.insert("e2e".to_string(), started.elapsed().as_millis() as u64);
        self.metrics.record_request(true);

        PipelineResult {
            request_id,
            success: true,
            recovered: false,
            transcription: Some(transcript),
            response_text: Some(final_text),
            duration_ms: started.elapsed().as_millis() as u64,
            stage_timings_ms: timings,
            error_kind: None,
        }
    }

    // ── Stages ──────────────────────────────────────────────────────────

    async fn transcribe(
        &self,
        utterance: &Utterance,
        cancel: &CancellationToken,
        timings: &mut HashMap<String, u64>,
    ) -> Result<String, StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let mut timer = self.metrics.timer("stt");
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            r = tokio::time::timeout(
                self.settings.stt_timeout,
                self.stt.transcribe(&utterance.pcm, utterance.sample_rate, &self.settings.language),
            ) => r,
        };
        timings.insert("stt".to_string(), timer.elapsed().as_millis() as u64);

        let transcript = match result {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => {
                warn!("Transcription failed: {}", e);
                return Err(StageError::SttEmpty);
            }
            Err(_) => {
                warn!(timeout = ?self.settings.stt_timeout, "Transcription timed out");
                return Err(StageError::SttEmpty);
            }
        };

        if transcript.text.trim().is_empty() {
            return Err(StageError::SttEmpty);
        }
        if transcript.confidence < MIN_STT_CONFIDENCE {
            return Err(StageError::SttLowConfidence {
                confidence: transcript.confidence,
            });
        }

        timer.succeed();
        Ok(transcript.text.trim().to_string())
    }

    /// The LLM/tool loop: at most `max_tool_iterations` tool rounds, then
    /// one forced tool-free completion. Returns the final response text.
    async fn tool_fixed_point(
        &self,
        convo: &mut ConversationState,
        cancel: &CancellationToken,
        timings: &mut HashMap<String, u64>,
    ) -> Result<String, StageError> {
        let tool_defs = self.tools.list();
        let mut use_fallback = false;

        for round in 0..self.settings.max_tool_iterations {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }

            let completion = self
                .llm_round(convo, &tool_defs, &mut use_fallback, cancel, timings)
                .await?;

            if completion.tool_calls.is_empty() {
                return Ok(completion.text);
            }

            debug!(
                round,
                calls = completion.tool_calls.len(),
                "Executing tool calls"
            );
            convo.add_assistant(completion.text.clone(), completion.tool_calls.clone());

            let results = self
                .execute_tools(&completion, cancel, timings)
                .await?;
            for (call, result) in completion.tool_calls.iter().zip(results) {
                convo.add_tool_result(&result.call_id, result.content, Some(&call.name));
            }
        }

        // Iteration budget spent: one last completion with tools withheld.
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        info!(
            iterations = self.settings.max_tool_iterations,
            "Tool budget exhausted — forcing final answer"
        );
        let completion = self
            .forced_final(convo, &mut use_fallback, cancel, timings)
            .await?;
        Ok(completion.text)
    }

    /// One completion over the current conversation, with retry, fallback
    /// switching, and the single malformed-response repair.
    async fn llm_round(
        &self,
        convo: &mut ConversationState,
        tool_defs: &[crate::tools::ToolDefinition],
        use_fallback: &mut bool,
        cancel: &CancellationToken,
        timings: &mut HashMap<String, u64>,
    ) -> Result<CompletionResult, StageError> {
        let messages = convo.messages();
        match self
            .complete_with_recovery(&messages, tool_defs, use_fallback, cancel, timings)
            .await
        {
            Ok(c) => Ok(c),
            Err(StageError::LlmInvalidResponse(reason)) => {
                // Give the model one shot at repairing its own output: feed
                // the validation error back as a failed tool round.
                warn!(%reason, "Malformed completion — requesting a repair");
                convo.add_assistant(
                    String::new(),
                    vec![crate::tools::ToolCall {
                        id: REPAIR_CALL_ID.to_string(),
                        name: "invalid_response".to_string(),
                        arguments: serde_json::Map::new(),
                    }],
                );
                convo.add_tool_result(
                    REPAIR_CALL_ID,
                    format!("Your previous response was invalid: {reason}. Answer again."),
                    None,
                );
                let messages = convo.messages();
                self.complete_with_recovery(&messages, tool_defs, use_fallback, cancel, timings)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Final completion after the tool budget: tools withheld, with an
    /// explicit nudge that is not persisted into the conversation.
    async fn forced_final(
        &self,
        convo: &mut ConversationState,
        use_fallback: &mut bool,
        cancel: &CancellationToken,
        timings: &mut HashMap<String, u64>,
    ) -> Result<CompletionResult, StageError> {
        let mut messages = convo.messages();
        messages.push(Message::user(
            "No further tools are available. Answer now with what you have.",
        ));
        let mut completion = self
            .complete_with_recovery(&messages, &[], use_fallback, cancel, timings)
            .await?;
        // A model that still asks for tools gets its text taken as-is.
        completion.tool_calls.clear();
        Ok(completion)
    }

    async fn complete_with_recovery(
        &self,
        messages: &[Message],
        tool_defs: &[crate::tools::ToolDefinition],
        use_fallback: &mut bool,
        cancel: &CancellationToken,
        timings: &mut HashMap<String, u64>,
    ) -> Result<CompletionResult, StageError> {
        let mut timer = self.metrics.timer("llm");

        let primary: &dyn LlmProvider = if *use_fallback {
            self.fallback.as_deref().unwrap_or(self.provider.as_ref())
        } else {
            self.provider.as_ref()
        };

        let attempt_result = self
            .settings
            .retry
            .run("llm", cancel, |_attempt| {
                let fut = primary.complete(
                    messages,
                    tool_defs,
                    self.settings.temperature,
                    self.settings.max_tokens,
                );
                async {
                    let result = fut.await;
                    if let Err(e) = &result {
                        if e.is_retryable() {
                            self.notify("llm", e);
                        }
                    }
                    result
                }
            })
            .await;

        let result = match attempt_result {
            Err(e) if e.is_retryable() && !*use_fallback && self.fallback.is_some() => {
                // Switch to the fallback provider for the rest of this
                // request only.
                let fallback = self.fallback.as_deref().unwrap_or(self.provider.as_ref());
                info!(provider = fallback.name(), "Switching to fallback provider");
                *use_fallback = true;
                fallback
                    .complete(
                        messages,
                        tool_defs,
                        self.settings.temperature,
                        self.settings.max_tokens,
                    )
                    .await
            }
            other => other,
        };

        if result.is_ok() {
            timer.succeed();
        }
        *timings.entry("llm".to_string()).or_insert(0) += timer.elapsed().as_millis() as u64;
        result
    }

    /// Dispatch one round's tool calls. Calls run serially unless every
    /// call in the round is parallel-safe; results always come back in
    /// declaration order.
    async fn execute_tools(
        &self,
        completion: &CompletionResult,
        cancel: &CancellationToken,
        timings: &mut HashMap<String, u64>,
    ) -> Result<Vec<ToolResult>, StageError> {
        let calls = &completion.tool_calls;
        let all_parallel = calls.len() > 1
            && calls.iter().all(|c| self.tools.is_parallel_safe(&c.name));

        let mut results = Vec::with_capacity(calls.len());
        if all_parallel {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let futures: Vec<_> = calls.iter().map(|c| self.invoke_timed(c)).collect();
            for (result, elapsed) in futures_util::future::join_all(futures).await {
                *timings.entry("tools".to_string()).or_insert(0) += elapsed;
                results.push(result);
            }
        } else {
            for call in calls {
                if cancel.is_cancelled() {
                    return Err(StageError::Cancelled);
                }
                let (result, elapsed) = self.invoke_timed(call).await;
                *timings.entry("tools".to_string()).or_insert(0) += elapsed;
                results.push(result);
            }
        }

        for result in &results {
            if result.is_error {
                // Tool failures feed back into the loop; the request
                // continues.
                let kind = result.error_kind.as_deref().unwrap_or("ToolExecutionFailed");
                self.metrics.record_error("tool", kind, &result.content);
            }
        }

        Ok(results)
    }

    async fn invoke_timed(&self, call: &crate::tools::ToolCall) -> (ToolResult, u64) {
        let mut timer = self.metrics.timer(&format!("tool.{}", call.name));
        let result = self.tools.invoke(call).await;
        if !result.is_error {
            timer.succeed();
        }
        let elapsed = timer.elapsed().as_millis() as u64;
        (result, elapsed)
    }

    async fn speak(
        &self,
        text: &str,
        cancel: &CancellationToken,
        timings: &mut HashMap<String, u64>,
    ) -> SpeakOutcome {
        let mut timer = self.metrics.timer("tts");
        let outcome = match self.tts.speak(text, cancel).await {
            Ok(outcome) => {
                timer.succeed();
                outcome
            }
            Err(e) => {
                // Spec policy: the text response counts as delivered.
                warn!("Speech synthesis failed: {}", e);
                self.notify("tts", &e);
                SpeakOutcome::Done
            }
        };
        timings.insert("tts".to_string(), timer.elapsed().as_millis() as u64);
        outcome
    }

    /// Shared failure path: record, optionally apologize out loud, and
    /// shape the result.
    async fn fail(
        &self,
        request_id: &str,
        error: StageError,
        transcription: Option<String>,
        started: Instant,
        mut timings: HashMap<String, u64>,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let kind = error.kind().to_string();
        let recovered = matches!(
            error,
            StageError::SttEmpty | StageError::SttLowConfidence { .. } | StageError::Cancelled
        );

        self.notify("pipeline", &error);

        // The user hears a fixed phrase, never the raw error.
        let apology = match &error {
            StageError::Cancelled => None,
            StageError::SttEmpty | StageError::SttLowConfidence { .. } => Some(APOLOGY_REPEAT),
            _ => Some(APOLOGY_TROUBLE),
        };
        if let Some(phrase) = apology {
            if !cancel.is_cancelled() {
                let _ = self.tts.speak(phrase, cancel).await;
            }
        }

        timings.insert("e2e".to_string(), started.elapsed().as_millis() as u64);
        self.metrics.record_request(false);

        PipelineResult {
            request_id: request_id.to_string(),
            success: false,
            recovered,
            transcription,
            response_text: None,
            duration_ms: started.elapsed().as_millis() as u64,
            stage_timings_ms: timings,
            error_kind: Some(kind),
        }
    }
}
