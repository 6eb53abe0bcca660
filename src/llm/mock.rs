//! Scripted provider for tests and offline/dev runs.
//!
//! Steps are consumed in order; when the script runs out, the fallback
//! result (if any) repeats forever. Call counts and received message
//! snapshots let tests assert on what the pipeline actually sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::conversation::Message;
use crate::error::StageError;
use crate::tools::ToolDefinition;

use super::{CompletionResult, LlmProvider};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum MockStep {
    Ok(CompletionResult),
    Timeout,
    Unavailable(String),
    Invalid(String),
}

pub struct ScriptedProvider {
    steps: Mutex<VecDeque<MockStep>>,
    /// Used when the script is exhausted.
    fallback: Option<CompletionResult>,
    calls: AtomicU32,
    /// Message-list snapshots of every `complete` call.
    received: Mutex<Vec<Vec<Message>>>,
    /// Simulated latency per call.
    delay: std::time::Duration,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: None,
            calls: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
            delay: std::time::Duration::ZERO,
        }
    }

    /// Repeat one result forever.
    pub fn always(result: CompletionResult) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: Some(result),
            calls: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
            delay: std::time::Duration::ZERO,
        }
    }

    /// Play the script, then repeat `fallback` forever.
    pub fn with_fallback(steps: Vec<MockStep>, fallback: CompletionResult) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: Some(fallback),
            calls: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
            delay: std::time::Duration::ZERO,
        }
    }

    /// Simulate per-call latency (for backpressure and interrupt tests).
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    /// How many `complete` calls this provider has served.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Message snapshot of call `index`.
    pub fn received_at(&self, index: usize) -> Option<Vec<Message>> {
        self.received
            .lock()
            .ok()
            .and_then(|r| r.get(index).cloned())
    }

    /// Messages of the most recent call.
    pub fn last_received(&self) -> Option<Vec<Message>> {
        self.received.lock().ok().and_then(|r| r.last().cloned())
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<CompletionResult, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut received) = self.received.lock() {
            received.push(messages.to_vec());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self
            .steps
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front());

        match step {
            Some(MockStep::Ok(result)) => Ok(result),
            Some(MockStep::Timeout) => Err(StageError::LlmTimeout),
            Some(MockStep::Unavailable(reason)) => Err(StageError::LlmUnavailable(reason)),
            Some(MockStep::Invalid(reason)) => Err(StageError::LlmInvalidResponse(reason)),
            None => match &self.fallback {
                Some(result) => Ok(result.clone()),
                None => Err(StageError::LlmUnavailable(
                    "mock script exhausted".to_string(),
                )),
            },
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
