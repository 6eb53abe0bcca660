//! Retry policy and user-facing failure phrasing.
//!
//! Transport-level LLM failures are retried with full-jitter exponential
//! backoff (delay drawn uniformly from [0, base·2^attempt], capped). All
//! other stage errors are policy decisions made inside the executor, not
//! retried here. Spoken apologies are fixed strings — raw error text never
//! reaches the user.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::StageError;

/// Spoken when the transcription was empty or too uncertain.
pub const APOLOGY_REPEAT: &str = "Sorry, I didn't catch that. Could you repeat?";

/// Spoken when the request could not be completed at all.
pub const APOLOGY_TROUBLE: &str = "I'm having trouble right now. Please try again in a moment.";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Full-jitter delay before retry number `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let ceiling = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        ceiling.mul_f64(jitter)
    }

    /// Run `op` with retries on retryable errors. Cancellation is honored
    /// between attempts and during backoff sleeps.
    pub async fn run<T, F, Fut>(
        &self,
        stage: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, StageError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(stage, attempts = attempt, "Retries exhausted: {}", e);
                        return Err(e);
                    }
                    let delay = self.backoff_delay(attempt - 1);
                    info!(
                        stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, backing off: {}",
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(StageError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_stays_within_jitter_window() {
        let policy = RetryPolicy::default();
        for attempt in 0..6 {
            let ceiling = Duration::from_secs(1)
                .saturating_mul(2u32.pow(attempt))
                .min(Duration::from_secs(8));
            for _ in 0..50 {
                let delay = policy.backoff_delay(attempt);
                assert!(delay <= ceiling, "attempt {attempt}: {delay:?} > {ceiling:?}");
            }
        }
    }

    #[test]
    fn backoff_is_capped_at_eight_seconds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            assert!(policy.backoff_delay(30) <= Duration::from_secs(8));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let policy = RetryPolicy::new(3);
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result = policy
            .run("llm", &cancel, |_| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StageError::LlmTimeout)
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(3);
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run("llm", &cancel, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::LlmTimeout) }
            })
            .await;

        assert!(matches!(result, Err(StageError::LlmTimeout)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let policy = RetryPolicy::new(5);
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run("llm", &cancel, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::LlmInvalidResponse("garbage".into())) }
            })
            .await;

        assert!(matches!(result, Err(StageError::LlmInvalidResponse(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let policy = RetryPolicy::new(3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> = policy
            .run("llm", &cancel, |_| async { Ok(()) })
            .await;

        assert!(matches!(result, Err(StageError::Cancelled)));
    }
}
