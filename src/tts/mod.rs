//! Text-to-speech: synthesis adapters and interruptible playback.
//!
//! [`Tts`] is the surface the orchestrator and pipeline see: speak text,
//! honor the cancel token at chunk boundaries, stop on demand. The cloud
//! speaker pairs an HTTP synthesis call with a rodio sink; the mock records
//! what would have been spoken and simulates playback time so interrupt
//! behavior is testable.

pub mod cloud;
pub mod playback;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TtsConfig;
use crate::error::StageError;

/// How a speak call ended. Failures surface as `StageError::TtsFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    Done,
    Cancelled,
}

#[async_trait]
pub trait Tts: Send + Sync {
    /// Synthesize and play `text`. Checks `cancel` during synthesis and at
    /// playback chunk boundaries.
    async fn speak(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<SpeakOutcome, StageError>;

    /// Stop any active playback immediately.
    fn stop(&self);

    fn name(&self) -> String;
}

/// Create a TTS engine from config. `adapter` is "cloud" or "mock".
pub fn create_tts(cfg: &TtsConfig) -> anyhow::Result<Box<dyn Tts>> {
    match cfg.adapter.as_str() {
        "cloud" => Ok(Box::new(CloudSpeaker::from_config(cfg)?)),
        "mock" => Ok(Box::new(MockTts::new(Duration::ZERO))),
        other => anyhow::bail!("Unknown TTS adapter: {}", other),
    }
}

// ---------------------------------------------------------------------------
// Cloud speaker: HTTP synthesis + rodio playback
// ---------------------------------------------------------------------------

/// Poll interval while watching playback for cancellation.
const PLAYBACK_POLL: Duration = Duration::from_millis(50);

pub struct CloudSpeaker {
    synth: cloud::CloudTts,
    player: playback::AudioPlayer,
    timeout: Duration,
}

impl CloudSpeaker {
    pub fn from_config(cfg: &TtsConfig) -> anyhow::Result<Self> {
        let player = playback::AudioPlayer::new(cfg.output_device.as_deref())?;
        player.set_volume(cfg.volume);
        Ok(Self {
            synth: cloud::CloudTts::from_config(cfg)?,
            player,
            timeout: Duration::from_secs(cfg.timeout_seconds),
        })
    }
}

#[async_trait]
impl Tts for CloudSpeaker {
    async fn speak(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<SpeakOutcome, StageError> {
        if cancel.is_cancelled() {
            return Ok(SpeakOutcome::Cancelled);
        }

        let pcm = tokio::select! {
            _ = cancel.cancelled() => return Ok(SpeakOutcome::Cancelled),
            synth = tokio::time::timeout(self.timeout, self.synth.synthesize(text)) => {
                match synth {
                    Ok(Ok(pcm)) => pcm,
                    Ok(Err(e)) => return Err(StageError::TtsFailed(e.to_string())),
                    Err(_) => {
                        return Err(StageError::TtsFailed(format!(
                            "synthesis timed out after {:?}",
                            self.timeout
                        )))
                    }
                }
            }
        };

        if pcm.is_empty() {
            return Ok(SpeakOutcome::Done);
        }

        self.player.append(pcm, self.synth.sample_rate());

        // Poll until playback drains or cancellation lands.
        while self.player.is_busy() {
            if cancel.is_cancelled() {
                self.player.stop();
                debug!("Playback interrupted");
                return Ok(SpeakOutcome::Cancelled);
            }
            tokio::time::sleep(PLAYBACK_POLL).await;
        }

        Ok(SpeakOutcome::Done)
    }

    fn stop(&self) {
        self.player.stop();
    }

    fn name(&self) -> String {
        self.synth.name()
    }
}

// ---------------------------------------------------------------------------
// Mock
// ---------------------------------------------------------------------------

/// Records spoken texts; simulates playback duration so cancellation paths
/// can be exercised.
pub struct MockTts {
    spoken: Mutex<Vec<String>>,
    playback_time: Duration,
    /// Replaced on every speak; `stop()` cancels the active one.
    active: Mutex<CancellationToken>,
}

impl MockTts {
    pub fn new(playback_time: Duration) -> Self {
        Self {
            spoken: Mutex::new(Vec::new()),
            playback_time,
            active: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Tts for MockTts {
    async fn speak(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<SpeakOutcome, StageError> {
        if cancel.is_cancelled() {
            return Ok(SpeakOutcome::Cancelled);
        }
        if let Ok(mut spoken) = self.spoken.lock() {
            spoken.push(text.to_string());
        }
        let stop = match self.active.lock() {
            Ok(mut active) => {
                *active = CancellationToken::new();
                active.clone()
            }
            Err(_) => CancellationToken::new(),
        };
        tokio::select! {
            _ = cancel.cancelled() => Ok(SpeakOutcome::Cancelled),
            _ = stop.cancelled() => Ok(SpeakOutcome::Cancelled),
            _ = tokio::time::sleep(self.playback_time) => Ok(SpeakOutcome::Done),
        }
    }

    fn stop(&self) {
        if let Ok(active) = self.active.lock() {
            active.cancel();
        }
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn mock_records_spoken_text() {
        let tts = MockTts::new(Duration::ZERO);
        let cancel = CancellationToken::new();
        let outcome = tts.speak("hello there", &cancel).await.unwrap();
        assert_eq!(outcome, SpeakOutcome::Done);
        assert_eq!(tts.spoken(), vec!["hello there".to_string()]);
    }

    #[tokio::test]
    async fn mock_honors_pre_cancelled_token() {
        let tts = MockTts::new(Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = tts.speak("never", &cancel).await.unwrap();
        assert_eq!(outcome, SpeakOutcome::Cancelled);
        assert!(tts.spoken().is_empty());
    }

    #[tokio::test]
    async fn mock_cancel_mid_playback() {
        let tts = Arc::new(MockTts::new(Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let speak = {
            let tts = Arc::clone(&tts);
            let cancel = cancel.clone();
            tokio::spawn(async move { tts.speak("long speech", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let outcome = speak.await.unwrap().unwrap();
        assert_eq!(outcome, SpeakOutcome::Cancelled);
    }

    #[test]
    fn factory_knows_mock() {
        let cfg = TtsConfig {
            adapter: "mock".to_string(),
            ..Default::default()
        };
        assert!(create_tts(&cfg).is_ok());
    }
}
