//! Speech-to-text adapters.
//!
//! The engine itself is an external collaborator: one opaque transcribe
//! call over 16-bit mono PCM. The cloud adapter speaks the
//! OpenAI-compatible transcription endpoint; the mock plays scripted
//! transcripts for tests and offline runs.

pub mod cloud;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::SttConfig;

/// Result of one transcription.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    /// 0..1; the pipeline re-prompts below 0.5.
    pub confidence: f32,
    pub duration_ms: u64,
}

/// Common interface for all STT engines.
#[async_trait]
pub trait SttEngine: Send + Sync {
    /// Transcribe mono 16-bit PCM at `sample_rate`. `language` is a fixed
    /// config value — there is no autodetect.
    async fn transcribe(
        &self,
        pcm: &[i16],
        sample_rate: u32,
        language: &str,
    ) -> anyhow::Result<Transcript>;
}

/// Create an STT engine from config. `adapter` is "cloud" or "mock".
pub fn create_stt_engine(cfg: &SttConfig) -> anyhow::Result<Arc<dyn SttEngine>> {
    match cfg.adapter.as_str() {
        "cloud" => Ok(Arc::new(cloud::CloudStt::from_config(cfg)?)),
        "mock" => Ok(Arc::new(MockStt::fixed("mock transcription", 1.0))),
        other => anyhow::bail!("Unknown STT adapter: {}", other),
    }
}

// ---------------------------------------------------------------------------
// Mock
// ---------------------------------------------------------------------------

/// Scripted engine: plays queued transcripts, then repeats the last one.
pub struct MockStt {
    queue: Mutex<VecDeque<Transcript>>,
    fallback: Transcript,
}

impl MockStt {
    pub fn fixed(text: &str, confidence: f32) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Transcript {
                text: text.to_string(),
                confidence,
                duration_ms: 0,
            },
        }
    }

    pub fn scripted(transcripts: Vec<(&str, f32)>, fallback: (&str, f32)) -> Self {
        Self {
            queue: Mutex::new(
                transcripts
                    .into_iter()
                    .map(|(text, confidence)| Transcript {
                        text: text.to_string(),
                        confidence,
                        duration_ms: 0,
                    })
                    .collect(),
            ),
            fallback: Transcript {
                text: fallback.0.to_string(),
                confidence: fallback.1,
                duration_ms: 0,
            },
        }
    }
}

#[async_trait]
impl SttEngine for MockStt {
    async fn transcribe(
        &self,
        pcm: &[i16],
        sample_rate: u32,
        _language: &str,
    ) -> anyhow::Result<Transcript> {
        let mut t = self
            .queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| self.fallback.clone());
        t.duration_ms = pcm.len() as u64 * 1000 / sample_rate.max(1) as u64;
        Ok(t)
    }
}
