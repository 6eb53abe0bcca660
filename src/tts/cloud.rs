//! Cloud TTS adapter (OpenAI-compatible speech endpoint).
//!
//! Requests raw PCM output (24 kHz, 16-bit mono little-endian) so playback
//! needs no decoding.

use serde_json::json;
use tracing::debug;

use crate::config::TtsConfig;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/audio/speech";

/// Sample rate of the endpoint's PCM output.
const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Nominal speaking rate the `speed` multiplier is relative to.
const BASELINE_RATE_WPM: f32 = 180.0;

pub struct CloudTts {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    voice: String,
    speed: f32,
}

impl CloudTts {
    pub fn from_config(cfg: &TtsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        let speed = (cfg.rate_wpm as f32 / BASELINE_RATE_WPM).clamp(0.25, 4.0);
        Ok(Self {
            client,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: cfg.api_key.clone(),
            voice: cfg.voice.clone(),
            speed,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        OUTPUT_SAMPLE_RATE
    }

    pub fn name(&self) -> String {
        format!("cloud ({})", self.voice)
    }

    /// Synthesize text to 16-bit mono PCM.
    pub async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<i16>> {
        let body = json!({
            "model": "tts-1",
            "input": text,
            "voice": self.voice,
            "speed": self.speed,
            "response_format": "pcm",
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(key);
        }

        debug!(chars = text.len(), voice = %self.voice, "Requesting speech synthesis");
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("speech API error {}: {}", status, body);
        }

        let bytes = resp.bytes().await?;
        Ok(decode_pcm_le(&bytes))
    }
}

/// Interpret raw bytes as 16-bit little-endian samples. A trailing odd
/// byte is dropped.
fn decode_pcm_le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
