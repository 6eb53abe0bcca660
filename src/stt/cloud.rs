//! Cloud STT adapter (OpenAI-compatible transcription endpoint).

use async_trait::async_trait;
use reqwest::multipart;
use tracing::debug;

use crate::config::SttConfig;

use super::{SttEngine, Transcript};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Encode 16-bit mono PCM as WAV bytes.
pub fn encode_wav(pcm: &[i16], sample_rate: u32) -> Vec<u8> {
    let num_samples = pcm.len() as u32;
    let bytes_per_sample: u16 = 2;
    let num_channels: u16 = 1;
    let data_size = num_samples * bytes_per_sample as u32;
    let file_size = 36 + data_size;

    let mut buf = Vec::with_capacity(44 + data_size as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt sub-chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    buf.extend_from_slice(&num_channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    let byte_rate = sample_rate * num_channels as u32 * bytes_per_sample as u32;
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    let block_align = num_channels * bytes_per_sample;
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&(bytes_per_sample * 8).to_le_bytes());

    // data sub-chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in pcm {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    buf
}

pub struct CloudStt {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl CloudStt {
    pub fn from_config(cfg: &SttConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            endpoint: cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key: cfg.api_key.clone(),
        })
    }
}

#[async_trait]
impl SttEngine for CloudStt {
    async fn transcribe(
        &self,
        pcm: &[i16],
        sample_rate: u32,
        language: &str,
    ) -> anyhow::Result<Transcript> {
        let wav = encode_wav(pcm, sample_rate);
        debug!(bytes = wav.len(), %language, "Sending audio for transcription");

        let file_part = multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let form = multipart::Form::new()
            .text("model", "whisper-1")
            .text("language", language.to_string())
            .text("response_format", "verbose_json")
            .part("file", file_part);

        let mut req = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("transcription API error {}: {}", status, body);
        }

        let json: serde_json::Value = resp.json().await?;
        let text = json["text"].as_str().unwrap_or("").trim().to_string();

        // verbose_json carries per-segment average log-probabilities; map
        // their mean onto 0..1. Absent segments mean no estimate.
        let confidence = json["segments"]
            .as_array()
            .filter(|segs| !segs.is_empty())
            .map(|segs| {
                let sum: f64 = segs
                    .iter()
                    .filter_map(|s| s["avg_logprob"].as_f64())
                    .sum();
                (sum / segs.len() as f64).exp().clamp(0.0, 1.0) as f32
            })
            .unwrap_or(1.0);

        let duration_ms = pcm.len() as u64 * 1000 / sample_rate.max(1) as u64;

        Ok(Transcript {
            text,
            confidence,
            duration_ms,
        })
    }
}
