//! Audio types, capture, rolling buffer, and the monitoring/capturing
//! pipeline.
//!
//! Everything downstream of the capture callback works on 16-bit signed
//! mono PCM at the configured sample rate (default 16 kHz). Stereo input is
//! downmixed and resampled inside the callback before any other subsystem
//! sees a sample.

pub mod capture;
pub mod pipeline;
pub mod ring_buffer;

pub use capture::{list_devices, list_output_devices, start_capture, CaptureSupervisor};
pub use pipeline::{AudioPipeline, PipelineMode};
pub use ring_buffer::{capture_channel, ChunkConsumer, ChunkProducer, CircularBuffer};

/// Chunk size in samples handed from capture to the processing task
/// (80 ms at 16 kHz).
pub const CHUNK_SAMPLES: usize = 1280;

/// One chunk of captured audio, stamped by the pipeline task.
///
/// Frames are ephemeral: they live from the consumer pop to the ring-buffer
/// and detector hand-off within the same loop iteration.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Monotonic per-session sequence number.
    pub seq: u64,
    /// Capture timestamp, unix milliseconds.
    pub ts_ms: i64,
    pub samples: Vec<i16>,
}

/// A complete, self-contained span of user speech.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
    pub duration_ms: u64,
    /// When capture of this utterance finished, unix milliseconds.
    pub ts_ms: i64,
}

impl Utterance {
    pub fn new(pcm: Vec<i16>, sample_rate: u32, ts_ms: i64) -> Self {
        let duration_ms = (pcm.len() as u64 * 1000) / sample_rate.max(1) as u64;
        Self {
            pcm,
            sample_rate,
            duration_ms,
            ts_ms,
        }
    }
}

/// Events emitted by the audio pipeline, consumed by the orchestrator.
#[derive(Debug, Clone)]
pub enum AudioEvent {
    WakeWord { ts_ms: i64 },
    Hotkey { ts_ms: i64 },
    UtteranceReady(Utterance),
}

/// Down-mix interleaved multi-channel f32 audio to mono by averaging,
/// overwriting `out`. Writes into a pre-sized buffer so the capture
/// callback never allocates here.
pub fn downmix_into(samples: &[f32], channels: u16, out: &mut Vec<f32>) {
    out.clear();
    let ch = channels.max(1) as usize;
    if ch == 1 {
        out.extend_from_slice(samples);
        return;
    }
    for frame in samples.chunks_exact(ch) {
        out.push(frame.iter().sum::<f32>() / ch as f32);
    }
}

/// Append normalized f32 samples to `out` as 16-bit signed PCM.
pub fn append_as_i16(samples: &[f32], out: &mut Vec<i16>) {
    out.extend(
        samples
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_passthrough() {
        let s = [0.1f32, 0.2, 0.3];
        let mut out = Vec::new();
        downmix_into(&s, 1, &mut out);
        assert_eq!(out, s.to_vec());
    }

    #[test]
    fn stereo_downmix_averages_pairs() {
        let s = [1.0f32, 0.0, 0.5, 0.5];
        let mut out = vec![9.9f32; 8]; // stale contents must be overwritten
        downmix_into(&s, 2, &mut out);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn i16_conversion_clamps_and_appends() {
        let mut out = vec![7i16];
        append_as_i16(&[2.0, -2.0, 0.0], &mut out);
        assert_eq!(out, vec![7, 32767, -32767, 0]);
    }

    #[test]
    fn utterance_duration_from_samples() {
        let u = Utterance::new(vec![0i16; 16_000], 16_000, 0);
        assert_eq!(u.duration_ms, 1000);
    }
}
