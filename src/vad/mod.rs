//! Voice activity detection and end-of-utterance tracking.
//!
//! [`SpeechDetector`] classifies chunks as speech/silence; the Silero model
//! is used when available, RMS energy otherwise — behavioral contract is
//! identical. [`UtteranceGate`] sits on top and decides when an utterance
//! has ended: enough speech accumulated since the last reset, followed by
//! enough trailing silence.

pub mod energy;
#[cfg(feature = "onnx")]
pub mod silero;

use std::path::Path;

use energy::EnergyVad;
use tracing::info;
#[cfg(feature = "onnx")]
use tracing::warn;

/// Enum dispatch over the available VAD backends.
pub enum SpeechDetector {
    #[cfg(feature = "onnx")]
    Silero(silero::SileroVad),
    Energy(EnergyVad),
}

impl SpeechDetector {
    /// Classify one chunk as speech or silence with a 0..1 confidence.
    pub fn classify(&mut self, chunk: &[i16]) -> (bool, f32) {
        match self {
            #[cfg(feature = "onnx")]
            Self::Silero(v) => v.classify(chunk),
            Self::Energy(v) => v.classify(chunk),
        }
    }

    pub fn reset(&mut self) {
        match self {
            #[cfg(feature = "onnx")]
            Self::Silero(v) => v.reset(),
            Self::Energy(v) => v.reset(),
        }
    }
}

/// Build the best available detector for `model_dir`.
pub fn create_detector(model_dir: &Path) -> SpeechDetector {
    #[cfg(feature = "onnx")]
    {
        match silero::SileroVad::load(model_dir) {
            Ok(v) => return SpeechDetector::Silero(v),
            Err(e) => warn!("Silero VAD unavailable: {} — using energy fallback", e),
        }
    }
    #[cfg(not(feature = "onnx"))]
    let _ = model_dir;
    info!("Using energy-based VAD");
    SpeechDetector::Energy(EnergyVad::default())
}

// ---------------------------------------------------------------------------
// UtteranceGate — end-of-speech tracking
// ---------------------------------------------------------------------------

/// Endpoint tracker: an utterance ends once at least `min_speech_ms` of
/// speech has been heard since the last reset and the most recent
/// `silence_ms` have been silence.
pub struct UtteranceGate {
    detector: SpeechDetector,
    sample_rate: u32,
    silence_ms: u64,
    min_speech_ms: u64,
    speech_ms: u64,
    trailing_silence_ms: u64,
}

impl UtteranceGate {
    pub fn new(detector: SpeechDetector, sample_rate: u32, silence_ms: u64, min_speech_ms: u64) -> Self {
        Self {
            detector,
            sample_rate,
            silence_ms,
            min_speech_ms,
            speech_ms: 0,
            trailing_silence_ms: 0,
        }
    }

    /// Classify a chunk without advancing the endpoint state.
    pub fn classify(&mut self, chunk: &[i16]) -> (bool, f32) {
        self.detector.classify(chunk)
    }

    /// Feed one chunk and report whether the utterance has ended.
    pub fn end_of_speech(&mut self, chunk: &[i16]) -> bool {
        let (is_speech, _confidence) = self.detector.classify(chunk);
        let chunk_ms = chunk.len() as u64 * 1000 / self.sample_rate.max(1) as u64;

        if is_speech {
            self.speech_ms += chunk_ms;
            self.trailing_silence_ms = 0;
        } else {
            self.trailing_silence_ms += chunk_ms;
        }

        self.speech_ms >= self.min_speech_ms && self.trailing_silence_ms >= self.silence_ms
    }

    /// Clear endpoint state and the detector's model state between
    /// utterances.
    pub fn reset(&mut self) {
        self.speech_ms = 0;
        self.trailing_silence_ms = 0;
        self.detector.reset();
    }
}
