//! Wake word detection.
//!
//! Detectors consume fixed 512-sample frames of 16 kHz mono PCM and answer
//! "did the wake phrase end in this frame". They are stateful across frames
//! (the models carry phonetic context); `reset()` clears that state.
//!
//! The ONNX detector lives behind the `onnx` feature. When the models are
//! missing or the feature is off, [`create_detector`] hands back a
//! [`MockWake`] so the rest of the system keeps running; the audio pipeline
//! logs a warning but does not abort.

#[cfg(feature = "onnx")]
pub mod onnx;

use std::path::Path;

use thiserror::Error;
use tracing::warn;

/// Frame size every detector expects, in samples.
pub const FRAME_SAMPLES: usize = 512;

#[derive(Debug, Error)]
pub enum WakeError {
    #[error("wake frame must be exactly {expected} samples, got {got}")]
    InvalidFrameSize { expected: usize, got: usize },

    #[error("wake inference failed: {0}")]
    Inference(String),
}

// ---------------------------------------------------------------------------
// Mock detector
// ---------------------------------------------------------------------------

/// Deterministic detector for tests and model-less installs.
///
/// Fires on every `period`-th call; `period` of 0 never fires.
pub struct MockWake {
    period: u64,
    calls: u64,
}

impl MockWake {
    pub fn every(period: u64) -> Self {
        Self { period, calls: 0 }
    }

    /// A detector that never triggers.
    pub fn silent() -> Self {
        Self::every(0)
    }

    fn process(&mut self, frame: &[i16]) -> Result<bool, WakeError> {
        check_frame(frame)?;
        self.calls += 1;
        Ok(self.period != 0 && self.calls % self.period == 0)
    }

    fn reset(&mut self) {
        self.calls = 0;
    }
}

pub(crate) fn check_frame(frame: &[i16]) -> Result<(), WakeError> {
    if frame.len() != FRAME_SAMPLES {
        return Err(WakeError::InvalidFrameSize {
            expected: FRAME_SAMPLES,
            got: frame.len(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Enum dispatch over the available detector backends.
pub enum WakeDetector {
    #[cfg(feature = "onnx")]
    Onnx(onnx::OnnxWake),
    Mock(MockWake),
}

impl WakeDetector {
    /// Scan one frame. `frame` must be exactly [`FRAME_SAMPLES`] long.
    pub fn process(&mut self, frame: &[i16]) -> Result<bool, WakeError> {
        match self {
            #[cfg(feature = "onnx")]
            Self::Onnx(d) => d.process(frame),
            Self::Mock(d) => d.process(frame),
        }
    }

    /// Clear phonetic context between utterances.
    pub fn reset(&mut self) {
        match self {
            #[cfg(feature = "onnx")]
            Self::Onnx(d) => d.reset(),
            Self::Mock(d) => d.reset(),
        }
    }

    /// Adjust sensitivity, 0.0 (strict) .. 1.0 (loose).
    pub fn set_sensitivity(&mut self, sensitivity: f32) {
        match self {
            #[cfg(feature = "onnx")]
            Self::Onnx(d) => d.set_sensitivity(sensitivity),
            Self::Mock(_) => {}
        }
    }

    pub fn is_model_backed(&self) -> bool {
        match self {
            #[cfg(feature = "onnx")]
            Self::Onnx(_) => true,
            Self::Mock(_) => false,
        }
    }
}

/// Build the best available detector for `model_dir`.
///
/// Falls back to a silent mock when the models cannot be loaded so the
/// assistant still runs (hotkey-triggered capture keeps working).
pub fn create_detector(model_dir: &Path, sensitivity: f32) -> WakeDetector {
    #[cfg(feature = "onnx")]
    {
        match onnx::OnnxWake::load(model_dir, sensitivity) {
            Ok(det) => return WakeDetector::Onnx(det),
            Err(e) => {
                warn!("Wake word model unavailable: {} — running without wake word", e);
            }
        }
    }
    #[cfg(not(feature = "onnx"))]
    {
        let _ = (model_dir, sensitivity);
        warn!("Wake word detection disabled (onnx feature off)");
    }
    WakeDetector::Mock(MockWake::silent())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Vec<i16> {
        vec![0i16; FRAME_SAMPLES]
    }

    #[test]
    fn mock_fires_every_m_calls() {
        let mut det = WakeDetector::Mock(MockWake::every(3));
        assert!(!det.process(&frame()).unwrap());
        assert!(!det.process(&frame()).unwrap());
        assert!(det.process(&frame()).unwrap());
        assert!(!det.process(&frame()).unwrap());
        assert!(!det.process(&frame()).unwrap());
        assert!(det.process(&frame()).unwrap());
    }

    #[test]
    fn silent_mock_never_fires() {
        let mut det = MockWake::silent();
        for _ in 0..100 {
            assert!(!det.process(&frame()).unwrap());
        }
    }

    #[test]
    fn reset_restarts_the_period() {
        let mut det = WakeDetector::Mock(MockWake::every(2));
        assert!(!det.process(&frame()).unwrap());
        det.reset();
        assert!(!det.process(&frame()).unwrap());
        assert!(det.process(&frame()).unwrap());
    }

    #[test]
    fn wrong_frame_size_is_rejected() {
        let mut det = WakeDetector::Mock(MockWake::every(1));
        let short = vec![0i16; FRAME_SAMPLES - 1];
        assert!(matches!(
            det.process(&short),
            Err(WakeError::InvalidFrameSize { .. })
        ));
        let long = vec![0i16; FRAME_SAMPLES + 1];
        assert!(det.process(&long).is_err());
    }

    #[test]
    fn factory_falls_back_to_mock_without_models() {
        let dir = tempfile::tempdir().unwrap();
        let det = create_detector(dir.path(), 0.5);
        assert!(!det.is_model_backed());
    }
}
