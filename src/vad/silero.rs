//! Silero VAD via ONNX Runtime.
//!
//! Processes 512-sample windows at 16 kHz and returns speech probability.
//! Maintains LSTM hidden state (h, c tensors) across calls; `reset()`
//! zeroes it between utterances.

use std::path::Path;

use ort::session::Session;
use tracing::{info, warn};

/// Silero window size (samples at 16 kHz).
const WINDOW_SIZE: usize = 512;

/// Sample rate expected by the model.
const SAMPLE_RATE: i64 = 16_000;

/// Speech probability threshold.
const SPEECH_THRESHOLD: f32 = 0.5;

/// LSTM state tensors are [2, 1, 128].
const STATE_SIZE: usize = 2 * 128;

pub struct SileroVad {
    session: Session,
    h: Vec<f32>,
    c: Vec<f32>,
    /// Accumulation buffer for partial windows.
    buffer: Vec<f32>,
}

impl SileroVad {
    /// Load `silero_vad.onnx` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, String> {
        let model_path = model_dir.join("silero_vad.onnx");
        if !model_path.exists() {
            return Err(format!("model not found at {}", model_path.display()));
        }

        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_file(&model_path))
            .map_err(|e| format!("{}: {e}", model_path.display()))?;

        info!("Silero VAD loaded from {}", model_path.display());
        Ok(Self {
            session,
            h: vec![0.0; STATE_SIZE],
            c: vec![0.0; STATE_SIZE],
            buffer: Vec::new(),
        })
    }

    pub fn reset(&mut self) {
        self.h = vec![0.0; STATE_SIZE];
        self.c = vec![0.0; STATE_SIZE];
        self.buffer.clear();
    }

    /// Classify a chunk of 16-bit samples. Returns (is_speech, probability).
    ///
    /// The chunk is split into 512-sample windows; the highest window
    /// probability decides. Partial windows stay buffered for the next call.
    pub fn classify(&mut self, chunk: &[i16]) -> (bool, f32) {
        self.buffer
            .extend(chunk.iter().map(|&s| s as f32 / 32768.0));

        let mut max_prob: f32 = 0.0;
        while self.buffer.len() >= WINDOW_SIZE {
            let window: Vec<f32> = self.buffer.drain(..WINDOW_SIZE).collect();
            match self.infer_window(&window) {
                Ok(prob) => max_prob = max_prob.max(prob),
                Err(e) => {
                    warn!("Silero VAD inference error: {}", e);
                    return (false, 0.0);
                }
            }
        }

        (max_prob >= SPEECH_THRESHOLD, max_prob)
    }

    fn infer_window(&mut self, window: &[f32]) -> Result<f32, String> {
        let input_tensor =
            ort::value::Value::from_array(([1, WINDOW_SIZE], window.to_vec()))
                .map_err(|e| format!("input value: {e}"))?;
        let sr_tensor = ort::value::Value::from_array(([1], vec![SAMPLE_RATE]))
            .map_err(|e| format!("sr value: {e}"))?;
        let h_tensor = ort::value::Value::from_array(([2, 1, 128], self.h.clone()))
            .map_err(|e| format!("h value: {e}"))?;
        let c_tensor = ort::value::Value::from_array(([2, 1, 128], self.c.clone()))
            .map_err(|e| format!("c value: {e}"))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "input" => input_tensor,
                "sr" => sr_tensor,
                "h" => h_tensor,
                "c" => c_tensor,
            ])
            .map_err(|e| format!("inference: {e}"))?;

        // Output[0]: speech probability, Output[1]: new h, Output[2]: new c
        let prob = {
            let (_shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| format!("extract prob: {e}"))?;
            *data.first().ok_or("empty probability output")?
        };
        {
            let (_shape, data) = outputs[1]
                .try_extract_tensor::<f32>()
                .map_err(|e| format!("extract h: {e}"))?;
            self.h = data.to_vec();
        }
        {
            let (_shape, data) = outputs[2]
                .try_extract_tensor::<f32>()
                .map_err(|e| format!("extract c: {e}"))?;
            self.c = data.to_vec();
        }

        Ok(prob)
    }
}
