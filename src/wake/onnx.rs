//! ONNX wake word pipeline (openwakeword-style, 3 stages).
//!
//! Stages:
//!   1. `melspectrogram.onnx` — 512-sample frame -> mel features
//!   2. `embedding_model.onnx` — mel features -> embedding vector
//!   3. `wake_phrase.onnx` — accumulated embedding window -> score
//!
//! The classifier needs a window of recent embeddings, so the detector is
//! stateful across frames; `reset()` drops the window.

use std::path::Path;

use ort::session::Session;
use tracing::info;

use super::{check_frame, WakeError, FRAME_SAMPLES};

/// Score threshold at sensitivity 0.0 (strict).
const THRESHOLD_STRICT: f32 = 0.99;

/// Score threshold at sensitivity 1.0 (loose).
const THRESHOLD_LOOSE: f32 = 0.50;

/// How many embeddings the classifier window holds by default; updated from
/// the model's input shape when it can be read.
const DEFAULT_EMBEDDING_WINDOW: usize = 16;

pub struct OnnxWake {
    mel_session: Session,
    embed_session: Session,
    ww_session: Session,
    /// Accumulated embedding vectors for the classifier window.
    embeddings: Vec<Vec<f32>>,
    embedding_window: usize,
    threshold: f32,
}

impl OnnxWake {
    /// Load the 3-stage pipeline from `model_dir`. Missing files or session
    /// failures are reported, not tolerated — the caller decides whether to
    /// fall back.
    pub fn load(model_dir: &Path, sensitivity: f32) -> Result<Self, String> {
        let mel_path = model_dir.join("melspectrogram.onnx");
        let embed_path = model_dir.join("embedding_model.onnx");
        let ww_path = model_dir.join("wake_phrase.onnx");

        for (name, path) in [
            ("melspectrogram", &mel_path),
            ("embedding_model", &embed_path),
            ("wake_phrase", &ww_path),
        ] {
            if !path.exists() {
                return Err(format!("{} not found at {}", name, path.display()));
            }
        }

        let load = |path: &Path| -> Result<Session, String> {
            Session::builder()
                .and_then(|b| b.with_intra_threads(1))
                .and_then(|b| b.with_inter_threads(1))
                .and_then(|b| b.commit_from_file(path))
                .map_err(|e| format!("{}: {e}", path.display()))
        };

        let mut det = Self {
            mel_session: load(&mel_path)?,
            embed_session: load(&embed_path)?,
            ww_session: load(&ww_path)?,
            embeddings: Vec::new(),
            embedding_window: DEFAULT_EMBEDDING_WINDOW,
            threshold: threshold_for(sensitivity),
        };
        det.reset();
        info!("Wake word model loaded (3-stage pipeline)");
        Ok(det)
    }

    pub fn set_sensitivity(&mut self, sensitivity: f32) {
        self.threshold = threshold_for(sensitivity);
    }

    pub fn reset(&mut self) {
        self.embeddings.clear();
    }

    pub fn process(&mut self, frame: &[i16]) -> Result<bool, WakeError> {
        check_frame(frame)?;
        let as_f32: Vec<f32> = frame.iter().map(|&s| s as f32 / 32768.0).collect();
        let score = self
            .run_pipeline(&as_f32)
            .map_err(WakeError::Inference)?;
        Ok(score >= self.threshold)
    }

    /// Run the 3-stage pipeline on one frame, yielding a 0..1 score.
    fn run_pipeline(&mut self, frame: &[f32]) -> Result<f32, String> {
        // Stage 1: audio -> mel features
        let audio_input =
            ort::value::Value::from_array(([1, FRAME_SAMPLES], frame.to_vec()))
                .map_err(|e| format!("mel input value: {e}"))?;

        let mel_outputs = self
            .mel_session
            .run(ort::inputs!["input" => audio_input])
            .map_err(|e| format!("mel inference: {e}"))?;

        let (mel_shape, mel_data) = mel_outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("extract mel output: {e}"))?;

        // Stage 2: mel features -> embedding
        let mel_dims: Vec<usize> = mel_shape.iter().map(|&d| d as usize).collect();
        let embed_input = ort::value::Value::from_array((mel_dims, mel_data.to_vec()))
            .map_err(|e| format!("embed input value: {e}"))?;

        let embed_outputs = self
            .embed_session
            .run(ort::inputs!["input" => embed_input])
            .map_err(|e| format!("embed inference: {e}"))?;

        let (_shape, embedding) = embed_outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("extract embedding: {e}"))?;

        self.embeddings.push(embedding.to_vec());
        if self.embeddings.len() > self.embedding_window {
            let excess = self.embeddings.len() - self.embedding_window;
            self.embeddings.drain(..excess);
        }

        // Not enough context yet to classify.
        if self.embeddings.len() < self.embedding_window {
            return Ok(0.0);
        }

        // Stage 3: embedding window -> wake score
        let embed_dim = self.embeddings[0].len();
        let flat: Vec<f32> = self
            .embeddings
            .iter()
            .flat_map(|e| e.iter().copied())
            .collect();

        let ww_input = ort::value::Value::from_array((
            [1, self.embedding_window, embed_dim],
            flat,
        ))
        .map_err(|e| format!("ww input value: {e}"))?;

        let ww_outputs = self
            .ww_session
            .run(ort::inputs!["input" => ww_input])
            .map_err(|e| format!("ww inference: {e}"))?;

        let (_shape, scores) = ww_outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("extract ww score: {e}"))?;

        scores
            .first()
            .copied()
            .ok_or_else(|| "empty ww output".to_string())
    }
}

/// Map sensitivity (0 strict .. 1 loose) onto a score threshold.
fn threshold_for(sensitivity: f32) -> f32 {
    let s = sensitivity.clamp(0.0, 1.0);
    THRESHOLD_STRICT + (THRESHOLD_LOOSE - THRESHOLD_STRICT) * s
}
