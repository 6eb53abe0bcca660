//! Energy-based voice activity detection (fallback).
//!
//! Root-mean-square amplitude against a fixed threshold. Used whenever the
//! neural VAD model is unavailable; same interface, same endpoint
//! semantics.

/// RMS threshold on normalized (-1..1) samples. Frames above it count as
/// speech. Typical quiet-room microphones sit well below 0.01.
const DEFAULT_THRESHOLD: f32 = 0.015;

/// Compute the RMS of a chunk of 16-bit samples, normalized to 0..1.
pub fn rms(chunk: &[i16]) -> f32 {
    if chunk.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = chunk
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    ((sum_sq / chunk.len() as f64) as f32).sqrt()
}

/// Threshold-based speech/silence classifier.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Classify one chunk. Confidence is the RMS scaled so the threshold
    /// maps to 0.5, clamped to [0, 1].
    pub fn classify(&mut self, chunk: &[i16]) -> (bool, f32) {
        let level = rms(chunk);
        let confidence = (level / (self.threshold * 2.0)).clamp(0.0, 1.0);
        (level >= self.threshold, confidence)
    }

    pub fn reset(&mut self) {
        // Stateless; nothing to clear.
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_not_speech() {
        let mut vad = EnergyVad::default();
        let (speech, confidence) = vad.classify(&vec![0i16; 512]);
        assert!(!speech);
        assert!(confidence < 0.5);
    }

    #[test]
    fn loud_square_wave_is_speech() {
        let mut vad = EnergyVad::default();
        let chunk: Vec<i16> = (0..512).map(|i| if i % 2 == 0 { 8000 } else { -8000 }).collect();
        let (speech, confidence) = vad.classify(&chunk);
        assert!(speech);
        assert!(confidence > 0.5);
    }

    #[test]
    fn empty_chunk_is_silence() {
        let mut vad = EnergyVad::default();
        assert!(!vad.classify(&[]).0);
    }

    #[test]
    fn rms_of_half_scale_square_wave() {
        let chunk: Vec<i16> = (0..256)
            .map(|i| if i % 2 == 0 { 16384 } else { -16384 })
            .collect();
        let level = rms(&chunk);
        assert!((level - 0.5).abs() < 0.01, "rms={level}");
    }
}
