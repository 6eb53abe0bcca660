//! Audio pipeline: routes captured chunks to the rolling buffer, the wake
//! detector, and the utterance gate, and emits [`AudioEvent`]s.
//!
//! Two modes:
//!   - Monitoring: fill the rolling buffer, scan fixed frames for the wake
//!     word. A detection (or an injected hotkey) switches to Capturing.
//!   - Capturing: accumulate the utterance; the VAD gate, the duration cap,
//!     or the byte cap ends it and emits `UtteranceReady`.
//!
//! A wake-triggered utterance starts with a copied prefix from the rolling
//! buffer so speech immediately after (or overlapping) the wake phrase is
//! not lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::vad::UtteranceGate;
use crate::wake::{WakeDetector, FRAME_SAMPLES};

use super::ring_buffer::{ChunkConsumer, CircularBuffer};
use super::{AudioEvent, AudioFrame, Utterance, CHUNK_SAMPLES};

/// Capacity of the event channel to the orchestrator. Overflow drops the
/// newest event and bumps a metrics counter.
pub const EVENT_CHANNEL_CAPACITY: usize = 4;

/// Counter bumped when the event channel overflows.
pub const EVENTS_DROPPED_COUNTER: &str = "audio.events_dropped";

/// Poll interval for draining the capture channel.
const POLL_INTERVAL: Duration = Duration::from_millis(40);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Monitoring,
    Capturing,
}

/// Tunables the pipeline needs, pre-resolved from config.
pub struct PipelineSettings {
    pub sample_rate: u32,
    pub max_utterance_samples: usize,
    pub wake_prefix_secs: f64,
}

pub struct AudioPipeline {
    mode: PipelineMode,
    ring: Arc<CircularBuffer>,
    wake: WakeDetector,
    gate: UtteranceGate,
    settings: PipelineSettings,
    /// Partial-frame carry for the wake detector's fixed frame size.
    frame_buf: Vec<i16>,
    /// Utterance under construction while Capturing.
    accumulator: Vec<i16>,
    events_tx: mpsc::Sender<AudioEvent>,
    metrics: Arc<Metrics>,
    seq: u64,
}

impl AudioPipeline {
    pub fn new(
        ring: Arc<CircularBuffer>,
        wake: WakeDetector,
        gate: UtteranceGate,
        settings: PipelineSettings,
        events_tx: mpsc::Sender<AudioEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        if !wake.is_model_backed() {
            warn!("Wake detection running without a model — hotkey capture only");
        }
        Self {
            mode: PipelineMode::Monitoring,
            ring,
            wake,
            gate,
            settings,
            frame_buf: Vec::with_capacity(FRAME_SAMPLES * 2),
            accumulator: Vec::new(),
            events_tx,
            metrics,
            seq: 0,
        }
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    /// Stamp a raw chunk into a frame. Frames are ephemeral — they exist
    /// for the duration of one `handle_frame` call.
    pub fn stamp(&mut self, samples: &[i16]) -> AudioFrame {
        self.seq += 1;
        AudioFrame {
            seq: self.seq,
            ts_ms: chrono::Utc::now().timestamp_millis(),
            samples: samples.to_vec(),
        }
    }

    /// Process one captured frame through the current mode.
    pub fn handle_frame(&mut self, frame: &AudioFrame) {
        // The rolling window always stays fresh, whatever the mode.
        self.ring.write(&frame.samples);

        match self.mode {
            PipelineMode::Monitoring => self.monitor(frame),
            PipelineMode::Capturing => self.capture(frame),
        }
    }

    /// Externally observed hotkey: start capturing with no prefix.
    pub fn inject_hotkey(&mut self) {
        if self.mode != PipelineMode::Monitoring {
            debug!("Hotkey ignored — already capturing");
            return;
        }
        let ts_ms = chrono::Utc::now().timestamp_millis();
        info!("Hotkey triggered — capturing");
        self.send_event(AudioEvent::Hotkey { ts_ms });
        self.begin_capture(Vec::new());
    }

    fn monitor(&mut self, frame: &AudioFrame) {
        self.frame_buf.extend_from_slice(&frame.samples);

        let mut detected = false;
        while self.frame_buf.len() >= FRAME_SAMPLES {
            let wake_frame: Vec<i16> = self.frame_buf.drain(..FRAME_SAMPLES).collect();
            match self.wake.process(&wake_frame) {
                Ok(true) => detected = true,
                Ok(false) => {}
                Err(e) => warn!("Wake detector error: {}", e),
            }
        }

        if detected {
            info!("Wake word detected");
            self.send_event(AudioEvent::WakeWord { ts_ms: frame.ts_ms });
            let prefix = self.ring.snapshot_last(self.settings.wake_prefix_secs);
            self.begin_capture(prefix);
        }
    }

    fn capture(&mut self, frame: &AudioFrame) {
        self.accumulator.extend_from_slice(&frame.samples);

        let ended = self.gate.end_of_speech(&frame.samples);
        let capped = self.accumulator.len() >= self.settings.max_utterance_samples;
        if capped && !ended {
            debug!(
                samples = self.accumulator.len(),
                "Utterance hit the duration cap"
            );
        }

        if ended || capped {
            self.finish_utterance(frame.ts_ms);
        }
    }

    fn begin_capture(&mut self, prefix: Vec<i16>) {
        self.gate.reset();
        self.accumulator = prefix;
        self.mode = PipelineMode::Capturing;
    }

    fn finish_utterance(&mut self, ts_ms: i64) {
        let pcm = std::mem::take(&mut self.accumulator);
        let utterance = Utterance::new(pcm, self.settings.sample_rate, ts_ms);
        debug!(duration_ms = utterance.duration_ms, "Utterance complete");
        self.send_event(AudioEvent::UtteranceReady(utterance));

        self.gate.reset();
        self.wake.reset();
        self.frame_buf.clear();
        self.mode = PipelineMode::Monitoring;
    }

    fn send_event(&self, event: AudioEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            warn!("Audio event channel full — dropping event: {}", e);
            self.metrics.inc_counter(EVENTS_DROPPED_COUNTER);
        }
    }

    /// Drive the pipeline from the capture channel until cancelled.
    ///
    /// Hotkey injections arrive on `hotkey_rx` (fed by the host protocol's
    /// `trigger_hotkey` command).
    pub async fn run(
        mut self,
        mut consumer: ChunkConsumer,
        mut hotkey_rx: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) {
        let mut read_buf = vec![0i16; CHUNK_SAMPLES];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = hotkey_rx.recv() => {
                    match maybe {
                        Some(()) => self.inject_hotkey(),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    loop {
                        let n = consumer.pop_slice(&mut read_buf);
                        if n == 0 {
                            break;
                        }
                        let chunk: Vec<i16> = read_buf[..n].to_vec();
                        let frame = self.stamp(&chunk);
                        self.handle_frame(&frame);
                    }
                }
            }
        }
        debug!("Audio pipeline task exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::{energy::EnergyVad, SpeechDetector, UtteranceGate};
    use crate::wake::MockWake;

    const RATE: u32 = 16_000;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            sample_rate: RATE,
            max_utterance_samples: RATE as usize * 30,
            wake_prefix_secs: 0.5,
        }
    }

    fn make_pipeline(
        wake: WakeDetector,
        ring_secs: f64,
    ) -> (AudioPipeline, mpsc::Receiver<AudioEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let ring = Arc::new(CircularBuffer::new(ring_secs, RATE));
        let gate = UtteranceGate::new(
            SpeechDetector::Energy(EnergyVad::default()),
            RATE,
            500,
            250,
        );
        let pipeline = AudioPipeline::new(ring, wake, gate, settings(), tx, Metrics::new(true));
        (pipeline, rx)
    }

    fn speech_chunk(value: i16) -> Vec<i16> {
        (0..CHUNK_SAMPLES)
            .map(|i| if i % 2 == 0 { value } else { -value })
            .collect()
    }

    fn silence_chunk() -> Vec<i16> {
        vec![0i16; CHUNK_SAMPLES]
    }

    fn feed(pipeline: &mut AudioPipeline, samples: &[i16]) {
        let frame = pipeline.stamp(samples);
        pipeline.handle_frame(&frame);
    }

    #[test]
    fn starts_in_monitoring() {
        let (pipeline, _rx) = make_pipeline(WakeDetector::Mock(MockWake::silent()), 3.0);
        assert_eq!(pipeline.mode(), PipelineMode::Monitoring);
    }

    #[test]
    fn hotkey_switches_to_capturing_with_empty_accumulator() {
        let (mut pipeline, mut rx) = make_pipeline(WakeDetector::Mock(MockWake::silent()), 3.0);
        pipeline.inject_hotkey();
        assert_eq!(pipeline.mode(), PipelineMode::Capturing);
        assert!(matches!(rx.try_recv().unwrap(), AudioEvent::Hotkey { .. }));
        assert!(pipeline.accumulator.is_empty());
    }

    #[test]
    fn hotkey_while_capturing_is_ignored() {
        let (mut pipeline, mut rx) = make_pipeline(WakeDetector::Mock(MockWake::silent()), 3.0);
        pipeline.inject_hotkey();
        let _ = rx.try_recv();
        pipeline.inject_hotkey();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn wake_preserves_prefix_audio() {
        // Wake fires on the first scanned frame after 2.5 s of audio; the
        // utterance must begin with the last 500 ms of pre-wake audio.
        let chunks_for_2_5s = (2.5 * RATE as f64) as usize / CHUNK_SAMPLES; // 31
        let period = (chunks_for_2_5s * CHUNK_SAMPLES / FRAME_SAMPLES + 1) as u64;
        let (mut pipeline, mut rx) =
            make_pipeline(WakeDetector::Mock(MockWake::every(period)), 3.0);

        // Pre-wake: distinctive loud audio so the prefix is identifiable
        // and the VAD sees speech.
        for _ in 0..chunks_for_2_5s {
            feed(&mut pipeline, &speech_chunk(9000));
        }
        // Next chunk crosses the detector's firing period.
        feed(&mut pipeline, &speech_chunk(9000));
        assert!(matches!(rx.try_recv().unwrap(), AudioEvent::WakeWord { .. }));
        assert_eq!(pipeline.mode(), PipelineMode::Capturing);

        // Live speech then trailing silence ends the utterance.
        for _ in 0..4 {
            feed(&mut pipeline, &speech_chunk(9000));
        }
        for _ in 0..8 {
            feed(&mut pipeline, &silence_chunk());
        }

        let utterance = loop {
            match rx.try_recv().unwrap() {
                AudioEvent::UtteranceReady(u) => break u,
                _ => continue,
            }
        };
        // Prefix of 500 ms = 8000 samples of pre-wake audio.
        let prefix_samples = (0.5 * RATE as f64) as usize;
        assert!(utterance.pcm.len() >= prefix_samples);
        // The prefix is the loud pre-wake signal, not silence.
        let prefix_energy = crate::vad::energy::rms(&utterance.pcm[..prefix_samples]);
        assert!(prefix_energy > 0.1, "prefix lost: rms={prefix_energy}");
        assert_eq!(pipeline.mode(), PipelineMode::Monitoring);
    }

    #[test]
    fn silence_after_speech_emits_utterance() {
        let (mut pipeline, mut rx) = make_pipeline(WakeDetector::Mock(MockWake::silent()), 3.0);
        pipeline.inject_hotkey();
        let _ = rx.try_recv();

        for _ in 0..4 {
            feed(&mut pipeline, &speech_chunk(9000));
        }
        for _ in 0..8 {
            feed(&mut pipeline, &silence_chunk());
        }

        let utterance = match rx.try_recv().unwrap() {
            AudioEvent::UtteranceReady(u) => u,
            other => panic!("expected UtteranceReady, got {other:?}"),
        };
        assert!(utterance.duration_ms >= 320);
        assert_eq!(pipeline.mode(), PipelineMode::Monitoring);
    }

    #[test]
    fn utterance_is_cut_at_the_duration_cap() {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let ring = Arc::new(CircularBuffer::new(3.0, RATE));
        let gate = UtteranceGate::new(
            SpeechDetector::Energy(EnergyVad::default()),
            RATE,
            500,
            250,
        );
        // 1 second cap for the test.
        let settings = PipelineSettings {
            sample_rate: RATE,
            max_utterance_samples: RATE as usize,
            wake_prefix_secs: 0.5,
        };
        let mut pipeline = AudioPipeline::new(
            ring,
            WakeDetector::Mock(MockWake::silent()),
            gate,
            settings,
            tx,
            Metrics::new(true),
        );
        pipeline.inject_hotkey();
        let _ = rx.try_recv();

        // Continuous speech, never any silence: the cap must cut it.
        let chunks_needed = RATE as usize / CHUNK_SAMPLES + 1;
        for _ in 0..chunks_needed {
            feed(&mut pipeline, &speech_chunk(9000));
        }

        match rx.try_recv().unwrap() {
            AudioEvent::UtteranceReady(u) => {
                assert!(u.pcm.len() >= RATE as usize);
            }
            other => panic!("expected UtteranceReady, got {other:?}"),
        }
    }

    #[test]
    fn channel_overflow_bumps_drop_counter() {
        let (tx, _rx) = mpsc::channel(1);
        let ring = Arc::new(CircularBuffer::new(3.0, RATE));
        let gate = UtteranceGate::new(
            SpeechDetector::Energy(EnergyVad::default()),
            RATE,
            500,
            250,
        );
        let metrics = Metrics::new(true);
        let mut pipeline = AudioPipeline::new(
            ring,
            WakeDetector::Mock(MockWake::silent()),
            gate,
            settings(),
            tx,
            Arc::clone(&metrics),
        );

        // The hotkey event fills the 1-slot channel; the UtteranceReady
        // that follows has nowhere to go.
        pipeline.inject_hotkey();
        for _ in 0..4 {
            feed(&mut pipeline, &speech_chunk(9000));
        }
        for _ in 0..8 {
            feed(&mut pipeline, &silence_chunk());
        }
        assert!(metrics.counter(EVENTS_DROPPED_COUNTER) > 0);
    }
}
