//! Audio capture via cpal.
//!
//! Opens the default (or named) input device, captures at its native rate,
//! downmixes and resamples to 16 kHz mono, converts to 16-bit PCM, and
//! pushes fixed-size chunks into the SPSC channel for the processing task.
//!
//! [`CaptureSupervisor`] owns the stream on a dedicated thread and rebuilds
//! it with exponential backoff (200 ms, doubling, 5 s cap) when the device
//! disappears mid-session. Permission-style failures are fatal and reported
//! to the orchestrator instead of retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::ring_buffer::ChunkProducer;
use super::{append_as_i16, downmix_into, CHUNK_SAMPLES};

/// Initial reconnect delay after a device failure.
const RECONNECT_INITIAL: Duration = Duration::from_millis(200);

/// Reconnect delay cap.
const RECONNECT_CAP: Duration = Duration::from_secs(5);

/// List available input device names.
pub fn list_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.input_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// List available output device names.
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.output_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// Why capture could not start.
#[derive(Debug)]
pub enum CaptureError {
    /// The OS refused access; retrying will not help.
    PermissionDenied(String),
    /// Device missing or busy; worth retrying.
    Device(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied(m) => write!(f, "permission denied: {m}"),
            Self::Device(m) => write!(f, "{m}"),
        }
    }
}

/// Health reports from the capture thread to the orchestrator.
#[derive(Debug, Clone)]
pub enum CaptureStatus {
    Up,
    Down { reason: String },
    Fatal { reason: String },
}

/// Resolved info about the audio input we will use.
struct CaptureConfig {
    device: cpal::Device,
    stream_config: StreamConfig,
    native_rate: u32,
}

/// Find and configure the input device.
fn resolve_device(device_name: Option<&str>) -> Result<CaptureConfig, CaptureError> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| classify(format!("Failed to enumerate input devices: {e}")))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| CaptureError::Device(format!("Input device not found: {name}")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| CaptureError::Device("No default input device available".to_string()))?
    };

    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
    info!(device = %dev_name, "Selected input device");

    let default_config = device
        .default_input_config()
        .map_err(|e| classify(format!("Failed to get default input config: {e}")))?;

    let native_rate = default_config.sample_rate().0;
    let channels = default_config.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    Ok(CaptureConfig {
        device,
        stream_config,
        native_rate,
    })
}

/// cpal's errors are strings at this layer; sort the unretryable ones out.
fn classify(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("not authorized") || lower.contains("denied")
    {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::Device(message)
    }
}

/// Linear resampler, mono f32, overwriting `out`. Like the downmix helper
/// it writes into a reused buffer; the callback never allocates here once
/// the scratch buffers have reached their steady-state size.
fn resample_into(input: &[f32], from_rate: u32, to_rate: u32, out: &mut Vec<f32>) {
    out.clear();
    if from_rate == to_rate {
        out.extend_from_slice(input);
        return;
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        out.push(s0 + frac * (s1 - s0));
    }
}

/// Start one capture stream. Returns the cpal `Stream` (must be kept alive).
///
/// The producer is shared so a rebuilt stream after a device failure keeps
/// feeding the same channel; the lock is uncontended in steady state.
pub fn start_capture(
    producer: Arc<Mutex<ChunkProducer>>,
    device_name: Option<&str>,
    target_rate: u32,
    err_tx: std_mpsc::Sender<String>,
) -> Result<Stream, CaptureError> {
    let cfg = resolve_device(device_name)?;
    let native_rate = cfg.native_rate;
    let channels = cfg.stream_config.channels;
    let needs_resample = native_rate != target_rate;
    let needs_downmix = channels > 1;

    // Scratch buffers, sized for a generous callback (~100 ms at the
    // native rate). The callback reuses them in place, so after the first
    // few invocations the hot path performs no heap allocation — only the
    // pre-sized ring writes.
    let scratch = (native_rate as usize / 10).max(CHUNK_SAMPLES) * channels as usize;
    let mut mono_buf: Vec<f32> = Vec::with_capacity(scratch);
    let mut resample_buf: Vec<f32> = Vec::with_capacity(scratch);
    let mut chunk_buf: Vec<i16> = Vec::with_capacity(scratch + CHUNK_SAMPLES);

    let stream = cfg
        .device
        .build_input_stream(
            &cfg.stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono: &[f32] = if needs_downmix {
                    downmix_into(data, channels, &mut mono_buf);
                    &mono_buf
                } else {
                    data
                };

                let resampled: &[f32] = if needs_resample {
                    resample_into(mono, native_rate, target_rate, &mut resample_buf);
                    &resample_buf
                } else {
                    mono
                };

                append_as_i16(resampled, &mut chunk_buf);
                while chunk_buf.len() >= CHUNK_SAMPLES {
                    if let Ok(mut prod) = producer.lock() {
                        let written = prod.push_slice(&chunk_buf[..CHUNK_SAMPLES]);
                        if written < CHUNK_SAMPLES {
                            // Channel full — oldest audio is lost; the
                            // consumer will catch up.
                        }
                    }
                    // Shift the tail down in place; nothing is collected.
                    chunk_buf.drain(..CHUNK_SAMPLES);
                }
            },
            move |err| {
                error!("Audio input stream error: {}", err);
                let _ = err_tx.send(err.to_string());
            },
            None,
        )
        .map_err(|e| classify(format!("Failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| classify(format!("Failed to start input stream: {e}")))?;

    info!(native_rate, channels, "Audio capture started");

    Ok(stream)
}

/// Owns the capture stream on its own OS thread and restarts it after
/// device failures. The stream handle never crosses threads (cpal streams
/// are not `Send`), which is why this is a thread and not a task.
pub struct CaptureSupervisor {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CaptureSupervisor {
    pub fn spawn(
        producer: ChunkProducer,
        device_name: Option<String>,
        target_rate: u32,
        status_tx: mpsc::UnboundedSender<CaptureStatus>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let shared = Arc::new(Mutex::new(producer));
            let mut backoff = RECONNECT_INITIAL;

            while !stop_flag.load(Ordering::Acquire) {
                let (err_tx, err_rx) = std_mpsc::channel::<String>();
                match start_capture(
                    Arc::clone(&shared),
                    device_name.as_deref(),
                    target_rate,
                    err_tx,
                ) {
                    Ok(stream) => {
                        let _ = status_tx.send(CaptureStatus::Up);
                        backoff = RECONNECT_INITIAL;

                        // Park until the stream errors or we are stopped.
                        let reason = loop {
                            match err_rx.recv_timeout(Duration::from_millis(100)) {
                                Ok(e) => break Some(e),
                                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                                    if stop_flag.load(Ordering::Acquire) {
                                        break None;
                                    }
                                }
                                Err(std_mpsc::RecvTimeoutError::Disconnected) => break None,
                            }
                        };
                        drop(stream);

                        match reason {
                            Some(e) if !stop_flag.load(Ordering::Acquire) => {
                                warn!("Capture stream lost: {} — reconnecting", e);
                                let _ = status_tx.send(CaptureStatus::Down { reason: e });
                            }
                            _ => break,
                        }
                    }
                    Err(CaptureError::PermissionDenied(reason)) => {
                        error!("Microphone access denied: {}", reason);
                        let _ = status_tx.send(CaptureStatus::Fatal { reason });
                        return;
                    }
                    Err(CaptureError::Device(reason)) => {
                        warn!("Capture unavailable: {} — retrying in {:?}", reason, backoff);
                        let _ = status_tx.send(CaptureStatus::Down { reason });
                    }
                }

                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(RECONNECT_CAP);
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the thread to exit and wait for it.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureSupervisor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
