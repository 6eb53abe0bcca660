//! PCM playback through a rodio sink.
//!
//! One output stream and one sink per speaker. The sink handle is also
//! reachable from outside a speak call so an interrupt can cut playback
//! immediately instead of waiting for the queue to drain.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tracing::{info, warn};

/// Look up an output device by its exact name.
fn find_output_device(name: &str) -> Option<cpal::Device> {
    cpal::default_host()
        .output_devices()
        .ok()?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
}

/// Open the requested output, or the system default when no name is given
/// or the named device has vanished since it was configured.
fn open_output(device_name: Option<&str>) -> anyhow::Result<(OutputStream, OutputStreamHandle)> {
    if let Some(name) = device_name {
        match find_output_device(name) {
            Some(device) => {
                info!(device = %name, "Opening configured output device");
                return OutputStream::try_from_device(&device)
                    .map_err(|e| anyhow::anyhow!("output device '{name}' refused to open: {e}"));
            }
            None => {
                warn!(requested = %name, "Configured output device missing; using default");
            }
        }
    }
    OutputStream::try_default().map_err(|e| anyhow::anyhow!("no usable audio output: {e}"))
}

/// Plays 16-bit PCM with volume control and an externally stoppable sink.
pub struct AudioPlayer {
    // Dropping the stream kills audio, so it rides along unused.
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
    sink: Arc<Sink>,
}

impl AudioPlayer {
    pub fn new(device_name: Option<&str>) -> anyhow::Result<Self> {
        let (stream, stream_handle) = open_output(device_name)?;
        let sink = Sink::try_new(&stream_handle)
            .map_err(|e| anyhow::anyhow!("could not create playback sink: {e}"))?;
        Ok(Self {
            _stream: stream,
            _stream_handle: stream_handle,
            sink: Arc::new(sink),
        })
    }

    /// Set playback volume (0.0 = silent, 1.0 = full volume).
    pub fn set_volume(&self, volume: f32) {
        self.sink.set_volume(volume.clamp(0.0, 1.0));
    }

    /// Queue PCM for playback (non-blocking).
    pub fn append(&self, pcm: Vec<i16>, sample_rate: u32) {
        let source = rodio::buffer::SamplesBuffer::new(1, sample_rate, pcm);
        self.sink.append(source);
    }

    /// True while queued audio is still playing.
    pub fn is_busy(&self) -> bool {
        !self.sink.empty()
    }

    /// Stop current playback immediately and drop queued audio.
    pub fn stop(&self) {
        self.sink.stop();
    }

    /// Clonable handle to the sink for stopping playback from outside.
    pub fn sink_handle(&self) -> Arc<Sink> {
        Arc::clone(&self.sink)
    }
}

// SAFETY: `OutputStream` is !Send/!Sync because some cpal backends keep
// thread-affine state behind it. This player never exposes the stream; the
// speaker that owns it serializes every call that touches the device (one
// speak at a time), and the only piece other threads reach — the `Sink`
// behind the Arc — does its own locking. Moving the struct between tasks
// is therefore fine as long as that single-caller discipline holds, which
// the speaker's `&self` + one-request-at-a-time pipeline guarantees.
unsafe impl Send for AudioPlayer {}
unsafe impl Sync for AudioPlayer {}
