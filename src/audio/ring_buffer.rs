//! Audio buffers: the rolling pre-wake window and the SPSC capture channel.
//!
//! [`CircularBuffer`] keeps the most recent N seconds of PCM so a wake
//! trigger can prepend audio from *before* the detection. Writes overwrite
//! the oldest data; snapshots copy out in chronological order. The critical
//! section is a bounded memcpy, so the capture thread never blocks for
//! longer than one chunk copy.
//!
//! [`capture_channel`] is the lock-free single-producer single-consumer
//! path from the cpal callback to the processing task, built on `ringbuf`.

use std::sync::Mutex;

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

// ---------------------------------------------------------------------------
// CircularBuffer — rolling window (C1)
// ---------------------------------------------------------------------------

struct Ring {
    buf: Vec<i16>,
    /// Next write position (wraps around capacity).
    write_pos: usize,
    /// Valid samples stored, ≤ capacity.
    len: usize,
}

/// Fixed-capacity rolling window over the most recent samples.
///
/// Single writer by policy (the pipeline task); any thread may snapshot.
pub struct CircularBuffer {
    inner: Mutex<Ring>,
    capacity: usize,
    sample_rate: u32,
}

impl CircularBuffer {
    /// Allocate a window holding `duration_seconds` of audio at
    /// `sample_rate`. Storage is sized once and never reallocated.
    pub fn new(duration_seconds: f64, sample_rate: u32) -> Self {
        let capacity = ((duration_seconds * sample_rate as f64) as usize).max(1);
        Self {
            inner: Mutex::new(Ring {
                buf: vec![0i16; capacity],
                write_pos: 0,
                len: 0,
            }),
            capacity,
            sample_rate,
        }
    }

    /// Append samples, overwriting the oldest data when full. Never fails.
    pub fn write(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        // A write larger than the window only keeps its own tail.
        let samples = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };

        let mut ring = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        for &s in samples {
            let pos = ring.write_pos;
            ring.buf[pos] = s;
            ring.write_pos = (pos + 1) % self.capacity;
        }
        ring.len = (ring.len + samples.len()).min(self.capacity);
    }

    /// Copy out everything currently buffered, oldest first.
    pub fn snapshot(&self) -> Vec<i16> {
        let ring = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::copy_tail(&ring, ring.len, self.capacity)
    }

    /// Copy out at most the most recent `secs` seconds, oldest first.
    pub fn snapshot_last(&self, secs: f64) -> Vec<i16> {
        let want = (secs * self.sample_rate as f64) as usize;
        let ring = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::copy_tail(&ring, want.min(ring.len), self.capacity)
    }

    fn copy_tail(ring: &Ring, count: usize, capacity: usize) -> Vec<i16> {
        if count == 0 {
            return Vec::new();
        }
        // Oldest of the requested span sits `count` positions behind the
        // write head, modulo capacity.
        let start = (ring.write_pos + capacity - count) % capacity;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(ring.buf[(start + i) % capacity]);
        }
        out
    }

    /// Number of samples currently buffered.
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(g) => g.len,
            Err(poisoned) => poisoned.into_inner().len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// SPSC capture channel (callback thread → processing task)
// ---------------------------------------------------------------------------

/// Default SPSC capacity: ~10 seconds of 16 kHz mono audio.
const DEFAULT_CHANNEL_CAPACITY: usize = 160_000;

/// Producer half — lives in the cpal audio callback thread.
pub struct ChunkProducer {
    inner: ringbuf::HeapProd<i16>,
}

/// Consumer half — lives in the audio processing task.
pub struct ChunkConsumer {
    inner: ringbuf::HeapCons<i16>,
}

/// Create a matched producer/consumer pair backed by a lock-free ring.
pub fn capture_channel(capacity: Option<usize>) -> (ChunkProducer, ChunkConsumer) {
    let cap = capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
    let rb = HeapRb::<i16>::new(cap);
    let (prod, cons) = rb.split();
    (ChunkProducer { inner: prod }, ChunkConsumer { inner: cons })
}

impl ChunkProducer {
    /// Push samples; returns how many were written (less than the slice
    /// length when the channel is full — the consumer will catch up).
    pub fn push_slice(&mut self, samples: &[i16]) -> usize {
        self.inner.push_slice(samples)
    }
}

// Safety: each half is used from a single thread (capture callback /
// processing task), which is exactly the SPSC contract.
unsafe impl Send for ChunkProducer {}

impl ChunkConsumer {
    /// Pop up to `buf.len()` samples; returns how many were read.
    pub fn pop_slice(&mut self, buf: &mut [i16]) -> usize {
        self.inner.pop_slice(buf)
    }

    /// Samples currently available for reading.
    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Drain everything available into a Vec.
    pub fn drain_all(&mut self) -> Vec<i16> {
        let n = self.available();
        if n == 0 {
            return Vec::new();
        }
        let mut buf = vec![0i16; n];
        let read = self.pop_slice(&mut buf);
        buf.truncate(read);
        buf
    }
}

unsafe impl Send for ChunkConsumer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_snapshots_empty() {
        let rb = CircularBuffer::new(1.0, 16_000);
        assert!(rb.snapshot().is_empty());
        assert!(rb.is_empty());
    }

    #[test]
    fn snapshot_length_is_min_of_written_and_capacity() {
        // P1: snapshot().len() == min(B, D*S)
        let rb = CircularBuffer::new(1.0, 100); // capacity 100
        rb.write(&[1i16; 40]);
        assert_eq!(rb.snapshot().len(), 40);
        rb.write(&[2i16; 80]);
        assert_eq!(rb.snapshot().len(), 100);
    }

    #[test]
    fn snapshot_is_suffix_of_writes() {
        // P2: snapshot is a contiguous suffix of all writes concatenated.
        let rb = CircularBuffer::new(1.0, 8); // capacity 8
        rb.write(&[1, 2, 3, 4, 5]);
        rb.write(&[6, 7, 8, 9, 10]);
        assert_eq!(rb.snapshot(), vec![3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn oversized_write_keeps_its_tail() {
        let rb = CircularBuffer::new(1.0, 4); // capacity 4
        let big: Vec<i16> = (0..10).collect();
        rb.write(&big);
        assert_eq!(rb.snapshot(), vec![6, 7, 8, 9]);
    }

    #[test]
    fn snapshot_last_limits_to_recent_seconds() {
        let rb = CircularBuffer::new(2.0, 10); // capacity 20, 10 samples/sec
        let data: Vec<i16> = (0..20).collect();
        rb.write(&data);
        let last = rb.snapshot_last(0.5); // 5 samples
        assert_eq!(last, vec![15, 16, 17, 18, 19]);
    }

    #[test]
    fn snapshot_last_caps_at_available() {
        let rb = CircularBuffer::new(2.0, 10);
        rb.write(&[1, 2, 3]);
        assert_eq!(rb.snapshot_last(5.0), vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_write_and_snapshot() {
        use std::sync::Arc;

        let rb = Arc::new(CircularBuffer::new(1.0, 16_000));
        let writer = {
            let rb = Arc::clone(&rb);
            std::thread::spawn(move || {
                for i in 0..100 {
                    rb.write(&vec![i as i16; 160]);
                }
            })
        };
        for _ in 0..50 {
            let snap = rb.snapshot();
            assert!(snap.len() <= rb.capacity());
        }
        writer.join().unwrap();
        assert_eq!(rb.len(), 16_000);
    }

    #[test]
    fn spsc_roundtrip() {
        let (mut tx, mut rx) = capture_channel(Some(16));
        assert_eq!(tx.push_slice(&[1, 2, 3]), 3);
        assert_eq!(rx.available(), 3);
        assert_eq!(rx.drain_all(), vec![1, 2, 3]);
        assert_eq!(rx.available(), 0);
    }

    #[test]
    fn spsc_full_channel_truncates_push() {
        let (mut tx, _rx) = capture_channel(Some(4));
        assert_eq!(tx.push_slice(&[1, 2, 3, 4, 5, 6]), 4);
    }
}
