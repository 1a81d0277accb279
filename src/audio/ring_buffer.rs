//! Push-to-pull capture adapter.
//! Platform audio APIs hand samples to a callback; the sound loop wants a
//! blocking "give me the next frame" read. `CaptureWriter::push` is called
//! from the callback and only copies into a pre-allocated ring; `RingStream`
//! waits at most one frame period for a full frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::AudioStream;
use crate::error::EngineError;

/// Fixed-size ring of PCM samples. Overwrites the oldest data when full.
pub struct RingBuffer {
    buffer: Box<[i16]>,
    write_pos: usize,
    len: usize,
    overruns: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0i16; capacity.max(1)].into_boxed_slice(),
            write_pos: 0,
            len: 0,
            overruns: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.len
    }

    /// Samples dropped because the reader fell behind.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    #[inline]
    pub fn write(&mut self, samples: &[i16]) {
        let capacity = self.capacity();
        for &s in samples {
            self.buffer[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % capacity;
            if self.len == capacity {
                self.overruns += 1;
            } else {
                self.len += 1;
            }
        }
    }

    /// Read the oldest samples into `output`; returns how many were read.
    #[inline]
    pub fn read(&mut self, output: &mut [i16]) -> usize {
        let capacity = self.capacity();
        let to_read = output.len().min(self.len);
        let start = (self.write_pos + capacity - self.len) % capacity;
        for (i, slot) in output.iter_mut().take(to_read).enumerate() {
            *slot = self.buffer[(start + i) % capacity];
        }
        self.len -= to_read;
        to_read
    }

    /// Discard unread data.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

struct CaptureShared {
    ring: Mutex<RingBuffer>,
    ready: Condvar,
    closed: AtomicBool,
}

/// Writer half, owned by the platform capture callback.
#[derive(Clone)]
pub struct CaptureWriter {
    shared: Arc<CaptureShared>,
}

impl CaptureWriter {
    /// Copy samples in and wake the reader. Dropped once the stream is closed.
    pub fn push(&self, samples: &[i16]) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        self.shared.ring.lock().write(samples);
        self.shared.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Reader half; implements the blocking frame stream.
pub struct RingStream {
    shared: Arc<CaptureShared>,
    frame_timeout: Duration,
}

/// Build a connected writer/stream pair.
/// `frame_timeout` bounds each read, normally one frame period.
pub fn ring_capture(ring: RingBuffer, frame_timeout: Duration) -> (CaptureWriter, RingStream) {
    let shared = Arc::new(CaptureShared {
        ring: Mutex::new(ring),
        ready: Condvar::new(),
        closed: AtomicBool::new(false),
    });
    (
        CaptureWriter {
            shared: Arc::clone(&shared),
        },
        RingStream {
            shared,
            frame_timeout,
        },
    )
}

impl AudioStream for RingStream {
    fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize, EngineError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(EngineError::CaptureStartFailure("capture stream closed".into()));
        }
        let mut ring = self.shared.ring.lock();
        // A frame larger than the ring could never fill.
        if buf.len() > ring.capacity() {
            return Err(EngineError::CaptureStartFailure(format!(
                "frame of {} samples exceeds ring capacity {}",
                buf.len(),
                ring.capacity()
            )));
        }
        if ring.available() < buf.len() {
            // Spurious wakeups just end the wait early; the caller loops.
            let _ = self.shared.ready.wait_for(&mut ring, self.frame_timeout);
            if ring.available() < buf.len() {
                return Ok(0);
            }
        }
        Ok(ring.read(buf))
    }

    fn close(&mut self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            let mut ring = self.shared.ring.lock();
            debug!(unread = ring.available(), overruns = ring.overruns(), "capture stream closed");
            ring.clear();
        }
    }
}
