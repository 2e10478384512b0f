//! Latest-frame cache for `/snapshot`.
//!
//! Bytes and valid length are written together under one lock and read back
//! as a copy under the same lock, so a reader never observes a mix of two
//! captures.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Buffer {
    bytes: Vec<u8>,
    len: usize,
}

#[derive(Debug)]
pub struct SnapshotCache {
    interval: Duration,
    buffer: Mutex<Buffer>,
    last_capture: Mutex<Option<Instant>>,
}

impl SnapshotCache {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            buffer: Mutex::new(Buffer::default()),
            last_capture: Mutex::new(None),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capture `frame` if the interval has elapsed since the last capture.
    pub fn offer(&self, frame: &[u8]) -> bool {
        self.offer_at(frame, Instant::now())
    }

    pub(crate) fn offer_at(&self, frame: &[u8], now: Instant) -> bool {
        {
            let mut last = self.last_capture.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                if now.saturating_duration_since(previous) < self.interval {
                    return false;
                }
            }
            *last = Some(now);
        }
        self.capture(frame);
        true
    }

    /// Store `frame` unconditionally. The buffer grows to twice the needed
    /// size when too small and never shrinks.
    pub fn capture(&self, frame: &[u8]) {
        let mut buffer = self.buffer();
        if buffer.bytes.len() < frame.len() {
            buffer.bytes.resize(frame.len() * 2, 0);
        }
        buffer.bytes[..frame.len()].copy_from_slice(frame);
        buffer.len = frame.len();
    }

    /// Copy of the most recent capture, if any.
    pub fn latest(&self) -> Option<Vec<u8>> {
        let buffer = self.buffer();
        if buffer.len == 0 {
            return None;
        }
        Some(buffer.bytes[..buffer.len].to_vec())
    }

    pub fn has_snapshot(&self) -> bool {
        self.buffer().len > 0
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer().bytes.len()
    }
}
