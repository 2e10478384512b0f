//! Single-slot frame mailbox.
//!
//! A producer (a feed subscription callback) offers frames; a consumer
//! thread takes them. The slot holds at most one frame and refuses new ones
//! while the previous frame is waiting or still being processed, so the
//! consumer always sees the newest frame it can keep up with and nothing is
//! ever queued.

use std::ops::Deref;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Empty,
    Filled,
    Busy,
}

#[derive(Debug)]
struct SlotState {
    buffer: Vec<u8>,
    len: usize,
    status: Status,
}

#[derive(Debug)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                buffer: Vec::new(),
                len: 0,
                status: Status::Empty,
            }),
            ready: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy `frame` into the slot if it is free. Returns `false` (frame
    /// dropped) while a previous frame is pending or being consumed.
    pub fn offer(&self, frame: &[u8]) -> bool {
        let mut state = self.state();
        if state.status != Status::Empty {
            return false;
        }
        if state.buffer.len() < frame.len() {
            state.buffer.resize(frame.len() * 2, 0);
        }
        state.buffer[..frame.len()].copy_from_slice(frame);
        state.len = frame.len();
        state.status = Status::Filled;
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Wait up to `timeout` for a frame. The slot stays busy until the
    /// returned guard is dropped.
    pub fn take(&self, timeout: Duration) -> Option<SlotFrame<'_>> {
        let state = self.state();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.status != Status::Filled)
            .unwrap_or_else(PoisonError::into_inner);
        if state.status != Status::Filled {
            return None;
        }
        state.status = Status::Busy;
        let bytes = std::mem::take(&mut state.buffer);
        let len = state.len;
        Some(SlotFrame {
            slot: self,
            bytes,
            len,
        })
    }

    /// Whether a frame is pending or being consumed.
    pub fn is_busy(&self) -> bool {
        self.state().status != Status::Empty
    }

    /// Wake any waiting consumer without delivering a frame.
    pub fn wake(&self) {
        self.ready.notify_all();
    }
}

/// A frame borrowed out of a [`FrameSlot`]. Dropping it frees the slot.
pub struct SlotFrame<'a> {
    slot: &'a FrameSlot,
    bytes: Vec<u8>,
    len: usize,
}

impl Deref for SlotFrame<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Drop for SlotFrame<'_> {
    fn drop(&mut self) {
        let mut state = self.slot.state();
        state.buffer = std::mem::take(&mut self.bytes);
        state.len = 0;
        state.status = Status::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn busy_slot_drops_new_frames() {
        let slot = FrameSlot::new();
        assert!(slot.offer(b"one"));
        assert!(!slot.offer(b"two"));

        let frame = slot.take(Duration::from_millis(10)).unwrap();
        assert_eq!(&*frame, b"one");
        assert!(slot.is_busy());
        assert!(!slot.offer(b"three"));
        drop(frame);

        assert!(!slot.is_busy());
        assert!(slot.offer(b"four!"));
        assert_eq!(&*slot.take(Duration::from_millis(10)).unwrap(), b"four!");
    }

    #[test]
    fn take_times_out_when_empty() {
        let slot = FrameSlot::new();
        assert!(slot.take(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn consumer_thread_is_woken_by_offer() {
        let slot = Arc::new(FrameSlot::new());
        let consumer = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                slot.take(Duration::from_secs(5))
                    .map(|frame| frame.to_vec())
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(slot.offer(&[0xFF, 0xD8, 0xFF, 0xD9]));
        assert_eq!(consumer.join().unwrap(), Some(vec![0xFF, 0xD8, 0xFF, 0xD9]));
    }
}
