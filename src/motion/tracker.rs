//! Sliding-window hysteresis for motion verdicts.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    Recording,
}

/// What the caller should do after feeding one verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    None,
    StartRecording,
    StopRecording,
}

/// Bounded FIFO of the most recent verdicts.
#[derive(Clone, Debug)]
pub struct MotionWindow {
    verdicts: VecDeque<bool>,
    capacity: usize,
}

impl MotionWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            verdicts: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn push(&mut self, changed: bool) {
        self.verdicts.push_back(changed);
        while self.verdicts.len() > self.capacity {
            self.verdicts.pop_front();
        }
    }

    pub fn detected(&self) -> usize {
        self.verdicts.iter().filter(|v| **v).count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct MotionTracker {
    window: MotionWindow,
    linger: Duration,
    state: MotionState,
    last_detected: Option<Instant>,
}

impl MotionTracker {
    pub fn new(frame_count: usize, linger: Duration) -> Self {
        Self {
            window: MotionWindow::new(frame_count),
            linger,
            state: MotionState::Idle,
            last_detected: None,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Feed one verdict observed at `now`.
    ///
    /// Recording starts once every slot of a full window is a detection and
    /// continues while any detection remains in the window. It stops once no
    /// detection has been seen for longer than the linger period.
    pub fn observe(&mut self, changed: bool, now: Instant) -> Transition {
        self.window.push(changed);
        let detected = self.window.detected();
        let recording = self.state == MotionState::Recording;

        if detected == self.window.capacity() || (recording && detected > 0) {
            self.last_detected = Some(now);
            if !recording {
                self.state = MotionState::Recording;
                return Transition::StartRecording;
            }
            return Transition::None;
        }

        if recording {
            let quiet = self
                .last_detected
                .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
            if quiet > self.linger {
                self.state = MotionState::Idle;
                return Transition::StopRecording;
            }
        }
        Transition::None
    }

    /// Drop back to idle without a stop transition (recording never began).
    pub fn reset_to_idle(&mut self) {
        self.state = MotionState::Idle;
    }
}
