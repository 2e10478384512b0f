//! Server-wide cancellation.
//!
//! Every long-lived loop (accept loop, decoder readers, pump relays, motion
//! analysis, live viewers) holds a clone of the same `ShutdownToken` and
//! checks it once per frame or read cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    stopped: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an orderly stop. Idempotent.
    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        !self.is_stopped()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_observe_trigger() {
        let token = ShutdownToken::new();
        let other = token.clone();
        assert!(other.is_running());
        token.trigger();
        assert!(other.is_stopped());
        token.trigger();
        assert!(token.is_stopped());
    }
}
