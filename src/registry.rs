//! Feed registry: one decoder process per process key, fanned out to any
//! number of subscribers.
//!
//! The first `subscribe` for a key launches the decoder and its reader
//! thread. Later subscribers attach to the running entry. The reader thread
//! delivers every extracted frame to every live subscriber in subscription
//! order, and retires the entry (killing the process) once no subscriber is
//! left or the stream ends.
//!
//! Lifecycle of an entry is decided under the registry lock only:
//! - creation happens inside `subscribe` while the lock is held, so two
//!   concurrent subscribers can never launch the same key twice;
//! - removal happens in the reader thread while the lock is held, after
//!   re-checking that no subscriber attached in the meantime.

use anyhow::Result;
use std::collections::HashMap;
use std::process::{Child, ChildStdout};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::mjpeg::{Extraction, FrameExtractor};
use crate::process::{self, Pipes, ProcessKey, ProcessSpec};
use crate::shutdown::ShutdownToken;

/// What a subscriber receives from the reader thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedEvent<'a> {
    /// One extracted JPEG, valid only for the duration of the call.
    Frame(&'a [u8]),
    /// The source is gone. Delivered at most once, and never after the
    /// subscriber returned `false` or was cancelled.
    Ended,
}

type Callback = Box<dyn FnMut(FeedEvent<'_>) -> bool + Send>;

struct Subscriber {
    cancelled: Arc<AtomicBool>,
    callback: Callback,
}

impl Subscriber {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle to a registered subscriber.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::cancel`]
/// or return `false` from the callback.
#[derive(Clone, Debug)]
pub struct Subscription {
    cancelled: Arc<AtomicBool>,
}

impl Subscription {
    /// Stop delivery. The callback is dropped before the next frame.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Running decoder. Killed and reaped when dropped.
struct Decoder {
    child: Child,
}

impl Drop for Decoder {
    fn drop(&mut self) {
        process::kill(&mut self.child);
    }
}

struct FeedEntry {
    key: ProcessKey,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl FeedEntry {
    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver one frame. Returns `true` while any subscriber remains.
    fn dispatch(&self, frame: &[u8]) -> bool {
        let mut current = std::mem::take(&mut *self.subscribers());
        current.retain_mut(|sub| !sub.is_cancelled() && (sub.callback)(FeedEvent::Frame(frame)));

        let mut guard = self.subscribers();
        // Anyone who attached during delivery goes after the survivors.
        let attached = std::mem::take(&mut *guard);
        current.extend(attached);
        current.retain(|sub| !sub.is_cancelled());
        *guard = current;
        !guard.is_empty()
    }
}

/// Point-in-time registry counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_feeds: usize,
    pub processes_launched: u64,
}

pub struct FeedRegistry {
    entries: Mutex<HashMap<ProcessKey, Arc<FeedEntry>>>,
    shutdown: ShutdownToken,
    launched: AtomicU64,
}

impl FeedRegistry {
    pub fn new(shutdown: ShutdownToken) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            shutdown,
            launched: AtomicU64::new(0),
        })
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ProcessKey, Arc<FeedEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` for frames of the decoder described by `spec`.
    ///
    /// Launches the decoder if no entry exists for the key. A launch failure
    /// is returned to this caller and nothing is registered.
    pub fn subscribe<F>(self: &Arc<Self>, spec: &ProcessSpec, callback: F) -> Result<Subscription>
    where
        F: FnMut(FeedEvent<'_>) -> bool + Send + 'static,
    {
        let key = spec.key();
        let cancelled = Arc::new(AtomicBool::new(false));
        let subscriber = Subscriber {
            cancelled: cancelled.clone(),
            callback: Box::new(callback),
        };

        let mut entries = self.entries();
        if let Some(entry) = entries.get(&key) {
            entry.subscribers().push(subscriber);
            log::debug!("attached subscriber to running feed process {}", key);
            return Ok(Subscription { cancelled });
        }

        let mut decoder = Decoder {
            child: process::spawn(spec, Pipes::Output)?,
        };
        let Some(stdout) = decoder.child.stdout.take() else {
            anyhow::bail!("decoder '{}' has no stdout pipe", spec);
        };
        if let Some(stderr) = decoder.child.stderr.take() {
            process::drain_stderr(stderr, key.to_string(), false);
        }

        let entry = Arc::new(FeedEntry {
            key: key.clone(),
            subscribers: Mutex::new(vec![subscriber]),
        });
        entries.insert(key.clone(), entry.clone());
        self.launched.fetch_add(1, Ordering::SeqCst);

        let registry = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("feed-reader".to_string())
            .spawn(move || registry.read_feed(entry, decoder, stdout));
        if let Err(err) = spawned {
            // Dropping the closure already killed the decoder.
            entries.remove(&key);
            return Err(anyhow::anyhow!("could not start reader thread for {}: {}", key, err));
        }

        log::info!("started feed process {}", key);
        Ok(Subscription { cancelled })
    }

    /// Whether a decoder is currently running for `spec`'s key.
    pub fn is_active(&self, spec: &ProcessSpec) -> bool {
        self.entries().contains_key(&spec.key())
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_feeds: self.entries().len(),
            processes_launched: self.launched.load(Ordering::SeqCst),
        }
    }

    fn read_feed(&self, entry: Arc<FeedEntry>, decoder: Decoder, mut stdout: ChildStdout) {
        let mut extractor = FrameExtractor::new();
        let remaining = loop {
            let outcome = extractor.run(&mut stdout, |frame| {
                entry.dispatch(frame) && self.shutdown.is_running()
            });
            match outcome {
                Ok(Extraction::Stopped) if self.shutdown.is_running() => {
                    if let Some(remaining) = self.retire_if_idle(&entry) {
                        break remaining;
                    }
                    // A subscriber attached after the last frame went out.
                }
                Ok(Extraction::Stopped) | Ok(Extraction::EndOfStream) => {
                    break self.retire(&entry);
                }
                Err(err) => {
                    log::warn!("feed process {} read failed: {}", entry.key, err);
                    break self.retire(&entry);
                }
            }
        };

        drop(stdout);
        drop(decoder);

        for mut sub in remaining {
            if !sub.is_cancelled() {
                (sub.callback)(FeedEvent::Ended);
            }
        }
        log::info!("stopped feed process {}", entry.key);
    }

    /// Remove the entry if it still has no subscribers.
    fn retire_if_idle(&self, entry: &Arc<FeedEntry>) -> Option<Vec<Subscriber>> {
        let mut entries = self.entries();
        let mut subscribers = entry.subscribers();
        subscribers.retain(|sub| !sub.is_cancelled());
        if !subscribers.is_empty() {
            return None;
        }
        entries.remove(&entry.key);
        Some(Vec::new())
    }

    /// Remove the entry unconditionally and hand back whoever is left.
    fn retire(&self, entry: &Arc<FeedEntry>) -> Vec<Subscriber> {
        let mut entries = self.entries();
        entries.remove(&entry.key);
        std::mem::take(&mut *entry.subscribers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(callbacks: Vec<Callback>) -> FeedEntry {
        FeedEntry {
            key: ProcessSpec::new("test", "").key(),
            subscribers: Mutex::new(
                callbacks
                    .into_iter()
                    .map(|callback| Subscriber {
                        cancelled: Arc::new(AtomicBool::new(false)),
                        callback,
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn dispatch_drops_subscribers_that_decline() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = seen.clone();
        let b = seen.clone();
        let entry = entry_with(vec![
            Box::new(move |_| {
                a.lock().unwrap().push("a");
                true
            }),
            Box::new(move |_| {
                b.lock().unwrap().push("b");
                false
            }),
        ]);

        assert!(entry.dispatch(b"frame"));
        assert!(entry.dispatch(b"frame"));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "a"]);
        assert_eq!(entry.subscribers().len(), 1);
    }

    #[test]
    fn dispatch_reports_empty_after_last_subscriber_leaves() {
        let entry = entry_with(vec![Box::new(|_| false)]);
        assert!(!entry.dispatch(b"frame"));
    }

    #[test]
    fn cancelled_subscriber_is_skipped() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let entry = entry_with(vec![Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })]);
        entry.subscribers()[0].cancelled.store(true, Ordering::SeqCst);
        assert!(!entry.dispatch(b"frame"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[test]
    fn dropping_decoder_kills_and_reaps_it() {
        let child = process::spawn(&ProcessSpec::new("sleep", "30"), Pipes::Output).unwrap();
        let pid = child.id().to_string();
        drop(Decoder { child });

        let alive = std::process::Command::new("kill")
            .args(["-0", &pid])
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap()
            .success();
        assert!(!alive, "decoder {pid} still running");
    }
}
