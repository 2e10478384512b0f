//! Runtime feed state and the always-on capture subscription.
//!
//! A feed's snapshot buffer and its recording reference are the only state
//! that changes after startup. Both sit behind feed-scoped locks; nothing
//! ever locks two feeds at once.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::config::FeedConfig;
use crate::motion::recording::Recording;
use crate::motion::MotionEngine;
use crate::registry::{FeedEvent, FeedRegistry, Subscription};
use crate::shutdown::ShutdownToken;
use crate::snapshot::SnapshotCache;

pub struct Feed {
    pub config: FeedConfig,
    snapshot: Option<SnapshotCache>,
    recording: Mutex<Option<Recording>>,
}

impl Feed {
    pub fn new(config: FeedConfig) -> Self {
        let snapshot = config.snapshot_interval.map(SnapshotCache::new);
        Self {
            config,
            snapshot,
            recording: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn snapshot(&self) -> Option<&SnapshotCache> {
        self.snapshot.as_ref()
    }

    /// Most recent cached frame, if snapshots are enabled and one exists.
    pub fn latest_snapshot(&self) -> Option<Vec<u8>> {
        self.snapshot.as_ref().and_then(SnapshotCache::latest)
    }

    fn recording(&self) -> MutexGuard<'_, Option<Recording>> {
        self.recording.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_recording(&self) -> bool {
        self.recording().as_ref().is_some_and(Recording::is_open)
    }

    /// Open a new recording. Any previous recording is stopped first.
    pub fn start_recording(
        &self,
        registry: &Arc<FeedRegistry>,
        shutdown: &ShutdownToken,
    ) -> Result<()> {
        let motion = self
            .config
            .motion
            .as_ref()
            .ok_or_else(|| anyhow!("feed {} has no motion settings", self.config.name))?;
        let mut slot = self.recording();
        if let Some(previous) = slot.take() {
            previous.stop();
        }
        let recording = Recording::start(
            registry,
            &self.config.name,
            &self.config.input,
            motion,
            shutdown,
        )?;
        log::info!(
            "[{}] recording to {}",
            self.config.name,
            recording.path().display()
        );
        *slot = Some(recording);
        Ok(())
    }

    pub fn stop_recording(&self) {
        if let Some(recording) = self.recording().take() {
            recording.stop();
            log::info!(
                "[{}] recording stopped: {}",
                self.config.name,
                recording.path().display()
            );
        }
    }
}

/// Subscribe the snapshot cache and motion engine of `feed` to its input.
///
/// Returns `Ok(None)` when the feed needs neither.
pub fn start_capture(
    feed: &Arc<Feed>,
    registry: &Arc<FeedRegistry>,
    shutdown: &ShutdownToken,
) -> Result<Option<Subscription>> {
    if !feed.config.needs_capture() {
        return Ok(None);
    }

    let engine = match &feed.config.motion {
        Some(_) => Some(MotionEngine::spawn(
            Arc::clone(feed),
            Arc::clone(registry),
            shutdown.clone(),
        )?),
        None => None,
    };
    let sample_interval = feed
        .config
        .motion
        .as_ref()
        .map(|motion| motion.sample_interval)
        .unwrap_or_default();

    let capture = Arc::clone(feed);
    let running = shutdown.clone();
    let sampler = engine.clone();
    let mut last_sample: Option<Instant> = None;
    let subscribed = registry.subscribe(&feed.config.input, move |event| {
        let frame = match event {
            FeedEvent::Frame(frame) => frame,
            FeedEvent::Ended => {
                log::warn!("[{}] input process ended", capture.name());
                if let Some(engine) = &sampler {
                    engine.stop();
                }
                return false;
            }
        };

        if let Some(cache) = capture.snapshot() {
            cache.offer(frame);
        }

        if let Some(engine) = &sampler {
            let now = Instant::now();
            let due = last_sample
                .map_or(true, |at| now.saturating_duration_since(at) >= sample_interval);
            if due {
                last_sample = Some(now);
                engine.offer(frame);
            }
        }

        if running.is_running() {
            return true;
        }
        if let Some(engine) = &sampler {
            engine.stop();
        }
        false
    });

    match subscribed {
        Ok(subscription) => {
            log::info!("[{}] capture started", feed.name());
            Ok(Some(subscription))
        }
        Err(err) => {
            if let Some(engine) = engine {
                engine.stop();
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn snapshot_cache_only_when_interval_set() {
        let cfg = ServerConfig::from_json(
            r#"{"Feeds":[
                {"Name":"a","InputProcessName":"x"},
                {"Name":"b","InputProcessName":"x","SnapshotSecondsInterval":1}
            ]}"#,
        )
        .unwrap();
        let a = Feed::new(cfg.feeds[0].clone());
        let b = Feed::new(cfg.feeds[1].clone());
        assert!(a.snapshot().is_none());
        assert!(b.snapshot().is_some());
        assert!(b.latest_snapshot().is_none());
        assert!(!b.is_recording());
    }

    #[test]
    fn capture_is_skipped_for_plain_feeds() {
        let cfg = ServerConfig::from_json(r#"{"Feeds":[{"Name":"a","InputProcessName":"x"}]}"#)
            .unwrap();
        let feed = Arc::new(Feed::new(cfg.feeds[0].clone()));
        let registry = FeedRegistry::new(ShutdownToken::new());
        assert!(start_capture(&feed, &registry, &ShutdownToken::new())
            .unwrap()
            .is_none());
        assert_eq!(registry.stats().processes_launched, 0);
    }
}
