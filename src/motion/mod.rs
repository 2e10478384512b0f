//! Motion engine: an analysis thread per feed that samples frames handed
//! over by the feed's capture subscription and starts or stops recordings.

pub mod detect;
pub mod recording;
pub mod tracker;

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::feed::Feed;
use crate::registry::FeedRegistry;
use crate::shutdown::ShutdownToken;
use crate::slot::FrameSlot;

pub use tracker::{MotionState, MotionTracker, MotionWindow, Transition};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct MotionEngine {
    slot: FrameSlot,
    active: AtomicBool,
}

impl MotionEngine {
    /// Start the analysis thread for `feed`. The feed must have motion
    /// settings.
    pub fn spawn(
        feed: Arc<Feed>,
        registry: Arc<FeedRegistry>,
        shutdown: ShutdownToken,
    ) -> Result<Arc<Self>> {
        if feed.config.motion.is_none() {
            return Err(anyhow!("feed {} has no motion settings", feed.config.name));
        }
        let engine = Arc::new(Self {
            slot: FrameSlot::new(),
            active: AtomicBool::new(true),
        });
        let worker = Arc::clone(&engine);
        std::thread::Builder::new()
            .name(format!("motion-{}", feed.config.name))
            .spawn(move || worker.analyse(&feed, &registry, &shutdown))
            .map_err(|err| anyhow!("could not start motion thread: {}", err))?;
        Ok(engine)
    }

    /// Hand a frame to the analysis thread. Dropped if it is still busy.
    pub fn offer(&self, frame: &[u8]) -> bool {
        self.is_active() && self.slot.offer(frame)
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.slot.wake();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn analyse(&self, feed: &Feed, registry: &Arc<FeedRegistry>, shutdown: &ShutdownToken) {
        let Some(motion) = feed.config.motion.as_ref() else {
            return;
        };
        let name = &feed.config.name;
        log::info!("[{}] motion detection started", name);

        let mut tracker = MotionTracker::new(motion.frame_count, motion.linger);
        let mut previous: Option<RgbImage> = None;

        while shutdown.is_running() && self.is_active() {
            let Some(frame) = self.slot.take(POLL_INTERVAL) else {
                continue;
            };
            let decoded = detect::downsample(&frame);
            drop(frame);
            let current = match decoded {
                Ok(image) => image,
                Err(err) => {
                    log::debug!("[{}] skipping frame: {:#}", name, err);
                    continue;
                }
            };

            let verdict = previous
                .as_ref()
                .and_then(|prev| detect::changed_percentage(prev, &current, motion.ignore_percentage));
            previous = Some(current);
            let Some(percentage) = verdict else {
                continue;
            };

            let changed = percentage > motion.change_percentage;
            log::debug!(
                "[{}] {} {:.1} %",
                name,
                if changed { "change" } else { "no change" },
                percentage
            );

            match tracker.observe(changed, Instant::now()) {
                Transition::StartRecording => {
                    if let Err(err) = feed.start_recording(registry, shutdown) {
                        log::error!("[{}] recording failed to start: {:#}", name, err);
                        tracker.reset_to_idle();
                    }
                }
                Transition::StopRecording => feed.stop_recording(),
                Transition::None => {}
            }
        }

        feed.stop_recording();
        self.active.store(false, Ordering::SeqCst);
        log::info!("[{}] motion detection stopped", name);
    }
}
