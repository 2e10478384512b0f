//! Live MJPEG viewers.
//!
//! Each viewer subscribes to its feed's decoder and owns one writer thread.
//! The subscription callback hands frames to the writer through a
//! [`FrameSlot`] and never touches the socket, so a slow client only loses
//! frames instead of holding up the shared reader. A client that has not
//! completed a send for 15 seconds is disconnected.

use anyhow::{anyhow, Result};
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::response::{self, MULTIPART_BOUNDARY};
use crate::process::ProcessSpec;
use crate::registry::{FeedEvent, FeedRegistry};
use crate::shutdown::ShutdownToken;
use crate::slot::FrameSlot;

pub const STALL_TIMEOUT: Duration = Duration::from_secs(15);
const WRITER_POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveOptions {
    /// Bare JPEG concatenation (`video/x-motion-jpeg`) instead of multipart.
    pub raw: bool,
    /// Minimum gap between frames handed to the writer (max FPS).
    pub min_interval: Option<Duration>,
    /// A viewer with no completed send for this long is disconnected.
    pub stall_timeout: Duration,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            raw: false,
            min_interval: None,
            stall_timeout: STALL_TIMEOUT,
        }
    }
}

/// Frame interval for a max-FPS path segment. `None` when the segment is
/// absent or empty.
pub fn parse_max_fps(segment: Option<&str>) -> Result<Option<Duration>> {
    let Some(segment) = segment.filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let fps: f64 = segment
        .parse()
        .map_err(|_| anyhow!("invalid max fps '{}'", segment))?;
    if !fps.is_finite() || fps <= 0.0 {
        return Err(anyhow!("max fps must be positive, got {}", segment));
    }
    let interval = Duration::try_from_secs_f64(1.0 / fps)
        .map_err(|_| anyhow!("max fps {} is out of range", segment))?;
    Ok(Some(interval))
}

/// Zero bytes appended after a raw frame to reach a multiple of 8.
pub fn raw_padding(frame_len: usize) -> usize {
    (8 - frame_len % 8) % 8
}

struct Viewer {
    slot: FrameSlot,
    control: TcpStream,
    closed: AtomicBool,
    last_completed: Mutex<Instant>,
    stall_timeout: Duration,
}

impl Viewer {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.control.shutdown(Shutdown::Both);
            self.slot.wake();
        }
    }

    fn stalled(&self, now: Instant) -> bool {
        let last = *self
            .last_completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last) > self.stall_timeout
    }

    fn write_loop(&self, mut out: TcpStream, raw: bool, shutdown: &ShutdownToken) {
        let part_header = format!(
            "\r\n--{}\r\nContent-type: image/jpeg\r\n\r\n",
            MULTIPART_BOUNDARY
        );
        let padding = [0u8; 8];
        while !self.is_closed() && shutdown.is_running() {
            let Some(frame) = self.slot.take(WRITER_POLL) else {
                continue;
            };
            let sent = if raw {
                out.write_all(&frame)
                    .and_then(|()| out.write_all(&padding[..raw_padding(frame.len())]))
            } else {
                out.write_all(part_header.as_bytes())
                    .and_then(|()| out.write_all(&frame))
            };
            drop(frame);
            match sent {
                Ok(()) => {
                    *self
                        .last_completed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Instant::now();
                }
                Err(err) => {
                    log::debug!("viewer disconnected: {}", err);
                    break;
                }
            }
        }
        self.close();
    }
}

/// Write the response head and attach `stream` to the feed as a viewer.
///
/// On success the socket belongs to the viewer's threads.
pub fn serve(
    mut stream: TcpStream,
    registry: &Arc<FeedRegistry>,
    input: &ProcessSpec,
    options: LiveOptions,
    shutdown: &ShutdownToken,
) -> Result<()> {
    let head = if options.raw {
        response::streaming_head("video/x-motion-jpeg", true)
    } else {
        response::streaming_head(
            &format!("multipart/x-mixed-replace;boundary={}", MULTIPART_BOUNDARY),
            false,
        )
    };
    stream.write_all(head.as_bytes())?;
    stream.set_write_timeout(Some(options.stall_timeout))?;

    let viewer = Arc::new(Viewer {
        slot: FrameSlot::new(),
        control: stream.try_clone()?,
        closed: AtomicBool::new(false),
        last_completed: Mutex::new(Instant::now()),
        stall_timeout: options.stall_timeout,
    });

    let writer = Arc::clone(&viewer);
    let running = shutdown.clone();
    let raw = options.raw;
    std::thread::Builder::new()
        .name("mjpeg-viewer".to_string())
        .spawn(move || writer.write_loop(stream, raw, &running))
        .map_err(|err| anyhow!("could not start viewer thread: {}", err))?;

    let min_interval = options.min_interval;
    let stall_timeout = options.stall_timeout;
    let running = shutdown.clone();
    let state = Arc::clone(&viewer);
    let mut last_start: Option<Instant> = None;
    let subscribed = registry.subscribe(input, move |event| {
        let FeedEvent::Frame(frame) = event else {
            state.close();
            return false;
        };
        if state.is_closed() || !running.is_running() {
            state.close();
            return false;
        }
        let now = Instant::now();
        if state.slot.is_busy() {
            if state.stalled(now) {
                log::warn!("viewer stalled for {:?}, closing", stall_timeout);
                state.close();
                return false;
            }
            return true;
        }
        if let (Some(min), Some(start)) = (min_interval, last_start) {
            if now.saturating_duration_since(start) < min {
                return true;
            }
        }
        last_start = Some(now);
        state.slot.offer(frame);
        true
    });

    if let Err(err) = subscribed {
        viewer.close();
        return Err(err);
    }
    Ok(())
}
