//! Camera HTTP Server
//!
//! Re-serves MJPEG produced by external decoder processes to any number of
//! HTTP viewers, transcodes it on demand through a second process, and
//! records to disk when motion is detected.
//!
//! # Module Structure
//!
//! - `mjpeg`: JPEG frame extraction from a raw decoder byte stream
//! - `process`: external process specs, launch and termination
//! - `registry`: one decoder per process key, fanned out to subscribers
//! - `pipe`: frames into a transcoder, transcoder output into a sink
//! - `slot`: single-slot, drop-if-busy frame handoff
//! - `snapshot`: latest-frame cache
//! - `motion`: frame comparison, hysteresis and recordings
//! - `feed`: per-feed runtime state and always-on capture
//! - `http`: accept loop, routing, live viewers
//! - `pages`, `config`, `shutdown`: collaborators

pub mod config;
pub mod feed;
pub mod http;
pub mod mjpeg;
pub mod motion;
pub mod pages;
pub mod pipe;
pub mod process;
pub mod registry;
pub mod shutdown;
pub mod slot;
pub mod snapshot;

pub use config::{FeedConfig, ServerConfig};
pub use feed::Feed;
pub use http::{ServerContext, ServerHandle, StreamServer};
pub use mjpeg::{extract_frames, Extraction, FrameExtractor};
pub use pipe::{pipe, PipeHandle};
pub use process::{ProcessKey, ProcessSpec};
pub use registry::{FeedEvent, FeedRegistry, RegistryStats, Subscription};
pub use shutdown::ShutdownToken;
