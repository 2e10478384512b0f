use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::ProcessSpec;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_PORT: u16 = 8082;
const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
const DEFAULT_TEMPLATE_DIR: &str = "HtmlTemplates";
const DEFAULT_OUTPUT_CONTENT_TYPE: &str = "video/mp4";
const DEFAULT_MOTION_FRAME_COUNT: usize = 3;
const DEFAULT_MOTION_LINGER_SECS: f64 = 10.0;
pub const DEFAULT_RECORDING_TEMPLATE: &str = "[yyyyMMdd]/[name]_[yyyyMMdd HHmmss].mp4";

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct ServerConfigFile {
    port: Option<u32>,
    bind_address: Option<String>,
    username: Option<String>,
    password: Option<String>,
    template_directory: Option<PathBuf>,
    feeds: Option<Vec<FeedConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct FeedConfigFile {
    name: Option<String>,
    input_process_name: Option<String>,
    input_process_arguments: Option<String>,
    output_process_name: Option<String>,
    output_process_arguments: Option<String>,
    output_content_type: Option<String>,
    motion_detection_percentage: Option<f64>,
    motion_detection_frame_count: Option<i64>,
    motion_detection_seconds_between_frames: Option<f64>,
    motion_color_ignore_percentage: Option<f64>,
    motion_process_name: Option<String>,
    motion_process_arguments: Option<String>,
    motion_seconds_linger: Option<f64>,
    motion_recording_file_name: Option<String>,
    snapshot_seconds_interval: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_address: String,
    pub credentials: Option<Credentials>,
    pub template_dir: PathBuf,
    pub feeds: Vec<FeedConfig>,
}

/// Basic auth pair. Only present when both halves are non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub input: ProcessSpec,
    pub output: Option<OutputSettings>,
    pub motion: Option<MotionSettings>,
    pub snapshot_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub process: ProcessSpec,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct MotionSettings {
    /// Share of grid samples (0-100) that must change for a frame to count.
    pub change_percentage: f64,
    /// Per-sample colour change (0-100) at or below which a sample is ignored.
    pub ignore_percentage: f64,
    pub frame_count: usize,
    pub sample_interval: Duration,
    pub linger: Duration,
    pub process: ProcessSpec,
    pub filename_template: String,
}

impl ServerConfig {
    /// Read `path`, apply `CAMERA_*` environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let file = read_config_file(path)?;
        let mut cfg = Self::from_file(file)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate a JSON document without environment overrides.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: ServerConfigFile =
            serde_json::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let mut cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn feed(&self, name: &str) -> Option<&FeedConfig> {
        self.feeds.iter().find(|feed| feed.name == name)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    fn from_file(file: ServerConfigFile) -> Result<Self> {
        let port = match file.port {
            None | Some(0) => DEFAULT_PORT,
            Some(port) => u16::try_from(port).map_err(|_| anyhow!("Port {} is out of range", port))?,
        };
        let bind_address = file
            .bind_address
            .filter(|addr| !addr.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let template_dir = file
            .template_directory
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATE_DIR));
        let feeds = file
            .feeds
            .unwrap_or_default()
            .into_iter()
            .map(FeedConfig::from_file)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            port,
            bind_address,
            credentials: credentials(file.username, file.password),
            template_dir,
            feeds,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("CAMERA_PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMERA_PORT must be a port number"))?;
            self.port = if port == 0 { DEFAULT_PORT } else { port };
        }
        if let Ok(addr) = std::env::var("CAMERA_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_address = addr;
            }
        }
        let username = std::env::var("CAMERA_USERNAME").ok();
        let password = std::env::var("CAMERA_PASSWORD").ok();
        if username.is_some() || password.is_some() {
            let current = self.credentials.take();
            let username = username.or_else(|| current.as_ref().map(|c| c.username.clone()));
            let password = password.or_else(|| current.map(|c| c.password));
            self.credentials = credentials(username, password);
        }
        if let Ok(dir) = std::env::var("CAMERA_TEMPLATE_DIR") {
            if !dir.trim().is_empty() {
                self.template_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.feeds.is_empty() {
            return Err(anyhow!("at least one feed must be configured"));
        }
        let mut names = HashSet::new();
        for feed in &self.feeds {
            feed.validate()?;
            if !names.insert(feed.name.as_str()) {
                return Err(anyhow!("duplicate feed name {}", feed.name));
            }
        }
        Ok(())
    }
}

impl FeedConfig {
    fn from_file(file: FeedConfigFile) -> Result<Self> {
        let name = file.name.unwrap_or_default();
        let input = ProcessSpec::new(
            file.input_process_name.unwrap_or_default(),
            file.input_process_arguments.unwrap_or_default(),
        );

        let output = file
            .output_process_name
            .filter(|process| !process.trim().is_empty())
            .map(|process| OutputSettings {
                process: ProcessSpec::new(
                    process,
                    file.output_process_arguments.unwrap_or_default(),
                ),
                content_type: file
                    .output_content_type
                    .filter(|ct| !ct.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_OUTPUT_CONTENT_TYPE.to_string()),
            });

        let change_percentage = file.motion_detection_percentage.unwrap_or(0.0);
        let motion = if change_percentage > 0.0 {
            let frame_count = match file.motion_detection_frame_count {
                None => DEFAULT_MOTION_FRAME_COUNT,
                Some(count) => usize::try_from(count)
                    .ok()
                    .filter(|count| *count >= 1)
                    .ok_or_else(|| {
                        anyhow!("feed {}: MotionDetectionFrameCount must be at least 1", name)
                    })?,
            };
            Some(MotionSettings {
                change_percentage,
                ignore_percentage: file.motion_color_ignore_percentage.unwrap_or(0.0),
                frame_count,
                sample_interval: seconds(
                    &name,
                    "MotionDetectionSecondsBetweenFrames",
                    file.motion_detection_seconds_between_frames.unwrap_or(0.0),
                )?,
                linger: seconds(
                    &name,
                    "MotionSecondsLinger",
                    file.motion_seconds_linger
                        .unwrap_or(DEFAULT_MOTION_LINGER_SECS),
                )?,
                process: ProcessSpec::new(
                    file.motion_process_name.unwrap_or_default(),
                    file.motion_process_arguments.unwrap_or_default(),
                ),
                filename_template: file
                    .motion_recording_file_name
                    .filter(|template| !template.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_RECORDING_TEMPLATE.to_string()),
            })
        } else if change_percentage < 0.0 {
            return Err(anyhow!(
                "feed {}: MotionDetectionPercentage must not be negative",
                name
            ));
        } else {
            None
        };

        let snapshot = seconds(
            &name,
            "SnapshotSecondsInterval",
            file.snapshot_seconds_interval.unwrap_or(0.0),
        )?;
        let snapshot_interval = (!snapshot.is_zero()).then_some(snapshot);

        Ok(Self {
            name,
            input,
            output,
            motion,
            snapshot_interval,
        })
    }

    fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(anyhow!("feed name must not be empty"));
        }
        if name.contains('/') || name == "shutdown" {
            return Err(anyhow!("feed name {} is not usable in a URL path", self.name));
        }
        if self.input.command.trim().is_empty() {
            return Err(anyhow!("feed {}: InputProcessName is required", self.name));
        }
        if let Some(motion) = &self.motion {
            if motion.change_percentage > 100.0 {
                return Err(anyhow!(
                    "feed {}: MotionDetectionPercentage must be at most 100",
                    self.name
                ));
            }
            if motion.process.command.trim().is_empty() {
                return Err(anyhow!(
                    "feed {}: motion detection requires MotionProcessName",
                    self.name
                ));
            }
        }
        Ok(())
    }

    /// Whether the feed needs an always-on capture subscription.
    pub fn needs_capture(&self) -> bool {
        self.snapshot_interval.is_some() || self.motion.is_some()
    }
}

fn credentials(username: Option<String>, password: Option<String>) -> Option<Credentials> {
    match (username, password) {
        (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
            Some(Credentials { username, password })
        }
        _ => None,
    }
}

fn seconds(feed: &str, key: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("feed {}: {} must be a non-negative number", feed, key));
    }
    Duration::try_from_secs_f64(value).map_err(|e| anyhow!("feed {}: {}: {}", feed, key, e))
}

fn read_config_file(path: &Path) -> Result<ServerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
