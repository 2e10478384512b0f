//! Motion-triggered recordings: output file naming and the file sink that
//! the recording pipe writes into.

use anyhow::{Context, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::config::MotionSettings;
use crate::pipe::{self, PipeHandle};
use crate::process::ProcessSpec;
use crate::registry::FeedRegistry;
use crate::shutdown::ShutdownToken;

/// Expand a recording filename template.
///
/// `[name]` becomes the feed name. Any other `[token]` is a date/time
/// pattern: strftime when it contains `%`, otherwise the `yyyyMMdd HHmmss`
/// letter style.
pub fn render_filename<Tz>(template: &str, feed_name: &str, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    static TOKEN_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = TOKEN_RE.get_or_init(|| regex::Regex::new(r"\[(.*?)\]").unwrap());
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        let token = &caps[1];
        if token == "name" {
            feed_name.to_string()
        } else if token.contains('%') {
            strftime(token, now)
        } else {
            letter_pattern(token, now)
        }
    })
    .into_owned()
}

fn strftime<Tz>(pattern: &str, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return pattern.to_string();
    }
    now.format_with_items(items.into_iter()).to_string()
}

fn letter_pattern<Tz>(pattern: &str, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            if let Some(next) = chars.get(i + 1) {
                out.push(*next);
            }
            i += 2;
            continue;
        }
        if c == '\'' || c == '"' {
            let close = chars[i + 1..].iter().position(|x| *x == c);
            let end = close.map_or(chars.len(), |p| i + 1 + p);
            out.extend(&chars[i + 1..end]);
            i = end + 1;
            continue;
        }
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        i += run;

        let hour12 = match now.hour() % 12 {
            0 => 12,
            h => h,
        };
        match (c, run) {
            ('y', 1) => out.push_str(&(now.year() % 100).to_string()),
            ('y', 2) => out.push_str(&format!("{:02}", now.year() % 100)),
            ('y', n) => out.push_str(&format!("{:0n$}", now.year())),
            ('M', 1) => out.push_str(&now.month().to_string()),
            ('M', 2) => out.push_str(&format!("{:02}", now.month())),
            ('M', 3) => out.push_str(&now.format("%b").to_string()),
            ('M', _) => out.push_str(&now.format("%B").to_string()),
            ('d', 1) => out.push_str(&now.day().to_string()),
            ('d', 2) => out.push_str(&format!("{:02}", now.day())),
            ('d', 3) => out.push_str(&now.format("%a").to_string()),
            ('d', _) => out.push_str(&now.format("%A").to_string()),
            ('H', 1) => out.push_str(&now.hour().to_string()),
            ('H', _) => out.push_str(&format!("{:02}", now.hour())),
            ('h', 1) => out.push_str(&hour12.to_string()),
            ('h', _) => out.push_str(&format!("{:02}", hour12)),
            ('m', 1) => out.push_str(&now.minute().to_string()),
            ('m', _) => out.push_str(&format!("{:02}", now.minute())),
            ('s', 1) => out.push_str(&now.second().to_string()),
            ('s', _) => out.push_str(&format!("{:02}", now.second())),
            ('f', n) => {
                let digits = n.min(9);
                let nanos = now.nanosecond() % 1_000_000_000;
                let value = nanos / 10u32.pow(9 - digits as u32);
                out.push_str(&format!("{:0digits$}", value));
            }
            ('t', n) => {
                let marker = if now.hour() < 12 { "AM" } else { "PM" };
                out.push_str(if n == 1 { &marker[..1] } else { marker });
            }
            (other, n) => out.extend(std::iter::repeat(other).take(n)),
        }
    }
    out
}

/// Shared, closable file handle used as a pipe sink.
///
/// Writes after [`RecordingFile::close`] fail with `BrokenPipe`, which ends
/// the pipe feeding it.
#[derive(Clone, Debug)]
pub struct RecordingFile {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl RecordingFile {
    /// Create `path` and any missing parent directories.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = File::create(&path)
            .with_context(|| format!("failed to create recording {}", path.display()))?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    fn file(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file().is_some()
    }

    pub fn close(&self) {
        if let Some(file) = self.file().take() {
            if let Err(err) = file.sync_all() {
                log::warn!("sync of {} failed: {}", self.path.display(), err);
            }
        }
    }
}

impl Write for RecordingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file().as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "recording closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// An active recording: the output file plus the pipe writing into it.
pub struct Recording {
    file: RecordingFile,
    pipe: PipeHandle,
}

impl Recording {
    /// Render the filename, create the file and pipe the feed's input
    /// through the motion transcoder into it.
    pub fn start(
        registry: &Arc<FeedRegistry>,
        feed_name: &str,
        input: &ProcessSpec,
        motion: &MotionSettings,
        shutdown: &ShutdownToken,
    ) -> Result<Self> {
        let path = render_filename(&motion.filename_template, feed_name, &Local::now());
        let file = RecordingFile::create(path)?;

        let guard = file.clone();
        let running = shutdown.clone();
        let keep_going: pipe::KeepGoing = Arc::new(move || running.is_running() && guard.is_open());

        let pipe = match pipe::pipe(
            registry,
            input,
            &motion.process,
            Box::new(file.clone()),
            Some(keep_going),
        ) {
            Ok(pipe) => pipe,
            Err(err) => {
                file.close();
                return Err(err);
            }
        };
        Ok(Self { file, pipe })
    }

    pub fn path(&self) -> &PathBuf {
        self.file.path()
    }

    pub fn is_open(&self) -> bool {
        self.file.is_open()
    }

    /// Close the file. The pipe notices and shuts its transcoder down.
    pub fn stop(&self) {
        self.file.close();
        self.pipe.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use chrono::Utc;

    fn at() -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_milli_opt(14, 5, 9, 123)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn default_template() {
        let name = render_filename("[yyyyMMdd]/[name]_[yyyyMMdd HHmmss].mp4", "cam1", &at());
        assert_eq!(name, "20240307/cam1_20240307 140509.mp4");
    }

    #[test]
    fn letter_patterns() {
        let now = at();
        assert_eq!(render_filename("[yy-M-d h:m:s tt]", "x", &now), "24-3-7 2:5:9 PM");
        assert_eq!(render_filename("[MMM ddd]", "x", &now), "Mar Thu");
        assert_eq!(render_filename("[MMMM dddd]", "x", &now), "March Thursday");
        assert_eq!(render_filename("[HH.fff]", "x", &now), "14.123");
        assert_eq!(render_filename("['at' HH\\h]", "x", &now), "at 14h");
    }

    #[test]
    fn strftime_tokens_and_literals() {
        let now = at();
        assert_eq!(render_filename("rec/[%Y/%m]/[name].mkv", "door", &now), "rec/2024/03/door.mkv");
        assert_eq!(render_filename("plain.mp4", "door", &now), "plain.mp4");
    }

    #[test]
    fn closed_recording_file_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = RecordingFile::create(dir.path().join("a/b/out.bin")).unwrap();
        file.write_all(b"data").unwrap();
        assert!(file.is_open());
        file.close();
        assert!(!file.is_open());
        let err = file.write_all(b"more").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(fs::read(dir.path().join("a/b/out.bin")).unwrap(), b"data");
    }
}
