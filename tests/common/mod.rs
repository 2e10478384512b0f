#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camera_http_server::ProcessSpec;

/// A fake JPEG: SOI, `len` filler bytes, EOI. Filler never contains 0xFF.
pub fn fake_jpeg(tag: u8, len: usize) -> Vec<u8> {
    let fill = if tag == 0xFF { 0xFE } else { tag };
    let mut frame = vec![0xFF, 0xD8];
    frame.extend(std::iter::repeat(fill).take(len));
    frame.extend_from_slice(&[0xFF, 0xD9]);
    frame
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("write test file");
    path
}

/// Decoder that records each launch in `launch_log` and replays `files`
/// forever.
pub fn looping_decoder(launch_log: &Path, files: &[PathBuf]) -> ProcessSpec {
    let cats = files
        .iter()
        .map(|f| format!("'{}'", f.display()))
        .collect::<Vec<_>>()
        .join(" ");
    ProcessSpec::new(
        "sh",
        format!(
            "-c \"echo launched >> '{}'; while true; do cat {}; sleep 0.05; done\"",
            launch_log.display(),
            cats
        ),
    )
}

/// Decoder that writes `file` once and exits.
pub fn one_shot_decoder(file: &Path) -> ProcessSpec {
    ProcessSpec::new("cat", format!("'{}'", file.display()))
}

pub fn launches(launch_log: &Path) -> usize {
    std::fs::read_to_string(launch_log)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

/// In-memory sink shared with the test body.
#[derive(Clone, Default)]
pub struct SharedSink(pub Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
