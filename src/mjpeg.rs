//! MJPEG frame extraction.
//!
//! Decoder processes write a bare concatenation of JPEG images to stdout.
//! `FrameExtractor` splits that byte stream into frames by scanning for the
//! SOI (`FF D8`) and EOI (`FF D9`) markers. Frames are never decoded here;
//! a frame is the opaque byte range from SOI through EOI.
//!
//! Memory is bounded by one frame plus read-ahead: after each frame the
//! unconsumed tail is moved to the front of the scratch buffer. The buffer
//! starts at 512 KiB and doubles when full, up to a 20 MiB ceiling. A full
//! buffer at the ceiling is discarded (frames in flight are lost) instead of
//! growing further.

use std::io::{ErrorKind, Read};

pub const INITIAL_BUFFER_BYTES: usize = 512 * 1024;
pub const MAX_BUFFER_BYTES: usize = 20 * 1024 * 1024;

const MARKER: u8 = 0xFF;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;

/// Why an extraction run returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extraction {
    /// The source returned a zero-length read.
    EndOfStream,
    /// The frame callback asked to stop.
    Stopped,
}

/// Resumable JPEG scanner over a growable scratch buffer.
///
/// State survives a `Stopped` return, so calling [`FrameExtractor::run`]
/// again on the same reader continues where the previous run left off.
#[derive(Debug)]
pub struct FrameExtractor {
    buffer: Vec<u8>,
    len: usize,
    frame_start: Option<usize>,
    max_bytes: usize,
    resets: u64,
    rescan: bool,
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self::with_limits(INITIAL_BUFFER_BYTES, MAX_BUFFER_BYTES)
    }

    /// Scanner with a custom initial size and ceiling.
    pub fn with_limits(initial_bytes: usize, max_bytes: usize) -> Self {
        let initial_bytes = initial_bytes.max(2);
        Self {
            buffer: vec![0u8; initial_bytes],
            len: 0,
            frame_start: None,
            max_bytes: max_bytes.max(initial_bytes),
            resets: 0,
            rescan: false,
        }
    }

    /// Current scratch capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of times the buffer was discarded at the ceiling.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Read from `reader` until it ends or `on_frame` returns `false`.
    ///
    /// Only the newly read bytes plus one byte of older data are scanned on
    /// each read, so a marker split across two reads is still found.
    pub fn run<R, F>(&mut self, reader: &mut R, mut on_frame: F) -> std::io::Result<Extraction>
    where
        R: Read + ?Sized,
        F: FnMut(&[u8]) -> bool,
    {
        // Frames already buffered behind a previous stop come first.
        if std::mem::take(&mut self.rescan) && !self.scan(0, &mut on_frame) {
            return Ok(Extraction::Stopped);
        }

        loop {
            if self.len == self.buffer.len() {
                self.make_room();
            }

            let read = match reader.read(&mut self.buffer[self.len..]) {
                Ok(0) => return Ok(Extraction::EndOfStream),
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };

            let from = self.len.saturating_sub(1);
            self.len += read;
            if !self.scan(from, &mut on_frame) {
                return Ok(Extraction::Stopped);
            }
        }
    }

    /// Scan `buffer[from..len]`; returns `false` when the consumer stopped.
    fn scan<F>(&mut self, mut i: usize, on_frame: &mut F) -> bool
    where
        F: FnMut(&[u8]) -> bool,
    {
        while i + 1 < self.len {
            let pair = (self.buffer[i], self.buffer[i + 1]);
            match (self.frame_start, pair) {
                (None, (MARKER, SOI)) => {
                    self.frame_start = Some(i);
                    i += 2;
                }
                (Some(start), (MARKER, EOI)) => {
                    let end = i + 2;
                    let keep_going = on_frame(&self.buffer[start..end]);
                    self.frame_start = None;
                    self.buffer.copy_within(end..self.len, 0);
                    self.len -= end;
                    if !keep_going {
                        self.rescan = true;
                        return false;
                    }
                    i = 0;
                }
                _ => i += 1,
            }
        }
        true
    }

    fn make_room(&mut self) {
        let capacity = self.buffer.len();
        if capacity < self.max_bytes {
            let grown = capacity.saturating_mul(2).min(self.max_bytes);
            self.buffer.resize(grown, 0);
        } else {
            log::warn!(
                "mjpeg buffer full at {} bytes; discarding buffered data",
                capacity
            );
            self.len = 0;
            self.frame_start = None;
            self.resets += 1;
        }
    }
}

/// Run a fresh [`FrameExtractor`] over `reader`.
pub fn extract_frames<R, F>(reader: &mut R, on_frame: F) -> std::io::Result<Extraction>
where
    R: Read + ?Sized,
    F: FnMut(&[u8]) -> bool,
{
    FrameExtractor::new().run(reader, on_frame)
}
