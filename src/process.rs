//! External process plumbing shared by the feed registry and the pipe pump.
//!
//! Commands are configured as an executable plus a single argument string.
//! The string is split into argv here; no shell is involved.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
#[cfg(target_os = "linux")]
use std::time::Instant;

/// An executable and its argument string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessSpec {
    pub command: String,
    pub arguments: String,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arguments: arguments.into(),
        }
    }

    /// Registry key. Specs that render to the same key share one process.
    pub fn key(&self) -> ProcessKey {
        ProcessKey(format!("{} {}", self.command, self.arguments))
    }

    pub fn argv(&self) -> Result<Vec<String>> {
        split_arguments(&self.arguments)
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.arguments.is_empty() {
            write!(f, "{}", self.command)
        } else {
            write!(f, "{} {}", self.command, self.arguments)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessKey(String);

impl ProcessKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Split an argument string on whitespace, honouring quotes and escapes.
///
/// Single quotes are literal, double quotes allow `\"` and `\\`, and a bare
/// backslash escapes the next character.
pub fn split_arguments(arguments: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = arguments.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(anyhow!("unterminated single quote in '{}'", arguments)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => {
                                return Err(anyhow!("unterminated double quote in '{}'", arguments))
                            }
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(anyhow!("unterminated double quote in '{}'", arguments)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Which of the child's standard streams are piped back to us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Pipes {
    /// stdout only (decoders).
    Output,
    /// stdin and stdout (transcoders).
    InputOutput,
}

pub(crate) fn spawn(spec: &ProcessSpec, pipes: Pipes) -> Result<Child> {
    if spec.command.trim().is_empty() {
        return Err(anyhow!("process command is empty"));
    }
    let stdin = match pipes {
        Pipes::Output => Stdio::null(),
        Pipes::InputOutput => Stdio::piped(),
    };
    Command::new(&spec.command)
        .args(spec.argv()?)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to launch '{}'", spec))
}

/// Drain a child's stderr on a helper thread.
///
/// With `log_lines` each line is logged at debug level, otherwise the bytes
/// are discarded.
pub(crate) fn drain_stderr<R>(stderr: R, label: String, log_lines: bool)
where
    R: Read + Send + 'static,
{
    let spawned = std::thread::Builder::new()
        .name("stderr-drain".to_string())
        .spawn(move || {
            if log_lines {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => log::debug!("[{}] {}", label, line),
                        Err(_) => break,
                    }
                }
            } else {
                let mut stderr = stderr;
                let _ = std::io::copy(&mut stderr, &mut std::io::sink());
            }
        });
    if let Err(err) = spawned {
        log::warn!("could not start stderr drain thread: {}", err);
    }
}

/// Ask the child to exit (SIGTERM) and wait up to `grace` for it.
///
/// Returns `true` when the child has exited. Platforms without signals
/// return `false` immediately and rely on [`kill`].
pub(crate) fn request_exit(child: &mut Child, grace: Duration) -> Result<bool> {
    if child.try_wait()?.is_some() {
        return Ok(true);
    }
    #[cfg(target_os = "linux")]
    {
        let pid = libc::pid_t::try_from(child.id()).context("child pid out of range")?;
        // SAFETY: plain kill(2) on a pid we own and have not reaped yet.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("SIGTERM failed");
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if child.try_wait()?.is_some() {
                return Ok(true);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(false)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = grace;
        Ok(false)
    }
}

/// Best-effort force kill and reap. Failures are ignored.
pub(crate) fn kill(child: &mut Child) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    let _ = child.kill();
    let _ = child.wait();
}
