//! Pipe pump: feed frames from a registry subscription into a transcoder
//! and relay the transcoder's output to a sink.
//!
//! Two threads cooperate on one session. The feed reader (via the
//! subscription callback) owns writes to the transcoder's stdin; a relay
//! thread owns its stdout and copies it to the sink. Either side may start
//! the shutdown sequence, which runs exactly once:
//!
//! 1. flush and close transcoder stdin (inline, so the transcoder can finish)
//! 2. drain transcoder stdout for up to 5 seconds
//! 3. close transcoder stdout and the sink
//! 4. ask the transcoder to exit and wait briefly
//! 5. force-kill it
//! 6. reap it
//!
//! Steps 2-6 run on a teardown thread. Each step logs its own failure and
//! the sequence always runs to the end.

use anyhow::{anyhow, Result};
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use crate::process::{self, Pipes, ProcessSpec};
use crate::registry::{FeedEvent, FeedRegistry, Subscription};

/// Caller-supplied liveness check, evaluated before forwarding more data.
pub type KeepGoing = Arc<dyn Fn() -> bool + Send + Sync>;

pub type Sink = Box<dyn Write + Send>;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_GRACE: Duration = Duration::from_secs(1);
const RELAY_CHUNK: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A boolean that threads can wait on.
#[derive(Default)]
struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn set(&self) {
        *lock(&self.set) = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.set);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

struct PipeSession {
    label: String,
    stdin: Mutex<Option<ChildStdin>>,
    sink: Mutex<Option<Sink>>,
    child: Mutex<Option<Child>>,
    keep_going: Option<KeepGoing>,
    closing: AtomicBool,
    relay_done: Latch,
    closed: Latch,
}

impl PipeSession {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn keep_going(&self) -> bool {
        self.keep_going.as_ref().map_or(true, |f| f())
    }

    /// Subscription side: write one frame to the transcoder.
    fn forward(self: &Arc<Self>, frame: &[u8]) -> bool {
        if self.is_closing() {
            lock(&self.stdin).take();
            return false;
        }
        {
            let mut stdin = lock(&self.stdin);
            let Some(pipe) = stdin.as_mut() else {
                return false;
            };
            if let Err(err) = pipe.write_all(frame) {
                log::debug!("[{}] transcoder input closed: {}", self.label, err);
                stdin.take();
                drop(stdin);
                self.shutdown();
                return false;
            }
        }
        if self.is_closing() {
            // Shutdown could not take stdin while this write was in flight.
            lock(&self.stdin).take();
            return false;
        }
        let sink_open = lock(&self.sink).is_some();
        if sink_open && self.keep_going() {
            return true;
        }
        self.shutdown();
        false
    }

    /// Relay side: copy transcoder output to the sink, then drain.
    fn relay(self: Arc<Self>, mut stdout: ChildStdout) {
        let mut buf = vec![0u8; RELAY_CHUNK];
        loop {
            if self.is_closing() || !self.keep_going() {
                break;
            }
            let n = match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("[{}] transcoder output failed: {}", self.label, err);
                    break;
                }
            };
            let mut sink = lock(&self.sink);
            let Some(out) = sink.as_mut() else {
                break;
            };
            if let Err(err) = out.write_all(&buf[..n]).and_then(|()| out.flush()) {
                log::debug!("[{}] sink closed: {}", self.label, err);
                sink.take();
                break;
            }
        }

        self.shutdown();
        self.close_sink();

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while Instant::now() < deadline {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        drop(stdout);
        self.relay_done.set();
    }

    /// Start the shutdown sequence. Idempotent.
    fn shutdown(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        // Step 1. A writer holding the lock drops stdin itself once it sees
        // the closing flag.
        match self.stdin.try_lock() {
            Ok(mut stdin) => close_stdin(&self.label, stdin.take()),
            Err(TryLockError::Poisoned(poisoned)) => {
                close_stdin(&self.label, poisoned.into_inner().take())
            }
            Err(TryLockError::WouldBlock) => {}
        }

        let session = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("pipe-teardown".to_string())
            .spawn(move || session.teardown());
        if let Err(err) = spawned {
            log::warn!("[{}] teardown thread failed to start: {}", self.label, err);
            self.teardown();
        }
    }

    fn teardown(&self) {
        // Step 2: the relay thread drains; wait for it with a deadline.
        if !self.relay_done.wait(DRAIN_TIMEOUT) {
            log::warn!(
                "[{}] transcoder output still open after {:?}",
                self.label,
                DRAIN_TIMEOUT
            );
        }

        // Step 3.
        self.close_sink();

        let Some(mut child) = lock(&self.child).take() else {
            self.closed.set();
            return;
        };

        // Step 4.
        match process::request_exit(&mut child, EXIT_GRACE) {
            Ok(true) => {}
            Ok(false) => log::debug!("[{}] transcoder did not exit on request", self.label),
            Err(err) => log::warn!("[{}] exit request failed: {:#}", self.label, err),
        }

        // Step 5.
        match child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(err) = child.kill() {
                    log::warn!("[{}] kill failed: {}", self.label, err);
                }
            }
            Err(err) => log::warn!("[{}] status check failed: {}", self.label, err),
        }

        // Step 6.
        if let Err(err) = child.wait() {
            log::warn!("[{}] reaping transcoder failed: {}", self.label, err);
        }

        log::debug!("[{}] pipe closed", self.label);
        self.closed.set();
    }

    fn close_sink(&self) {
        let sink = match self.sink.try_lock() {
            Ok(mut sink) => sink.take(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take(),
            // The relay is mid-write and drops the sink when it stops.
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some(mut sink) = sink {
            if let Err(err) = sink.flush() {
                log::warn!("[{}] sink flush failed: {}", self.label, err);
            }
        }
    }
}

fn close_stdin(label: &str, stdin: Option<ChildStdin>) {
    if let Some(mut stdin) = stdin {
        if let Err(err) = stdin.flush() {
            log::warn!("[{}] flushing transcoder input failed: {}", label, err);
        }
    }
}

/// Handle to a running pipe session.
pub struct PipeHandle {
    session: Arc<PipeSession>,
    subscription: Subscription,
}

impl PipeHandle {
    /// Stop forwarding and run the shutdown sequence.
    pub fn close(&self) {
        self.subscription.cancel();
        self.session.shutdown();
    }

    /// Whether shutdown has started.
    pub fn is_closed(&self) -> bool {
        self.session.is_closing()
    }

    /// Wait until the shutdown sequence has finished. Returns `false` on
    /// timeout.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        self.session.closed.wait(timeout)
    }
}

/// Launch `output`, subscribe it to frames from `input`, and relay its
/// output to `sink`.
///
/// The session ends when the feed ends, when a write to either side fails,
/// or when `keep_going` returns `false`.
pub fn pipe(
    registry: &Arc<FeedRegistry>,
    input: &ProcessSpec,
    output: &ProcessSpec,
    sink: Sink,
    keep_going: Option<KeepGoing>,
) -> Result<PipeHandle> {
    let mut child = process::spawn(output, Pipes::InputOutput)?;
    let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            process::kill(&mut child);
            return Err(anyhow!("transcoder '{}' is missing a pipe", output));
        }
    };
    if let Some(stderr) = child.stderr.take() {
        process::drain_stderr(stderr, output.command.clone(), true);
    }

    let session = Arc::new(PipeSession {
        label: output.command.clone(),
        stdin: Mutex::new(Some(stdin)),
        sink: Mutex::new(Some(sink)),
        child: Mutex::new(Some(child)),
        keep_going,
        closing: AtomicBool::new(false),
        relay_done: Latch::default(),
        closed: Latch::default(),
    });

    let relay = Arc::clone(&session);
    if let Err(err) = std::thread::Builder::new()
        .name("pipe-relay".to_string())
        .spawn(move || relay.relay(stdout))
    {
        session.relay_done.set();
        session.shutdown();
        return Err(anyhow!("could not start relay thread for '{}': {}", output, err));
    }

    let forward = Arc::clone(&session);
    let subscribed = registry.subscribe(input, move |event| match event {
        FeedEvent::Frame(frame) => forward.forward(frame),
        FeedEvent::Ended => {
            forward.shutdown();
            false
        }
    });
    match subscribed {
        Ok(subscription) => {
            log::debug!("piping {} into {}", input, output);
            Ok(PipeHandle {
                session,
                subscription,
            })
        }
        Err(err) => {
            session.shutdown();
            Err(err)
        }
    }
}
