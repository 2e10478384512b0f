//! Stream server: accept loop, request routing and the per-connection
//! worker.
//!
//! One thread per connection. Streaming routes (`mjpeg`, `stream`) hand the
//! socket to their viewer or pipe threads and return; everything else
//! answers once and closes.

pub mod live;
pub mod request;
pub mod response;

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::feed::{self, Feed};
use crate::pages;
use crate::pipe;
use crate::registry::FeedRegistry;
use crate::shutdown::ShutdownToken;

use self::live::LiveOptions;
use self::request::{read_request, HttpRequest, READ_TIMEOUT};
use self::response::{FEED_NOT_FOUND, SHUTDOWN_BODY, UNKNOWN_ACTION};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Everything a connection worker needs, shared across threads.
pub struct ServerContext {
    pub config: ServerConfig,
    pub feeds: Vec<Arc<Feed>>,
    pub registry: Arc<FeedRegistry>,
    pub shutdown: ShutdownToken,
}

impl ServerContext {
    pub fn new(config: ServerConfig, shutdown: ShutdownToken) -> Arc<Self> {
        let feeds = config
            .feeds
            .iter()
            .cloned()
            .map(|cfg| Arc::new(Feed::new(cfg)))
            .collect();
        Arc::new(Self {
            config,
            feeds,
            registry: FeedRegistry::new(shutdown.clone()),
            shutdown,
        })
    }

    pub fn feed(&self, name: &str) -> Option<&Arc<Feed>> {
        self.feeds.iter().find(|feed| feed.name() == name)
    }

    /// Start snapshot and motion capture for every feed that wants it.
    /// Failures are logged; the server keeps running without that feed's
    /// capture.
    pub fn start_captures(&self) {
        for feed in &self.feeds {
            if let Err(err) = feed::start_capture(feed, &self.registry, &self.shutdown) {
                log::error!("[{}] capture failed to start: {:#}", feed.name(), err);
            }
        }
    }

    pub fn close_recordings(&self) {
        for feed in &self.feeds {
            feed.stop_recording();
        }
    }
}

pub struct StreamServer {
    ctx: Arc<ServerContext>,
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: ShutdownToken,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Trigger shutdown and wait for the accept loop to finish.
    pub fn stop(self) -> Result<()> {
        self.shutdown.trigger();
        self.wait()
    }

    /// Wait until the server stops (for example after `/shutdown`).
    pub fn wait(mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("stream server thread panicked"))?;
        }
        Ok(())
    }
}

impl StreamServer {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let configured = self.ctx.config.listen_addr();
        let listener = TcpListener::bind(&configured)
            .with_context(|| format!("failed to bind {}", configured))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("camera http server listening on {}", addr);

        let ctx = self.ctx;
        let shutdown = ctx.shutdown.clone();
        let join = std::thread::Builder::new()
            .name("http-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_server(&listener, &ctx) {
                    log::error!("stream server stopped: {:#}", err);
                    ctx.shutdown.trigger();
                }
                ctx.close_recordings();
                log::info!("camera http server stopped");
            })?;

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(listener: &TcpListener, ctx: &Arc<ServerContext>) -> Result<()> {
    while ctx.shutdown.is_running() {
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(ctx);
                let spawned = std::thread::Builder::new()
                    .name("http-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(&ctx, stream, peer) {
                            log::warn!("request from {} rejected: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("dropping connection from {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(ctx: &ServerContext, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let Some(request) = read_request(&mut stream)? else {
        return Ok(());
    };
    stream.set_read_timeout(None)?;

    if let Some(credentials) = &ctx.config.credentials {
        if !request.is_authorized(credentials) {
            response::write_unauthorized(&mut stream)?;
            return Ok(());
        }
    }
    log::debug!("{} is requesting {}", peer, request.path);
    route(ctx, stream, &request)
}

fn route(ctx: &ServerContext, mut stream: TcpStream, request: &HttpRequest) -> Result<()> {
    let segments = request.segments();
    let feed_name = segments[0];

    if feed_name.is_empty() {
        let page = pages::render_index(&ctx.config.template_dir, &ctx.config.feeds);
        response::write_html(&mut stream, 200, &page)?;
        return Ok(());
    }
    if feed_name == "shutdown" {
        response::write_html(&mut stream, 200, SHUTDOWN_BODY)?;
        log::info!("shutdown requested over http");
        ctx.shutdown.trigger();
        return Ok(());
    }
    let Some(feed) = ctx.feed(feed_name) else {
        response::write_html(&mut stream, 404, FEED_NOT_FOUND)?;
        return Ok(());
    };

    match segments.get(1).copied() {
        None | Some("") => {
            let page = pages::render_feed(&ctx.config.template_dir, feed.name());
            response::write_html(&mut stream, 200, &page)?;
        }
        Some("mjpeg") => {
            let options = LiveOptions {
                raw: request.query_flag("raw"),
                min_interval: live::parse_max_fps(segments.get(2).copied())?,
                ..LiveOptions::default()
            };
            live::serve(
                stream,
                &ctx.registry,
                &feed.config.input,
                options,
                &ctx.shutdown,
            )?;
        }
        Some("stream") if feed.config.output.is_some() => {
            serve_output(ctx, stream, feed)?;
        }
        Some("snapshot") => match feed.latest_snapshot() {
            Some(jpeg) => response::write_snapshot(&mut stream, &jpeg)?,
            None => response::write_html(&mut stream, 404, UNKNOWN_ACTION)?,
        },
        _ => response::write_html(&mut stream, 404, UNKNOWN_ACTION)?,
    }
    Ok(())
}

fn serve_output(ctx: &ServerContext, mut stream: TcpStream, feed: &Feed) -> Result<()> {
    let Some(output) = feed.config.output.as_ref() else {
        response::write_html(&mut stream, 404, UNKNOWN_ACTION)?;
        return Ok(());
    };
    stream.write_all(response::streaming_head(&output.content_type, true).as_bytes())?;
    stream.set_write_timeout(Some(live::STALL_TIMEOUT))?;

    let running = ctx.shutdown.clone();
    let keep_going: pipe::KeepGoing = Arc::new(move || running.is_running());
    pipe::pipe(
        &ctx.registry,
        &feed.config.input,
        &output.process,
        Box::new(stream),
        Some(keep_going),
    )?;
    Ok(())
}
