//! camera_http_server - MJPEG fan-out, transcoding and motion recording daemon
//!
//! This daemon:
//! 1. Loads the feed configuration once at startup
//! 2. Starts always-on capture for feeds with snapshots or motion detection
//! 3. Serves live MJPEG, transcoded streams and snapshots over HTTP
//! 4. Stops on `/shutdown` or Ctrl-C, closing open recordings

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use camera_http_server::{
    config::{ServerConfig, DEFAULT_CONFIG_PATH},
    ServerContext, ShutdownToken, StreamServer,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera HTTP Server")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "CAMERA_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listen port, overriding the configuration file and CAMERA_PORT.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ServerConfig::load(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    log::info!(
        "loaded {} feed(s) from {}",
        config.feeds.len(),
        args.config.display()
    );

    let shutdown = ShutdownToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        signal.trigger();
    })
    .expect("error setting Ctrl-C handler");

    let ctx = ServerContext::new(config, shutdown);
    ctx.start_captures();
    let handle = StreamServer::new(ctx.clone()).spawn()?;

    handle.wait()?;
    ctx.close_recordings();
    log::info!(
        "stopped after launching {} feed process(es)",
        ctx.registry.stats().processes_launched
    );
    Ok(())
}
