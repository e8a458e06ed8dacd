//! echobusd - hosts a bus endpoint and serves the echo object.
//!
//! The daemon wires the library pieces together: host the bus, register
//! the `async` object with its `echo` and `longecho` methods, then run
//! until SIGINT or SIGTERM. Shutdown is graceful: pending deferred replies
//! are cancelled and their calls failed before the process exits.
//!
//! Exit status is nonzero if the bus connection or signal handler setup
//! fails at startup; registration failure only degrades the process.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use echobus_core::service::DEFAULT_OBJECT_NAME;
use echobus_core::{EchoConfig, EchoService, LoopbackBus};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Endpoint label used when `--socket` is not given.
const DEFAULT_ENDPOINT: &str = "echobus";

/// echobusd - deferred-reply echo service daemon
#[derive(Parser, Debug)]
#[command(name = "echobusd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Bus endpoint to connect to
    #[arg(short = 's', long)]
    socket: Option<String>,

    /// Object name to register the echo service under
    #[arg(long, default_value = DEFAULT_OBJECT_NAME)]
    object: String,

    /// Delay in milliseconds before longecho replies are sent
    #[arg(long, default_value_t = 5000)]
    delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let endpoint = args.socket.as_deref().unwrap_or(DEFAULT_ENDPOINT);
    let bus = LoopbackBus::host(endpoint);
    let conn = bus
        .connection()
        .with_context(|| format!("failed to connect to bus '{endpoint}'"))?;

    let config = EchoConfig::new(args.object.clone(), Duration::from_millis(args.delay_ms));
    let service = match EchoService::register(&conn, config) {
        Ok(service) => {
            info!(object = %args.object, endpoint, "echo service registered");
            Some(service)
        },
        Err(err) => {
            warn!(%err, object = %args.object, "registration failed, continuing degraded");
            None
        },
    };

    wait_for_shutdown().await?;

    if let Some(service) = service {
        service.shutdown().await;
    }
    bus.shutdown();
    info!("shutdown complete");
    Ok(())
}

/// Block until SIGINT or SIGTERM arrives.
async fn wait_for_shutdown() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
    Ok(())
}
