//! Arbiter Daemon - Shared Turret Bot Server
//!
//! Entry point for the arbiter daemon. Operators connect over WebSocket,
//! register a display name and take turns driving the bot.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (0.0.0.0:3000, /dev/cu.usbmodem1411)
//! arbiter-daemon
//!
//! # Custom listen address and device
//! arbiter-daemon --listen 127.0.0.1:8080 --device /dev/ttyACM0
//!
//! # With config file
//! arbiter-daemon --config /etc/turret-arbiter/arbiter.toml
//!
//! # Verbose logging
//! RUST_LOG=debug arbiter-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `ARBITER_CONFIG`: Configuration file path
//! - `ARBITER_DEVICE` / `NXT_DEVICE`: Device address of the brick
//! - `ARBITER_LISTEN` / `PORT`: Listen address or port
//! - `RUST_LOG`: Log filter (overrides `--log-level`)
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (motors are stopped first)

mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use arbiter_core::{
    default_config_path, load_config_from_path, Arbiter, ArbiterHandle, ConfigOverrides,
    SimulatedDriver,
};
use server::{DaemonServer, ServerConfig};

/// Arbiter Daemon - Turn-based remote control for a shared turret bot
#[derive(Parser, Debug)]
#[command(name = "arbiter-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address for the WebSocket listener
    #[arg(short = 'L', long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "ARBITER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Device address of the brick
    #[arg(short = 'd', long, value_name = "DEVICE")]
    device: Option<String>,

    /// Seconds each operator keeps the turn
    #[arg(short = 'r', long, value_name = "SECS")]
    rotation_secs: Option<u64>,

    /// Allow several operators from the same address
    #[arg(long)]
    allow_shared_origin: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "ARBITER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(addr) = self.listen {
            overrides = overrides.with_listen_addr(addr);
        }
        if let Some(ref device) = self.device {
            overrides = overrides.with_device_address(device.clone());
        }
        if let Some(secs) = self.rotation_secs {
            overrides = overrides.with_rotation_interval_secs(secs);
        }
        if self.allow_shared_origin {
            overrides = overrides.with_allow_shared_origin(true);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "arbiter_daemon={level},arbiter_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Open the motor link and hand it to the arbiter
///
/// Runs alongside the listener; until it finishes every action is refused
/// as hardware-unavailable.
async fn connect_hardware(arbiter: ArbiterHandle, device: String) {
    match SimulatedDriver::connect(device.clone()).await {
        Ok(driver) => {
            info!(device = %device, "Motor link up");
            if arbiter.hardware_ready(Arc::new(driver)).await.is_err() {
                warn!("Arbiter stopped before hardware was ready");
            }
        }
        Err(e) => {
            error!(device = %device, error = %e, "Motor link failed; actions will be refused");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level)?;

    info!("Arbiter daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config =
        load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source(),
        listen = %config.listen_addr,
        device = %config.device_address,
        rotation_secs = config.rotation_interval.as_secs(),
        "Configuration loaded"
    );

    let (arbiter, arbiter_task) = Arbiter::spawn(&config);
    tokio::spawn(connect_hardware(
        arbiter.clone(),
        config.device_address.clone(),
    ));

    // Setup signal handlers
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let shutdown_clone = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    // Create and run daemon server
    let mut server = DaemonServer::new(ServerConfig::from(&config), arbiter.clone());
    let result = server.run(shutdown).await;

    // Cleanup
    info!("Shutting down...");
    if arbiter.shutdown().await.is_err() {
        warn!("Arbiter already stopped");
    }
    if let Err(e) = arbiter_task.await {
        error!(error = %e, "Arbiter task failed");
    }

    if let Err(ref e) = result {
        error!(error = %e, "Daemon exited with error");
    } else {
        info!("Daemon stopped");
    }
    result
}
