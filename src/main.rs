//! Sparrow Daemon - store-and-forward bridge between a TUN/TAP interface
//! and a packet database
//!
//! Usage:
//!   sparrowd -I tun0 -o /media/usb/packets.db
//!   sparrowd -I tap0 -o /media/usb/packets.db -a -d

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::TypedValueParser;
use clap::Parser;
use sparrowd::{BridgeConfig, BridgeController, DurableQueue, FramingMode, TunChannel, MAX_FRAME_LEN};
use tokio::signal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};


#[derive(Parser, Debug)]
#[command(name = "sparrowd")]
#[command(about = "Relay TUN/TAP traffic through a durable packet store", long_about = None)]
struct Cli {
    /// Name of the interface to create or attach to
    #[arg(short = 'I', long = "interface", value_name = "IFACENAME")]
    interface: String,

    /// Packet database file, e.g. on a removable drive
    #[arg(short = 'o', long = "output", value_name = "FILENAME")]
    output: PathBuf,

    /// Use a TUN interface (default)
    #[arg(short = 'u', long = "tun", conflicts_with = "tap")]
    tun: bool,

    /// Use a TAP interface
    #[arg(short = 'a', long = "tap")]
    tap: bool,

    /// Output debug information while running
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Longest time an idle drain waits before re-checking the store
    #[arg(long, default_value_t = 50, value_name = "MS")]
    poll_interval_ms: u64,

    /// Longest frame read from the interface; longer reads are dropped
    #[arg(
        long,
        default_value_t = MAX_FRAME_LEN,
        value_name = "BYTES",
        value_parser = clap::value_parser!(u16).range(1..).map(usize::from)
    )]
    read_buffer_len: usize,
}

impl Cli {
    fn mode(&self) -> FramingMode {
        if self.tap {
            FramingMode::Tap
        } else {
            FramingMode::Tun
        }
    }

    fn into_config(self) -> BridgeConfig {
        let mode = self.mode();
        BridgeConfig::new(self.interface, self.output)
            .with_mode(mode)
            .with_debug(self.debug)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_read_buffer_len(self.read_buffer_len)
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().into_config();
    init_logging(config.debug);
    config.validate()?;

    tracing::info!(
        interface = %config.interface,
        mode = %config.mode,
        store = %config.store_path.display(),
        read_buffer_len = config.read_buffer_len,
        "Starting sparrowd"
    );

    let queue = DurableQueue::initialize(&config.store_path)
        .with_context(|| format!("Can't open database {}", config.store_path.display()))?;
    let pending = queue.len().context("Failed to count stored packets")?;
    tracing::info!(store = %queue.path().display(), pending, "Packet store ready");

    let channel = TunChannel::open(&config.interface, config.mode, config.read_buffer_len)
        .with_context(|| format!("Error connecting to {} interface {}", config.mode, config.interface))?;
    tracing::info!(interface = channel.name(), mode = %channel.mode(), "Connected to interface");

    let (reader, writer) = channel.split();
    let mut bridge = BridgeController::new(config, queue).start(reader, writer);

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal");
        }
        _ = bridge.all_stopped() => {
            tracing::info!("Both pumps stopped");
        }
    }
    bridge.shutdown();
    let report = bridge.join().await;

    if !report.is_clean() {
        anyhow::bail!(
            "Bridge stopped on error (capture: {:?}, drain: {:?})",
            report.capture,
            report.drain
        );
    }
    Ok(())
}
