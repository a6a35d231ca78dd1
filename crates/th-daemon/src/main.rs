//! taskhive daemon: runs the worker pool, reconciler and autoscaler until
//! ctrl-c.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use th_core::config::Config;
use th_telemetry::logging::{self, LogFormat};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "th-daemon", version, about = "taskhive worker daemon")]
struct Args {
    /// Config file (defaults to ~/.taskhive/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load config")?;

    logging::init(
        "th-daemon",
        &config.general.log_level,
        LogFormat::parse(&config.general.log_format),
    );
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "taskhive daemon starting");

    let daemon = th_daemon::daemon::Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
