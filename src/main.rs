mod config;
mod dns;
mod flow;
mod geoip;
mod manager;
mod protocol;
mod route;
mod server;
mod ssh;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

const DEFAULT_GEOIP_DB: &str = "geoip.mmdb";

#[derive(Debug, Parser)]
#[command(name = "goway-rs", about = "Policy-routed HTTP/SOCKS5 forward proxy")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Write a starter config file to --config and exit.
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.init {
        config::write_default(&cli.config)?;
        tracing::info!(path = %cli.config.display(), "wrote starter config");
        return Ok(());
    }

    let cfg = config::load(&cli.config)?;
    let geoip_db_path = PathBuf::from(DEFAULT_GEOIP_DB);

    let manager = manager::Manager::start(cfg, &geoip_db_path).await?;

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping nodes");
    manager.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
