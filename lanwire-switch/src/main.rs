//! lanwire-switch daemon.

use anyhow::Context;
use clap::Parser;
use lanwire_switch::{FilePublisher, LinuxDevices, LogPublisher, Publisher, Switch, SwitchConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/lanwire/switch.json")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = SwitchConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let publisher: Arc<dyn Publisher> = match &config.publish.path {
        Some(path) => Arc::new(
            FilePublisher::open(path)
                .await
                .with_context(|| format!("opening publish file {}", path.display()))?,
        ),
        None => Arc::new(LogPublisher),
    };

    let switch = Switch::new(config, Arc::new(LinuxDevices), publisher)?;
    switch.start().await?;

    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => { info!("Received SIGINT"); }
        _ = sigterm.recv() => { info!("Received SIGTERM"); }
    }

    info!("Shutting down...");
    switch.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config = %args.config.display(), "lanwire-switch starting...");
    if let Err(e) = run(args).await {
        error!("lanwire-switch failed: {e:#}");
        std::process::exit(1);
    }
    info!("lanwire-switch stopped");
}
