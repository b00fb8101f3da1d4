//! lanwire-point: endpoint agent tunnelling a local tap to a switch.

use anyhow::Context;
use clap::Parser;
use lanwire_switch::config::BridgeConfig;
use lanwire_switch::{Agent, DeviceFactory, LinuxDevices, PointConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, conflicts_with = "connection")]
    config: Option<PathBuf>,

    /// Switch address, host or host:port
    #[arg(long, requires_all = ["username", "password"])]
    connection: Option<String>,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(short, long)]
    password: Option<String>,

    /// Tenant network to join
    #[arg(short, long, default_value = "default")]
    network: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load(args: &Args) -> anyhow::Result<PointConfig> {
    if let Some(path) = &args.config {
        return PointConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    let (Some(connection), Some(username), Some(password)) =
        (&args.connection, &args.username, &args.password)
    else {
        anyhow::bail!("either --config or --connection with credentials is required");
    };
    let mut config = PointConfig::new(connection, username, password);
    config.network = args.network.clone();
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load(&args)?;
    let devices = LinuxDevices;
    let device = devices
        .create_tap(&config.tap)
        .context("creating tap device")?;
    let bridge = config.bridge.clone();
    let agent = Agent::new(config, device)?;
    if let Some(name) = bridge {
        let bridge = devices.bridge(&BridgeConfig {
            name,
            ..Default::default()
        });
        bridge.open("").context("opening bridge")?;
        agent.attach(bridge)?;
    }

    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let runner = Arc::clone(&agent);
    tokio::select! {
        _ = runner.run() => {}
        _ = sigint.recv() => { info!("Received SIGINT"); }
        _ = sigterm.recv() => { info!("Received SIGTERM"); }
    }

    info!("Shutting down...");
    agent.stop();
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("lanwire-point starting...");
    if let Err(e) = run(args).await {
        error!("lanwire-point failed: {e:#}");
        std::process::exit(1);
    }
    info!("lanwire-point stopped");
}
