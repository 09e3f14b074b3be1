//! kestreld - Kestrel instrument control daemon
//!
//! Loads the instrument configuration, wires the camera, peers and calibration
//! ledger together and serves commands until interrupted.

use anyhow::{bail, Context, Result};
use clap::Parser;
use kestrel_sequencer::{
    InstrumentConfig, InstrumentState, JsonLedgerStore, Server, SimulatedCamera, SystemClock,
    TcpPeerGateway,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "kestreld", version, about = "Kestrel CCD instrument control daemon")]
struct Args {
    /// Instrument configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured command port
    #[arg(short, long)]
    port: Option<u16>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn init_logging(config: &InstrumentConfig) {
    // RUST_LOG wins over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

fn load_config(args: &Args) -> Result<InstrumentConfig> {
    let mut config = match &args.config {
        Some(path) => InstrumentConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => InstrumentConfig::default(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config);

    if args.check {
        tracing::info!("Configuration OK");
        return Ok(());
    }
    if !config.detector.simulate {
        bail!("no native camera driver is built in; set detector.simulate = true");
    }

    std::fs::create_dir_all(&config.files.data_dir)
        .with_context(|| format!("creating data directory {}", config.files.data_dir.display()))?;

    let device = Arc::new(SimulatedCamera::new(config.detector.simulate_time_scale));
    let peers = Arc::new(TcpPeerGateway::new(config.peers.clone()));
    let ledger = Arc::new(JsonLedgerStore::new(config.twilight.ledger_path.clone()));
    let clock = Arc::new(SystemClock);
    tracing::info!(
        "Starting {} with simulated camera (time scale {})",
        config.server.instrument_name,
        config.detector.simulate_time_scale
    );

    let state = InstrumentState::new(config, device, peers, ledger, clock)
        .context("resuming frame numbering")?;
    let server = Server::bind(Arc::new(state)).await.context("binding command port")?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for interrupt: {}", e);
                return;
            }
            tracing::info!("Interrupt received");
            shutdown.cancel();
        });
    }

    server.run(shutdown).await?;
    tracing::info!("kestreld stopped");
    Ok(())
}
