//! Candle Daemon
//!
//! Decodes CAN frames into vehicle metrics, records and replays trips.

use anyhow::{Context, Result};
use candle_daemon::{manager, DaemonConfig, Engine, SourceConfig};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Candle - CAN metric engine with trip recording and playback
#[derive(Parser, Debug)]
#[command(name = "candle")]
#[command(about = "Decode CAN frames into vehicle metrics", long_about = None)]
#[command(version)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Vehicle catalog to load
    #[arg(long, value_name = "NAME")]
    vehicle: Option<String>,

    /// Read frames from a candump log instead of the configured source
    #[arg(long, value_name = "FILE", conflicts_with = "demo")]
    candump: Option<PathBuf>,

    /// Use the synthetic drive cycle as the frame source
    #[arg(long)]
    demo: bool,

    /// Directory trips are recorded to and played from
    #[arg(long, value_name = "DIR")]
    recordings_dir: Option<PathBuf>,

    /// Never create recordings
    #[arg(long)]
    no_record: bool,

    /// Print the built-in vehicle catalogs and exit
    #[arg(long)]
    list_vehicles: bool,
}

impl Args {
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(vehicle) = self.vehicle {
            config.vehicle = vehicle;
        }
        if let Some(path) = self.candump {
            config.source = SourceConfig::Candump { path, unpaced: false };
        } else if self.demo {
            config.source = SourceConfig::Demo;
        }
        if let Some(dir) = self.recordings_dir {
            config.recordings_dir = dir;
        }
        if self.no_record {
            config.record = false;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the update stream
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.list_vehicles {
        for key in candle_adapters::CATALOGS {
            println!("{}", key);
        }
        return Ok(());
    }

    let config = args.into_config()?;
    info!("Starting Candle with vehicle {}", config.vehicle);

    let engine = Engine::new(&config).context("Failed to load vehicle")?;
    let cancel = CancellationToken::new();

    let (frame_tx, frame_rx) = mpsc::channel(manager::FRAME_CHANNEL_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(manager::COMMAND_CHANNEL_CAPACITY);

    let source = match manager::create_source(&config.source) {
        Some(source) => Some(manager::spawn_source(source, frame_tx, cancel.clone())),
        None => {
            info!("No CAN source configured");
            None
        }
    };
    manager::spawn_commands(BufReader::new(tokio::io::stdin()), command_tx, cancel.clone());

    let output = {
        let ids = engine.vehicle().metric_ids();
        let rx = engine.subscribe();
        let snapshot = engine.vehicle().snapshot();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let stdout = tokio::io::stdout();
            if let Err(e) = manager::write_updates(&ids, snapshot, rx, stdout, cancel).await {
                error!("Failed to write updates: {}", e);
            }
        })
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
                cancel.cancel();
            }
        });
    }

    manager::run(engine, frame_rx, command_rx, cancel.clone()).await?;

    cancel.cancel();
    if let Some(source) = source {
        source.await.context("Source task failed")?;
    }
    output.await.context("Output task failed")?;

    Ok(())
}
