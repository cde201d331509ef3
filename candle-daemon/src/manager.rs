//! Run loop and I/O tasks
//!
//! This module handles:
//! - Reading frames from the configured CAN source on a blocking task
//! - Reading command lines from stdin
//! - Driving the engine: frames, commands, stale deadlines, playback ticks
//!   and playback refills
//! - Writing metric updates to stdout as JSON lines

use crate::config::SourceConfig;
use crate::engine::Engine;
use anyhow::Result;
use candle_adapters::{CandumpSource, DemoSource};
use candle_core::{CanFrame, CanSource, MetricUpdate};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a source with nothing to deliver is left alone
const SOURCE_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub const FRAME_CHANNEL_CAPACITY: usize = 1024;
pub const COMMAND_CHANNEL_CAPACITY: usize = 32;

pub fn create_source(config: &SourceConfig) -> Option<Box<dyn CanSource>> {
    match config {
        SourceConfig::Demo => Some(Box::new(DemoSource::new())),
        SourceConfig::Candump { path, unpaced } => {
            let source = CandumpSource::new(path);
            Some(Box::new(if *unpaced { source.unpaced() } else { source }))
        }
        SourceConfig::None => None,
    }
}

/// Main run loop. Returns once `cancel` fires.
pub async fn run(
    mut engine: Engine,
    mut frames: mpsc::Receiver<CanFrame>,
    mut commands: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Run loop started for {}", engine.vehicle().name());

    loop {
        let deadline = engine.next_deadline();

        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(frame) = frames.recv() => {
                engine.handle_frame(&frame, Instant::now()).await;
            }
            Some(line) = commands.recv() => {
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = engine.execute_line(&line, Instant::now()).await {
                    warn!(target: "command", "Command failed: {}", e);
                }
            }
            _ = wait_until(deadline) => {
                engine.on_deadline(Instant::now()).await;
            }
            window = engine.window_loaded() => {
                engine.on_window_loaded(window, Instant::now());
            }
        }
    }

    engine.shutdown();
    info!("Run loop stopped");
    Ok(())
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Poll `source` on a blocking task and forward its frames.
pub fn spawn_source(
    mut source: Box<dyn CanSource>,
    tx: mpsc::Sender<CanFrame>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = source.start() {
            error!(target: "can", "Failed to start source {}: {}", source.name(), e);
            return;
        }
        info!(target: "can", "Source {} started", source.name());

        while !cancel.is_cancelled() {
            match source.read_frame() {
                Ok(Some(frame)) => {
                    if tx.blocking_send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    if !source.is_active() {
                        info!(target: "can", "Source {} finished", source.name());
                        break;
                    }
                    std::thread::sleep(SOURCE_POLL_INTERVAL);
                }
                Err(e) => {
                    warn!(target: "can", "Error reading frame from {}: {}", source.name(), e);
                    std::thread::sleep(SOURCE_POLL_INTERVAL);
                }
            }
        }

        if let Err(e) = source.stop() {
            error!(target: "can", "Error stopping source {}: {}", source.name(), e);
        }
    })
}

/// Forward lines from `reader` until EOF or cancellation.
pub fn spawn_commands<R>(
    reader: R,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(target: "command", "Command input closed");
                    break;
                }
                Err(e) => {
                    warn!(target: "command", "Failed to read command: {}", e);
                    break;
                }
            }
        }
    })
}

/// Write the metric id header and the current state of every metric, then
/// one `[index,[values]]` line per update.
pub async fn write_updates<W>(
    metric_ids: &[String],
    snapshot: Vec<MetricUpdate>,
    mut rx: broadcast::Receiver<MetricUpdate>,
    mut out: W,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = serde_json::to_string(metric_ids)?;
    out.write_all(header.as_bytes()).await?;
    out.write_all(b"\n").await?;
    for update in snapshot {
        out.write_all(update.to_json()?.as_bytes()).await?;
        out.write_all(b"\n").await?;
    }
    out.flush().await?;

    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = rx.recv() => update,
        };

        match update {
            Ok(update) => {
                let line = update.to_json()?;
                out.write_all(line.as_bytes()).await?;
                out.write_all(b"\n").await?;
                out.flush().await?;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Update output lagged, skipped {} updates", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    Ok(())
}
