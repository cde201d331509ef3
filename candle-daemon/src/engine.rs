//! Command execution over the vehicle and the trip player
//!
//! The engine owns the [`Vehicle`] and the [`TripPlayer`] and is the only
//! place commands are carried out, whether they come from an operator or
//! from a metric's change hook.

use crate::config::DaemonConfig;
use candle_core::trip::{LoadedWindow, TripLogError, TripPlayer};
use candle_core::{CanFrame, CatalogError, Command, CommandError, MetricUpdate, Vehicle};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown vehicle: {0}")]
    UnknownVehicle(String),

    #[error("Invalid catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Invalid trip name: {0}")]
    InvalidTripName(String),

    #[error("No trip selected")]
    NoTrip,

    #[error("Recording failed: {0}")]
    Recording(#[from] std::io::Error),

    #[error("Playback failed: {0}")]
    Playback(#[from] TripLogError),
}

pub struct Engine {
    vehicle: Vehicle,
    player: TripPlayer,
    record: bool,
    recordings_dir: PathBuf,
    trip_path: Option<PathBuf>,
}

impl Engine {
    pub fn new(config: &DaemonConfig) -> Result<Self, EngineError> {
        let definition = candle_adapters::catalog(&config.vehicle)
            .ok_or_else(|| EngineError::UnknownVehicle(config.vehicle.clone()))?;

        Ok(Self {
            vehicle: Vehicle::from_definition(definition)?,
            player: TripPlayer::with_interval(config.playback_interval()),
            record: config.record,
            recordings_dir: config.recordings_dir.clone(),
            trip_path: None,
        })
    }

    pub fn vehicle(&self) -> &Vehicle {
        &self.vehicle
    }

    pub fn player(&self) -> &TripPlayer {
        &self.player
    }

    /// Trip file currently selected for recording or playback
    pub fn trip_path(&self) -> Option<&Path> {
        self.trip_path.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricUpdate> {
        self.vehicle.subscribe()
    }

    /// Earliest instant the run loop must wake for: a staleness deadline
    /// or the next playback tick.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.vehicle.next_deadline(), self.player.next_tick()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub async fn handle_frame(&mut self, frame: &CanFrame, now: Instant) {
        self.vehicle.handle_frame(frame, now);
        self.run_hook_commands(now).await;
    }

    /// Expire stale metrics and run the player if its tick is due.
    pub async fn on_deadline(&mut self, now: Instant) {
        if self.vehicle.expire_stale(now) > 0 {
            self.run_hook_commands(now).await;
        }

        if self.player.next_tick().is_some_and(|due| due <= now) {
            self.player.tick(&mut self.vehicle, now);
        }
    }

    /// Resolves once a playback refill has been read; pending while none is
    /// in flight. Cancel safe.
    pub async fn window_loaded(&mut self) -> Result<LoadedWindow, TripLogError> {
        self.player.next_window().await
    }

    /// Install a refill produced by [`Engine::window_loaded`].
    pub fn on_window_loaded(&mut self, window: Result<LoadedWindow, TripLogError>, now: Instant) {
        if let Err(e) = self.player.finish_load(&mut self.vehicle, window, now) {
            warn!(target: "trip", "Playback stopped: {}", e);
        }
    }

    /// Execute one command, then any commands queued by change hooks.
    pub async fn execute(&mut self, command: Command, now: Instant) -> Result<(), EngineError> {
        let result = self.apply(command, now).await;
        self.run_hook_commands(now).await;
        result
    }

    /// Parse and execute a command line
    pub async fn execute_line(&mut self, line: &str, now: Instant) -> Result<(), EngineError> {
        info!(target: "command", "Executing command: {}", line.trim());
        let command = line.parse::<Command>()?;
        self.execute(command, now).await
    }

    /// Stop playback and close any recording
    pub fn shutdown(&mut self) {
        self.player.stop(&mut self.vehicle);
        self.vehicle.stop_recording();
    }

    async fn run_hook_commands(&mut self, now: Instant) {
        loop {
            let commands = self.vehicle.take_commands();
            if commands.is_empty() {
                break;
            }
            for command in commands {
                debug!(target: "command", "Hook command: {}", command);
                if let Err(e) = self.apply(command, now).await {
                    warn!(target: "command", "Hook command failed: {}", e);
                }
            }
        }
    }

    async fn apply(&mut self, command: Command, now: Instant) -> Result<(), EngineError> {
        match command {
            Command::TripName(name) => self.select_trip(&name, now),
            Command::TripStart => self.start_trip(now),
            Command::TripEnd => {
                self.end_trip();
                Ok(())
            }
            Command::PlaybackStart(seconds) => {
                let path = self.trip_path.clone().ok_or(EngineError::NoTrip)?;
                // Replayed changes must not end up in the file being played
                self.vehicle.stop_recording();
                self.player
                    .start(&mut self.vehicle, &path, seconds.map(|s| s * 1000.0), now)
                    .await?;
                Ok(())
            }
            Command::PlaybackStop => {
                self.player.stop(&mut self.vehicle);
                Ok(())
            }
            Command::PlaybackSpeed(speed) => {
                self.player.set_speed(speed);
                info!(target: "trip", "Playback speed set to {}", speed);
                Ok(())
            }
            Command::PlaybackLog => {
                info!(target: "trip", "Playback is at {}ms", self.player.position());
                Ok(())
            }
            Command::MetricSet { id, state } => {
                self.vehicle.set_metric(&id, state, now)?;
                Ok(())
            }
        }
    }

    /// Select `<recordings_dir>/<name>.log`. A new file is recorded into when
    /// recording is enabled; an existing one is only opened for playback.
    fn select_trip(&mut self, name: &str, now: Instant) -> Result<(), EngineError> {
        if name.is_empty() || name.contains(|c| c == '/' || c == '\\') || name.starts_with('.') {
            return Err(EngineError::InvalidTripName(name.to_string()));
        }

        self.end_trip();
        let path = self.recordings_dir.join(format!("{}.log", name));
        info!(target: "trip", "File set to {}.log", name);

        if self.record && !path.exists() {
            self.vehicle.start_recording(&path, now)?;
        }
        self.trip_path = Some(path);
        Ok(())
    }

    /// Start a recording named after the current time, unless recording is
    /// disabled or a trip is already selected.
    fn start_trip(&mut self, now: Instant) -> Result<(), EngineError> {
        if !self.record || self.trip_path.is_some() {
            debug!(target: "trip", "Ignoring trip start");
            return Ok(());
        }

        let path = self
            .recordings_dir
            .join(format!("{}.log", chrono::Utc::now().timestamp_millis()));
        self.vehicle.start_recording(&path, now)?;
        self.trip_path = Some(path);
        Ok(())
    }

    fn end_trip(&mut self) {
        self.player.stop(&mut self.vehicle);
        self.vehicle.stop_recording();
        if let Some(path) = self.trip_path.take() {
            info!(target: "trip", "Trip ended: {}", path.display());
        }
    }
}
