//! Trip playback
//!
//! The player streams a trip log in bounded windows of keyframes and applies
//! them to the [`Vehicle`] as a virtual clock advances. It never holds more
//! than [`MAX_LOADED_KEYFRAMES`] entries in memory, so multi-hour trips replay
//! on small devices. Reaching the end of the log wraps back to the start.
//!
//! Refills run on a spawned task so the caller keeps handling frames while
//! the log is read. The caller waits on [`TripPlayer::next_window`] and hands
//! the result to [`TripPlayer::finish_load`]; no tick is scheduled meanwhile.

use super::format::{Keyframe, LogEntry, TripHeader, TripLogError};
use crate::vehicle::Vehicle;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Upper bound on keyframes held in memory at once
pub const MAX_LOADED_KEYFRAMES: usize = 150;

/// Default time between playback ticks
pub const PLAYBACK_INTERVAL: Duration = Duration::from_millis(50);

/// One window read from disk
#[derive(Debug, Default)]
pub struct LoadedWindow {
    header: Option<TripHeader>,
    /// Latest entry per metric up to the seek position, by metric index
    snapshot: Vec<Keyframe>,
    keyframes: Vec<Keyframe>,
}

impl LoadedWindow {
    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }
}

fn before(offset: u64, seek: Bound<f64>) -> bool {
    let offset = offset as f64;
    match seek {
        Bound::Included(position) => offset <= position,
        Bound::Excluded(position) => offset < position,
        Bound::Unbounded => false,
    }
}

/// Read up to [`MAX_LOADED_KEYFRAMES`] keyframes past `seek`.
///
/// Entries up to `seek` are folded into a per-metric snapshot instead.
async fn read_window(path: &Path, seek: Bound<f64>) -> Result<LoadedWindow, TripLogError> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();

    let start_line = lines.next_line().await?.ok_or(TripLogError::MissingHeader)?;
    let ids_line = lines.next_line().await?.ok_or(TripLogError::MissingHeader)?;
    let header = TripHeader::parse(&start_line, &ids_line)?;

    let mut snapshot: BTreeMap<usize, Keyframe> = BTreeMap::new();
    let mut keyframes = Vec::new();
    let mut line_no = 2;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;

        let entry = match line.parse::<LogEntry>() {
            Ok(entry) => entry,
            Err(e) => {
                debug!(target: "trip", "Skipping line {}: {}", line_no, e);
                continue;
            }
        };

        let metric_index = entry.metric_index;
        let Some(keyframe) = entry.into_keyframe(&header) else {
            debug!(target: "trip", "Skipping entry for unknown metric index {}", metric_index);
            continue;
        };

        if keyframes.is_empty() && before(keyframe.time_offset, seek) {
            snapshot.insert(metric_index, keyframe);
            continue;
        }

        keyframes.push(keyframe);
        if keyframes.len() >= MAX_LOADED_KEYFRAMES {
            break;
        }
    }

    Ok(LoadedWindow {
        header: Some(header),
        snapshot: snapshot.into_values().collect(),
        keyframes,
    })
}

/// Replays a trip log onto a vehicle
#[derive(Debug)]
pub struct TripPlayer {
    path: Option<PathBuf>,
    header: Option<TripHeader>,
    window: Vec<Keyframe>,
    position_ms: f64,
    speed: f64,
    interval: Duration,
    playing: bool,
    loading: Option<JoinHandle<Result<LoadedWindow, TripLogError>>>,
    last_tick: Option<Instant>,
    next_tick: Option<Instant>,
}

impl TripPlayer {
    pub fn new() -> Self {
        Self::with_interval(PLAYBACK_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            path: None,
            header: None,
            window: Vec::new(),
            position_ms: 0.0,
            speed: 1.0,
            interval,
            playing: false,
            loading: None,
            last_tick: None,
            next_tick: None,
        }
    }

    /// Start replaying `path`.
    ///
    /// Without an explicit `position_ms`, playback resumes where it left off
    /// if `path` is the trip last played, and starts from zero otherwise.
    /// The latest value of every metric before the start position is applied
    /// immediately.
    pub async fn start(
        &mut self,
        vehicle: &mut Vehicle,
        path: &Path,
        position_ms: Option<f64>,
        now: Instant,
    ) -> Result<(), TripLogError> {
        self.stop(vehicle);

        let same_trip = self.path.as_deref() == Some(path);
        self.position_ms = match position_ms {
            Some(position) => position,
            None if same_trip => self.position_ms,
            None => 0.0,
        };
        self.path = Some(path.to_path_buf());

        let window = read_window(path, Bound::Excluded(self.position_ms)).await?;

        if let Some(header) = &window.header {
            info!(
                target: "trip",
                "Playing {} from {}ms ({} metrics, started {})",
                path.display(),
                self.position_ms,
                header.metric_ids.len(),
                header
                    .started_at()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| header.start_time_ms.to_string())
            );
        }

        vehicle.set_replaying(true);
        self.playing = true;
        self.install(vehicle, window, now);
        self.last_tick = None;
        self.next_tick = Some(now);
        Ok(())
    }

    /// Cancel the scheduled tick and any refill, and leave replay mode. The
    /// position is kept so a later start of the same trip resumes.
    pub fn stop(&mut self, vehicle: &mut Vehicle) {
        if let Some(load) = self.loading.take() {
            load.abort();
        }
        if self.playing {
            info!(target: "trip", "Playback stopped at {}ms", self.position_ms);
        }
        self.playing = false;
        self.next_tick = None;
        self.last_tick = None;
        self.window.clear();
        vehicle.set_replaying(false);
    }

    /// Advance the virtual clock and apply every keyframe that is due.
    ///
    /// When the window runs dry a refill from the current position starts in
    /// the background and no further tick is scheduled until it is installed.
    pub fn tick(&mut self, vehicle: &mut Vehicle, now: Instant) {
        if self.next_tick.is_none() {
            return;
        }

        if let Some(last) = self.last_tick {
            let elapsed = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
            self.position_ms += elapsed * self.speed;
        }
        self.last_tick = Some(now);

        self.apply_due(vehicle, now);

        if self.window.is_empty() {
            self.next_tick = None;
            self.begin_load(Bound::Included(self.position_ms));
        } else {
            self.next_tick = Some(now + self.interval);
        }
    }

    /// Wait for the refill in flight. Never resolves when there is none.
    ///
    /// Cancel safe: dropping the future leaves the refill running.
    pub async fn next_window(&mut self) -> Result<LoadedWindow, TripLogError> {
        let Some(load) = self.loading.as_mut() else {
            return std::future::pending().await;
        };

        let result = load.await;
        self.loading = None;
        match result {
            Ok(window) => window,
            Err(e) => Err(TripLogError::Io(std::io::Error::other(e))),
        }
    }

    /// Install a refilled window and schedule the next tick.
    ///
    /// The snapshot up to the current position is applied first, so the
    /// vehicle catches up with the clock however far it moved. An empty
    /// window past the start means the end was reached: playback wraps to 0
    /// and reloads from the first entry. A load error stops playback.
    pub fn finish_load(
        &mut self,
        vehicle: &mut Vehicle,
        window: Result<LoadedWindow, TripLogError>,
        now: Instant,
    ) -> Result<(), TripLogError> {
        if !self.playing {
            return Ok(());
        }

        let window = match window {
            Ok(window) => window,
            Err(e) => {
                self.stop(vehicle);
                return Err(e);
            }
        };

        let end_reached = window.is_empty() && self.position_ms > 0.0;
        self.install(vehicle, window, now);

        if end_reached {
            debug!(target: "trip", "End of trip reached, looping");
            self.position_ms = 0.0;
            self.begin_load(Bound::Excluded(0.0));
        } else {
            self.next_tick = Some(now + self.interval);
        }
        Ok(())
    }

    fn install(&mut self, vehicle: &mut Vehicle, window: LoadedWindow, now: Instant) {
        for keyframe in &window.snapshot {
            vehicle.apply_keyframe(keyframe, now);
        }
        self.header = window.header;
        self.window = window.keyframes;
    }

    fn begin_load(&mut self, seek: Bound<f64>) {
        let Some(path) = self.path.clone() else {
            return;
        };
        if let Some(previous) = self.loading.take() {
            previous.abort();
        }
        self.loading = Some(tokio::spawn(async move { read_window(&path, seek).await }));
    }

    fn apply_due(&mut self, vehicle: &mut Vehicle, now: Instant) {
        let position = self.position_ms;
        self.window.retain(|keyframe| {
            if keyframe.time_offset as f64 <= position {
                vehicle.apply_keyframe(keyframe, now);
                false
            } else {
                true
            }
        });
    }

    /// Change the playback rate; takes effect on the next tick.
    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Virtual playback position in milliseconds
    pub fn position(&self) -> f64 {
        self.position_ms
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Whether a refill is being read in the background
    pub fn is_loading(&self) -> bool {
        self.loading.is_some()
    }

    /// When the next tick is due, if one is scheduled
    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Trip currently or last played
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn header(&self) -> Option<&TripHeader> {
        self.header.as_ref()
    }

    pub fn loaded_keyframes(&self) -> usize {
        self.window.len()
    }
}

impl Default for TripPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MetricDefinition, VehicleDefinition};

    fn vehicle() -> Vehicle {
        Vehicle::from_definition(
            VehicleDefinition::new("Test")
                .with_extra_metric(MetricDefinition::new("speed"))
                .with_extra_metric(MetricDefinition::new("soc")),
        )
        .unwrap()
    }

    fn write_log(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("trip.log");
        std::fs::write(&path, format!("1760870000000\nspeed,soc\n{}", body)).unwrap();
        path
    }

    /// Tick, then install any refill it started
    async fn tick(player: &mut TripPlayer, vehicle: &mut Vehicle, now: Instant) -> Result<(), TripLogError> {
        player.tick(vehicle, now);
        while player.is_loading() {
            let window = player.next_window().await;
            player.finish_load(vehicle, window, now)?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_start_applies_snapshot_before_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), "0 0 10\n0 1 90\n500 0 20\n900 1 89\n1500 0 30\n");
        let mut vehicle = vehicle();
        let mut player = TripPlayer::new();

        player
            .start(&mut vehicle, &path, Some(1000.0), Instant::now())
            .await
            .unwrap();

        assert!(vehicle.is_replaying());
        assert_eq!(vehicle.metric("speed").unwrap().value(), 20.0);
        assert_eq!(vehicle.metric("soc").unwrap().value(), 89.0);
        assert_eq!(player.loaded_keyframes(), 1);
    }

    #[tokio::test]
    async fn test_tick_advances_with_speed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), "0 0 10\n100 0 20\n400 0 30\n10000 0 40\n");
        let mut vehicle = vehicle();
        let mut player = TripPlayer::new();
        let t0 = Instant::now();

        player.start(&mut vehicle, &path, None, t0).await.unwrap();
        assert_eq!(player.next_tick(), Some(t0));

        // First tick does not advance the clock
        player.tick(&mut vehicle, t0);
        assert_eq!(player.position(), 0.0);
        assert_eq!(vehicle.metric("speed").unwrap().value(), 10.0);
        assert_eq!(player.next_tick(), Some(t0 + PLAYBACK_INTERVAL));

        player.tick(&mut vehicle, t0 + Duration::from_millis(100));
        assert_eq!(vehicle.metric("speed").unwrap().value(), 20.0);

        player.set_speed(4.0);
        player.tick(&mut vehicle, t0 + Duration::from_millis(200));
        assert_eq!(player.position(), 500.0);
        assert_eq!(vehicle.metric("speed").unwrap().value(), 30.0);
        assert!(!player.is_loading());
    }

    #[tokio::test]
    async fn test_stop_keeps_position_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), "0 0 10\n300 0 20\n5000 0 30\n");
        let mut vehicle = vehicle();
        let mut player = TripPlayer::new();
        let t0 = Instant::now();

        player.start(&mut vehicle, &path, None, t0).await.unwrap();
        player.tick(&mut vehicle, t0);
        player.tick(&mut vehicle, t0 + Duration::from_millis(350));
        player.stop(&mut vehicle);

        assert!(!player.is_playing());
        assert!(!vehicle.is_replaying());
        assert!(player.next_tick().is_none());

        // Ticks after stop do nothing
        player.tick(&mut vehicle, t0 + Duration::from_secs(60));
        assert_eq!(player.position(), 350.0);

        player.start(&mut vehicle, &path, None, t0).await.unwrap();
        assert_eq!(player.position(), 350.0);
        assert_eq!(vehicle.metric("speed").unwrap().value(), 20.0);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut vehicle = vehicle();
        let mut player = TripPlayer::new();

        let result = player
            .start(&mut vehicle, &dir.path().join("nope.log"), None, Instant::now())
            .await;

        assert!(matches!(result, Err(TripLogError::Io(_))));
        assert!(!player.is_playing());
        assert!(!vehicle.is_replaying());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), "0 0 10\ngarbage\n0 7 1\n0 1 55\n");
        let mut vehicle = vehicle();
        let mut player = TripPlayer::new();
        let t0 = Instant::now();

        player.start(&mut vehicle, &path, None, t0).await.unwrap();
        assert_eq!(player.loaded_keyframes(), 2);
        player.tick(&mut vehicle, t0);
        assert_eq!(vehicle.metric("speed").unwrap().value(), 10.0);
        assert_eq!(vehicle.metric("soc").unwrap().value(), 55.0);
    }

    #[tokio::test]
    async fn test_refill_runs_in_background_and_holds_the_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..400).map(|i| format!("{} 0 {}\n", i, i)).collect();
        let path = write_log(dir.path(), &body);
        let mut vehicle = vehicle();
        let mut player = TripPlayer::new();
        let t0 = Instant::now();

        player.start(&mut vehicle, &path, None, t0).await.unwrap();
        assert_eq!(player.loaded_keyframes(), MAX_LOADED_KEYFRAMES);

        player.tick(&mut vehicle, t0);
        let t1 = t0 + Duration::from_millis(200);
        player.tick(&mut vehicle, t1);

        assert!(player.is_loading());
        assert!(player.is_playing());
        assert!(player.next_tick().is_none());
        assert_eq!(vehicle.metric("speed").unwrap().value(), 149.0);

        let window = player.next_window().await;
        player.finish_load(&mut vehicle, window, t1).unwrap();
        assert!(!player.is_loading());
        assert_eq!(player.next_tick(), Some(t1 + PLAYBACK_INTERVAL));
        assert_eq!(vehicle.metric("speed").unwrap().value(), 200.0);
        assert_eq!(player.loaded_keyframes(), MAX_LOADED_KEYFRAMES);
    }

    #[tokio::test]
    async fn test_refill_catches_up_after_jumping_several_windows() {
        let dir = tempfile::tempdir().unwrap();
        let mut body: String = (0..1000).map(|i| format!("{} 0 {}\n", i, i)).collect();
        body.push_str("100000 0 -1\n");
        let path = write_log(dir.path(), &body);
        let mut vehicle = vehicle();
        let mut player = TripPlayer::new();
        let t0 = Instant::now();

        player.start(&mut vehicle, &path, None, t0).await.unwrap();
        tick(&mut player, &mut vehicle, t0).await.unwrap();
        tick(&mut player, &mut vehicle, t0 + Duration::from_millis(1500)).await.unwrap();

        assert_eq!(player.position(), 1500.0);
        assert_eq!(vehicle.metric("speed").unwrap().value(), 999.0);
        assert_eq!(player.loaded_keyframes(), 1);

        tick(&mut player, &mut vehicle, t0 + Duration::from_millis(1550)).await.unwrap();
        assert_eq!(vehicle.metric("speed").unwrap().value(), 999.0);
    }

    #[tokio::test]
    async fn test_stop_abandons_refill() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), "0 0 10\n");
        let mut vehicle = vehicle();
        let mut player = TripPlayer::new();
        let t0 = Instant::now();

        player.start(&mut vehicle, &path, None, t0).await.unwrap();
        player.tick(&mut vehicle, t0);
        assert!(player.is_loading());

        player.stop(&mut vehicle);
        assert!(!player.is_loading());

        // A late result is ignored once stopped
        player
            .finish_load(&mut vehicle, Err(TripLogError::MissingHeader), t0)
            .unwrap();
        assert!(player.next_tick().is_none());
    }
}
