//! Integration tests for trip recording and playback

use candle_core::trip::{TripLogError, TripPlayer};
use candle_core::{MetricDefinition, MetricUpdate, Vehicle, VehicleDefinition};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Helper: a vehicle with one raw metric and one derived from it
fn vehicle() -> Vehicle {
    Vehicle::from_definition(
        VehicleDefinition::new("Test")
            .with_extra_metric(MetricDefinition::new("a"))
            .with_extra_metric(
                MetricDefinition::new("b")
                    .with_dependencies(&["a"])
                    .derived(|m, _| Some(vec![m.value("a")? + 1.0])),
            ),
    )
    .unwrap()
}

fn drain(rx: &mut broadcast::Receiver<MetricUpdate>) -> Vec<MetricUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
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

fn record_trip(path: &Path) {
    let mut vehicle = vehicle();
    let t0 = Instant::now();

    vehicle.start_recording(path, t0).unwrap();
    vehicle.update_metric(0, Some(vec![5.0]), false, t0 + Duration::from_millis(100));
    vehicle.update_metric(0, Some(vec![7.0]), false, t0 + Duration::from_millis(300));
    vehicle.stop_recording();
}

// ==================== Recording ====================

#[test]
fn test_recording_contains_snapshot_and_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trip.log");
    record_trip(&path);

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();

    assert_eq!(lines[1], "a,b");
    assert_eq!(
        &lines[2..],
        &["0 0 0", "0 1 0", "100 0 5", "100 1 6", "300 0 7", "300 1 8"]
    );
}

#[tokio::test]
async fn test_replay_does_not_record() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.log");
    let target = dir.path().join("target.log");
    record_trip(&source);

    let mut vehicle = vehicle();
    let mut player = TripPlayer::new();
    let t0 = Instant::now();

    vehicle.start_recording(&target, t0).unwrap();
    player.start(&mut vehicle, &source, None, t0).await.unwrap();
    tick(&mut player, &mut vehicle, t0).await.unwrap();
    tick(&mut player, &mut vehicle, t0 + Duration::from_millis(400)).await.unwrap();
    player.stop(&mut vehicle);
    vehicle.stop_recording();

    assert_eq!(vehicle.metric("a").unwrap().value(), 7.0);

    // Header plus the initial snapshot only
    let contents = std::fs::read_to_string(&target).unwrap();
    assert_eq!(contents.lines().count(), 4);
}

#[test]
fn test_switching_recordings_flushes_the_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.log");
    let second = dir.path().join("second.log");

    let mut vehicle = vehicle();
    let t0 = Instant::now();

    vehicle.start_recording(&first, t0).unwrap();
    vehicle.update_metric(0, Some(vec![5.0]), false, t0 + Duration::from_millis(100));
    // Still below the write threshold, so nothing but the header is on disk
    assert!(std::fs::read_to_string(&first).unwrap().lines().count() <= 2);

    vehicle.start_recording(&second, t0 + Duration::from_millis(200)).unwrap();
    assert_eq!(vehicle.recorder().unwrap().path(), second.as_path());

    let contents = std::fs::read_to_string(&first).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(&lines[2..], &["0 0 0", "0 1 0", "100 0 5", "100 1 6"]);

    vehicle.stop_recording();
    let contents = std::fs::read_to_string(&second).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(&lines[2..], &["0 0 5", "0 1 6"]);
}

#[test]
fn test_reload_rebuilds_metrics_and_closes_recording() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trip.log");

    let mut vehicle = vehicle();
    let mut rx = vehicle.subscribe();
    let t0 = Instant::now();

    vehicle.start_recording(&path, t0).unwrap();
    vehicle.update_metric(0, Some(vec![5.0]), false, t0 + Duration::from_millis(100));

    vehicle
        .load_definition(
            VehicleDefinition::new("Reloaded")
                .with_extra_metric(MetricDefinition::new("x").with_default_state(vec![1.0, 2.0]))
                .with_extra_metric(MetricDefinition::new("y")),
        )
        .unwrap();

    assert_eq!(vehicle.name(), "Reloaded");
    assert_eq!(vehicle.metric_ids(), vec!["x".to_string(), "y".to_string()]);
    assert!(vehicle.metric("a").is_none());
    assert_eq!(vehicle.metric("x").unwrap().state(), &[1.0, 2.0]);
    assert!(!vehicle.is_recording());

    // The buffered tail made it to disk
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().last(), Some("100 1 6"));

    // Subscriptions survive the reload
    drain(&mut rx);
    vehicle.update_metric(1, Some(vec![3.0]), false, t0 + Duration::from_millis(200));
    assert_eq!(drain(&mut rx), vec![MetricUpdate { index: 1, state: vec![3.0] }]);
}

// ==================== Round trip ====================

#[tokio::test]
async fn test_record_then_replay_reproduces_updates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trip.log");
    record_trip(&path);

    let mut vehicle = vehicle();
    let mut rx = vehicle.subscribe();
    let mut player = TripPlayer::new();
    let t0 = Instant::now();

    player.start(&mut vehicle, &path, None, t0).await.unwrap();
    tick(&mut player, &mut vehicle, t0).await.unwrap();
    // Snapshot entries equal the defaults, so nothing commits yet
    assert!(drain(&mut rx).is_empty());

    tick(&mut player, &mut vehicle, t0 + Duration::from_millis(100)).await.unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![
            MetricUpdate { index: 0, state: vec![5.0] },
            MetricUpdate { index: 1, state: vec![6.0] },
        ]
    );

    tick(&mut player, &mut vehicle, t0 + Duration::from_millis(300)).await.unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![
            MetricUpdate { index: 0, state: vec![7.0] },
            MetricUpdate { index: 1, state: vec![8.0] },
        ]
    );
    assert_eq!(vehicle.metric("a").unwrap().value(), 7.0);
    assert_eq!(vehicle.metric("b").unwrap().value(), 8.0);
}

#[tokio::test]
async fn test_start_position_in_the_middle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trip.log");
    record_trip(&path);

    let mut vehicle = vehicle();
    let mut player = TripPlayer::new();

    player
        .start(&mut vehicle, &path, Some(200.0), Instant::now())
        .await
        .unwrap();

    assert_eq!(vehicle.metric("a").unwrap().value(), 5.0);
    assert_eq!(vehicle.metric("b").unwrap().value(), 6.0);
    assert_eq!(player.loaded_keyframes(), 2);
}

// ==================== Looping ====================

#[tokio::test]
async fn test_playback_loops_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trip.log");
    std::fs::write(&path, "1760870000000\na,b\n0 0 1\n100 0 2\n").unwrap();

    let mut vehicle = vehicle();
    let mut player = TripPlayer::new();
    let t0 = Instant::now();

    player.start(&mut vehicle, &path, None, t0).await.unwrap();
    tick(&mut player, &mut vehicle, t0).await.unwrap();
    assert_eq!(vehicle.metric("a").unwrap().value(), 1.0);

    // Consumes the last keyframe, then wraps around
    tick(&mut player, &mut vehicle, t0 + Duration::from_millis(150)).await.unwrap();
    assert_eq!(vehicle.metric("a").unwrap().value(), 2.0);
    assert_eq!(player.position(), 0.0);
    assert_eq!(player.loaded_keyframes(), 2);

    tick(&mut player, &mut vehicle, t0 + Duration::from_millis(200)).await.unwrap();
    assert_eq!(player.position(), 50.0);
    assert_eq!(vehicle.metric("a").unwrap().value(), 1.0);
    assert!(player.is_playing());
}

#[tokio::test]
async fn test_empty_log_keeps_playing_at_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trip.log");
    std::fs::write(&path, "1760870000000\na,b\n").unwrap();

    let mut vehicle = vehicle();
    let mut player = TripPlayer::new();
    let t0 = Instant::now();

    player.start(&mut vehicle, &path, None, t0).await.unwrap();
    tick(&mut player, &mut vehicle, t0).await.unwrap();
    tick(&mut player, &mut vehicle, t0 + Duration::from_millis(50)).await.unwrap();

    assert!(player.is_playing());
    assert_eq!(player.position(), 0.0);
}

#[tokio::test]
async fn test_unreadable_log_stops_playback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trip.log");
    std::fs::write(&path, "1760870000000\na,b\n0 0 1\n").unwrap();

    let mut vehicle = vehicle();
    let mut player = TripPlayer::new();
    let t0 = Instant::now();

    player.start(&mut vehicle, &path, None, t0).await.unwrap();
    tick(&mut player, &mut vehicle, t0).await.unwrap();

    std::fs::write(&path, "not a header").unwrap();
    let result = tick(&mut player, &mut vehicle, t0 + Duration::from_millis(50)).await;

    assert!(result.is_err());
    assert!(!player.is_playing());
    assert!(!vehicle.is_replaying());
}
