//! Integration tests for the CandumpSource

use candle_adapters::{catalog, nissan_leaf, CandumpSource};
use candle_core::{CanSource, Vehicle};
use std::io::Write;
use std::time::Instant;

const LOG: &str = "\
(1436509052.000000) can0 5BC#2AC0000000000000
this line is not a frame
(1436509052.010000) can0 11A#4040000000000000

(1436509053.500000) can0 7FF#00
";

fn write_log() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(LOG.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_missing_file_fails_to_start() {
    let mut source = CandumpSource::new("/nonexistent/candle/trip.candump");
    assert!(source.start().is_err());
    assert!(!source.is_active());
}

#[test]
fn test_unpaced_reads_every_frame_and_skips_garbage() {
    let log = write_log();
    let mut source = CandumpSource::new(log.path()).unpaced();
    source.start().unwrap();
    assert!(source.is_active());

    let mut ids = Vec::new();
    while let Some(frame) = source.read_frame().unwrap() {
        ids.push(frame.id);
    }

    assert_eq!(ids, vec![0x5bc, 0x11a, 0x7ff]);
    assert_eq!(source.skipped(), 1);
    assert!(!source.is_active());
}

#[test]
fn test_paced_holds_back_future_frames() {
    let log = write_log();
    let mut source = CandumpSource::new(log.path());
    source.start().unwrap();

    let first = source.read_frame().unwrap().unwrap();
    assert_eq!(first.id, 0x5bc);

    // The next frame is 10 ms later in the capture; far frames stay pending
    let mut released = 0;
    while source.read_frame().unwrap().is_some() {
        released += 1;
        if released > 1 {
            break;
        }
    }
    assert!(released <= 1);
    assert!(source.is_active());

    source.stop().unwrap();
    assert!(!source.is_active());
}

#[test]
fn test_log_frames_drive_the_leaf_catalog() {
    let log = write_log();
    let mut source = CandumpSource::new(log.path()).unpaced();
    let mut vehicle = Vehicle::from_definition(catalog(nissan_leaf::KEY).unwrap()).unwrap();
    source.start().unwrap();

    let now = Instant::now();
    while let Some(frame) = source.read_frame().unwrap() {
        vehicle.handle_frame(&frame, now);
    }

    assert_eq!(vehicle.metric("soc_gids").unwrap().value(), 171.0);
    assert_eq!(vehicle.metric("range").unwrap().value(), 78.0);
    assert_eq!(vehicle.metric("powered").unwrap().value(), 1.0);
}
