//! Buffered trip log writer

use super::format::{LogEntry, TripHeader};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Pending output is written once it reaches this many bytes
pub const WRITE_BUFFER_SIZE: usize = 100;

/// Appends entries to a trip log.
///
/// Writes are batched to spare flash storage; a failed write is logged and
/// its data dropped, the recording itself carries on.
pub struct TripRecorder {
    path: PathBuf,
    file: File,
    started: Instant,
    buffer: String,
}

impl TripRecorder {
    /// Open `path` for appending and queue the header.
    pub fn create(path: &Path, metric_ids: &[String], now: Instant) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let header = TripHeader::new(chrono::Utc::now().timestamp_millis(), metric_ids.to_vec());

        info!(target: "trip", "Recording to {}", path.display());

        let mut recorder = Self {
            path: path.to_path_buf(),
            file,
            started: now,
            buffer: header.to_string(),
        };
        recorder.flush_if_full();
        Ok(recorder)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry for the metric at `index`.
    pub fn record(&mut self, index: usize, state: &[f64], now: Instant) {
        let entry = LogEntry {
            time_offset: now.saturating_duration_since(self.started).as_millis() as u64,
            metric_index: index,
            values: state.to_vec(),
        };
        self.buffer.push_str(&entry.to_string());
        self.buffer.push('\n');
        self.flush_if_full();
    }

    /// Write out whatever is buffered.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(e) = self.file.write_all(self.buffer.as_bytes()) {
            warn!(target: "trip", "Failed to write {}: {}", self.path.display(), e);
        }
        self.buffer.clear();
    }

    pub fn close(mut self) {
        self.flush();
        info!(target: "trip", "Closed {}", self.path.display());
    }

    fn flush_if_full(&mut self) {
        if self.buffer.len() >= WRITE_BUFFER_SIZE {
            self.flush();
        }
    }
}

impl Drop for TripRecorder {
    fn drop(&mut self) {
        self.flush();
    }
}
