//! Source that replays a `candump -l` log file
//!
//! Each line looks like `(1436509052.249713) can0 5BC#2AC0000000000000`.
//! Frames are released at the pace they were captured, relative to the
//! first line, unless pacing is disabled.

use anyhow::{Context, Result};
use candle_core::{CanFrame, CanSource};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Parse one log line into its capture timestamp (seconds) and frame.
///
/// Remote frames yield an empty payload. CAN FD lines (`ID##<flags><data>`)
/// are accepted; the flags nibble is dropped.
pub fn parse_candump_line(line: &str) -> Option<(f64, CanFrame)> {
    let mut parts = line.split_whitespace();

    let timestamp = parts
        .next()?
        .strip_prefix('(')?
        .strip_suffix(')')?
        .parse::<f64>()
        .ok()?;
    let _interface = parts.next()?;
    let (id, payload) = parts.next()?.split_once('#')?;

    if id.is_empty() || id.len() > 8 {
        return None;
    }
    let id = u32::from_str_radix(id, 16).ok()?;

    let payload = match payload.strip_prefix('#') {
        Some(fd) => fd.get(1..)?,
        None => payload,
    };

    let data = if payload.starts_with('R') {
        Vec::new()
    } else {
        parse_hex(payload)?
    };

    Some((timestamp, CanFrame::new(id, data)))
}

fn parse_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || hex.len() > 128 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

pub struct CandumpSource {
    path: PathBuf,
    lines: Option<Lines<BufReader<File>>>,
    paced: bool,
    started: Option<Instant>,
    first_timestamp: Option<f64>,
    pending: Option<(f64, CanFrame)>,
    skipped: usize,
}

impl CandumpSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lines: None,
            paced: true,
            started: None,
            first_timestamp: None,
            pending: None,
            skipped: 0,
        }
    }

    /// Release frames as fast as they are read
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines that could not be parsed so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn next_entry(&mut self) -> Result<Option<(f64, CanFrame)>> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(None);
        };

        for line in lines.by_ref() {
            let line = line.with_context(|| format!("Failed to read {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_candump_line(&line) {
                Some(entry) => return Ok(Some(entry)),
                None => {
                    debug!(target: "can", "Skipping unparsable line: {}", line);
                    self.skipped += 1;
                }
            }
        }

        info!(target: "can", "Reached end of {}", self.path.display());
        self.lines = None;
        Ok(None)
    }

    fn is_due(&mut self, timestamp: f64) -> bool {
        if !self.paced {
            return true;
        }
        let first = *self.first_timestamp.get_or_insert(timestamp);
        let Some(started) = self.started else {
            return false;
        };
        let offset = Duration::from_secs_f64((timestamp - first).max(0.0));
        started.elapsed() >= offset
    }
}

impl CanSource for CandumpSource {
    fn name(&self) -> &str {
        "candump"
    }

    fn start(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open candump log {}", self.path.display()))?;
        self.lines = Some(BufReader::new(file).lines());
        self.started = Some(Instant::now());
        self.first_timestamp = None;
        self.pending = None;
        self.skipped = 0;
        info!(target: "can", "Replaying {}", self.path.display());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.lines = None;
        self.started = None;
        self.pending = None;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<CanFrame>> {
        if self.pending.is_none() {
            self.pending = self.next_entry()?;
        }

        let timestamp = match &self.pending {
            Some((timestamp, _)) => *timestamp,
            None => return Ok(None),
        };
        if !self.is_due(timestamp) {
            return Ok(None);
        }

        Ok(self.pending.take().map(|(_, frame)| frame))
    }

    fn is_active(&self) -> bool {
        self.lines.is_some() || self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_line() {
        let (ts, frame) = parse_candump_line("(1436509052.249713) can0 5BC#2AC0000000000000").unwrap();
        assert!((ts - 1436509052.249713).abs() < 1e-6);
        assert_eq!(frame.id, 0x5bc);
        assert_eq!(frame.data, vec![0x2a, 0xc0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_parse_special_frames() {
        let (_, remote) = parse_candump_line("(1.0) vcan0 123#R").unwrap();
        assert!(remote.data.is_empty());

        let (_, empty) = parse_candump_line("(1.0) vcan0 123#").unwrap();
        assert!(empty.data.is_empty());

        let (_, extended) = parse_candump_line("(1.0) can1 18DAF110#0102").unwrap();
        assert_eq!(extended.id, 0x18DAF110);

        let (_, fd) = parse_candump_line("(1.0) can0 1DB##1AABB").unwrap();
        assert_eq!(fd.data, vec![0xaa, 0xbb]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for line in [
            "",
            "can0 5BC#00",
            "(abc) can0 5BC#00",
            "(1.0) can0 5BC00",
            "(1.0) can0 XYZ#00",
            "(1.0) can0 5BC#0",
            "(1.0) can0 5BC#GG",
            "(1.0) can0 123456789#00",
        ] {
            assert!(parse_candump_line(line).is_none(), "accepted {:?}", line);
        }
    }
}
