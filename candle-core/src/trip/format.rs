//! Trip log text format
//!
//! ```text
//! 1760870000000                 <- start time, epoch ms
//! gear,powered,soc_gids,range   <- metric ids, registration order
//! 0 0 4                         <- <offset ms> <metric index> <values>
//! 0 2 171
//! 1250 1 1
//! ```
//!
//! Values are comma-joined. Entries are written in non-decreasing offset
//! order; readers do not re-check it.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum TripLogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trip log is missing its header")]
    MissingHeader,

    #[error("Invalid trip start time: {0}")]
    InvalidStartTime(String),

    #[error("Malformed log entry: {0}")]
    MalformedEntry(String),

    #[error("No trip selected")]
    NoTrip,
}

/// First two lines of a trip log
#[derive(Debug, Clone, PartialEq)]
pub struct TripHeader {
    pub start_time_ms: i64,
    pub metric_ids: Vec<String>,
}

impl TripHeader {
    pub fn new(start_time_ms: i64, metric_ids: Vec<String>) -> Self {
        Self {
            start_time_ms,
            metric_ids,
        }
    }

    pub fn parse(start_line: &str, ids_line: &str) -> Result<Self, TripLogError> {
        let start_time_ms = start_line
            .trim()
            .parse::<i64>()
            .map_err(|_| TripLogError::InvalidStartTime(start_line.to_string()))?;

        let ids_line = ids_line.trim();
        let metric_ids = if ids_line.is_empty() {
            Vec::new()
        } else {
            ids_line.split(',').map(|id| id.trim().to_string()).collect()
        };

        Ok(Self {
            start_time_ms,
            metric_ids,
        })
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.start_time_ms)
    }

    pub fn metric_id(&self, index: usize) -> Option<&str> {
        self.metric_ids.get(index).map(String::as_str)
    }
}

impl fmt::Display for TripHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.start_time_ms)?;
        writeln!(f, "{}", self.metric_ids.join(","))
    }
}

/// One entry line, as stored on disk
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub time_offset: u64,
    pub metric_index: usize,
    pub values: Vec<f64>,
}

impl LogEntry {
    /// Resolve the metric index against the header; unknown indices yield `None`.
    pub fn into_keyframe(self, header: &TripHeader) -> Option<Keyframe> {
        let metric_id = header.metric_id(self.metric_index)?.to_string();
        Some(Keyframe {
            time_offset: self.time_offset,
            metric_id,
            values: self.values,
        })
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ", self.time_offset, self.metric_index)?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", value)?;
        }
        Ok(())
    }
}

impl FromStr for LogEntry {
    type Err = TripLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || TripLogError::MalformedEntry(s.to_string());

        let mut parts = s.split_whitespace();
        let (Some(offset), Some(index), Some(values), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };

        let time_offset = offset.parse::<u64>().map_err(|_| malformed())?;
        let metric_index = index.parse::<usize>().map_err(|_| malformed())?;
        let values = values
            .split(',')
            .map(|v| v.parse::<f64>().ok().filter(|v| v.is_finite()))
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(malformed)?;

        Ok(Self {
            time_offset,
            metric_index,
            values,
        })
    }
}

/// A replayable entry with its metric resolved by id
#[derive(Debug, Clone, PartialEq)]
pub struct Keyframe {
    pub time_offset: u64,
    pub metric_id: String,
    pub values: Vec<f64>,
}
