//! Operator commands
//!
//! Text commands arrive from the command surface (and from change hooks) and
//! map one-to-one onto trip and metric operations.
//!
//! ```text
//! trip name <file>
//! trip start
//! trip end
//! trip playback start [seconds]
//! trip playback stop
//! trip playback speed <n>
//! trip playback log
//! metric set <id> <comma-values>
//! ```

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Select the trip file; records into it when it does not exist yet
    TripName(String),
    /// Start a new recording named after the current time
    TripStart,
    /// Close the current trip, stopping recording and playback
    TripEnd,
    /// Replay the selected trip, optionally from a position in seconds
    PlaybackStart(Option<f64>),
    PlaybackStop,
    PlaybackSpeed(f64),
    /// Log the current playback position
    PlaybackLog,
    /// Force a metric to the given state
    MetricSet { id: String, state: Vec<f64> },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    #[error("Playback speed must be a positive finite number, got {0}")]
    InvalidSpeed(f64),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Metric {metric} takes {expected} values, got {got}")]
    Arity {
        metric: String,
        expected: usize,
        got: usize,
    },
}

fn parse_number(text: &str) -> Result<f64, CommandError> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CommandError::InvalidNumber(text.to_string()))
}

/// Parse a comma-joined list of numbers, as used by `metric set` and trip logs
pub fn parse_values(text: &str) -> Result<Vec<f64>, CommandError> {
    text.split(',').map(parse_number).collect()
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let args: Vec<&str> = s.split_whitespace().collect();

        match args.as_slice() {
            [] => Err(CommandError::Empty),
            ["trip", "name", name, ..] => Ok(Command::TripName(name.to_string())),
            ["trip", "name"] => Err(CommandError::MissingArgument("file")),
            ["trip", "start"] => Ok(Command::TripStart),
            ["trip", "end"] => Ok(Command::TripEnd),
            ["trip", "playback", "start"] => Ok(Command::PlaybackStart(None)),
            ["trip", "playback", "start", seconds, ..] => {
                let seconds = parse_number(seconds)?;
                if seconds < 0.0 {
                    return Err(CommandError::InvalidNumber(seconds.to_string()));
                }
                Ok(Command::PlaybackStart(Some(seconds)))
            }
            ["trip", "playback", "stop"] => Ok(Command::PlaybackStop),
            ["trip", "playback", "speed"] => Err(CommandError::MissingArgument("speed")),
            ["trip", "playback", "speed", speed, ..] => {
                let speed = parse_number(speed)?;
                if speed <= 0.0 {
                    return Err(CommandError::InvalidSpeed(speed));
                }
                Ok(Command::PlaybackSpeed(speed))
            }
            ["trip", "playback", "log"] => Ok(Command::PlaybackLog),
            ["metric", "set", id, values, ..] => Ok(Command::MetricSet {
                id: id.to_string(),
                state: parse_values(values)?,
            }),
            ["metric", "set", ..] => Err(CommandError::MissingArgument("id and values")),
            _ => Err(CommandError::Unknown(s.trim().to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::TripName(name) => write!(f, "trip name {}", name),
            Command::TripStart => write!(f, "trip start"),
            Command::TripEnd => write!(f, "trip end"),
            Command::PlaybackStart(None) => write!(f, "trip playback start"),
            Command::PlaybackStart(Some(seconds)) => write!(f, "trip playback start {}", seconds),
            Command::PlaybackStop => write!(f, "trip playback stop"),
            Command::PlaybackSpeed(speed) => write!(f, "trip playback speed {}", speed),
            Command::PlaybackLog => write!(f, "trip playback log"),
            Command::MetricSet { id, state } => {
                let values: Vec<String> = state.iter().map(f64::to_string).collect();
                write!(f, "metric set {} {}", id, values.join(","))
            }
        }
    }
}
