//! Candle Daemon Library
//!
//! Runs the metric engine against a CAN source, takes commands on stdin and
//! streams metric updates to stdout.

pub mod config;
pub mod engine;
pub mod manager;

pub use config::{DaemonConfig, SourceConfig};
pub use engine::{Engine, EngineError};
