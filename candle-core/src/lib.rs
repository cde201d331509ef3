//! Candle Core Library
//!
//! This crate provides the metric engine that turns raw CAN frames into
//! named, typed metrics, plus the trip log used to record and replay them.
//!
//! - [`Metric`] owns one signal's state, cooldown, smoothing and staleness.
//! - [`VehicleDefinition`] is the catalog describing which frames decode into
//!   which metrics.
//! - [`Vehicle`] dispatches frames, propagates changes through the dependency
//!   graph and notifies observers.
//! - [`trip`] holds the log format, the recorder and the player.

pub mod catalog;
pub mod command;
pub mod graph;
pub mod metric;
pub mod source;
pub mod trip;
pub mod vehicle;

pub use catalog::{CatalogError, ChangeHook, Decode, MetricDefinition, Topic, VehicleDefinition};
pub use command::{Command, CommandError};
pub use metric::{Metric, UpdateOutcome};
pub use source::{CanFrame, CanSource};
pub use vehicle::{MetricUpdate, MetricView, Vehicle};
