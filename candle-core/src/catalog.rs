//! Vehicle catalog types
//!
//! A catalog declares, per CAN frame id, the metrics decoded from that frame
//! and a set of extra metrics that are only derived from other metrics. The
//! engine never interprets what a signal means; it only runs the decoders
//! supplied here.

use crate::command::Command;
use crate::vehicle::MetricView;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decodes a metric's next state.
///
/// `data` is the frame payload when called from CAN dispatch, or `None` when
/// called because a dependency changed. Returning `None` means "no update",
/// not zero.
pub trait Decode: Send + Sync {
    fn decode(&self, data: Option<&[u8]>, metrics: &MetricView<'_>, current: &[f64])
        -> Option<Vec<f64>>;
}

impl<F> Decode for F
where
    F: Fn(Option<&[u8]>, &MetricView<'_>, &[f64]) -> Option<Vec<f64>> + Send + Sync,
{
    fn decode(
        &self,
        data: Option<&[u8]>,
        metrics: &MetricView<'_>,
        current: &[f64],
    ) -> Option<Vec<f64>> {
        self(data, metrics, current)
    }
}

/// Side effect run after a metric commits a live (non-replayed) change.
///
/// Hooks cannot touch the engine directly; they return commands which the
/// engine executes once the current operation has finished.
pub trait ChangeHook: Send + Sync {
    fn on_change(&self, state: &[f64], metrics: &MetricView<'_>) -> Vec<Command>;
}

impl<F> ChangeHook for F
where
    F: Fn(&[f64], &MetricView<'_>) -> Vec<Command> + Send + Sync,
{
    fn on_change(&self, state: &[f64], metrics: &MetricView<'_>) -> Vec<Command> {
        self(state, metrics)
    }
}

/// Immutable description of one metric
#[derive(Clone)]
pub struct MetricDefinition {
    /// Unique identifier, also used in trip log headers
    pub id: String,

    /// Display unit for front ends (e.g. "km", "%")
    pub suffix: Option<String>,

    /// Initial state; its length fixes the metric's arity
    pub default_state: Vec<f64>,

    /// Metrics whose changes re-run this metric's decoder
    pub dependencies: Vec<String>,

    /// Minimum time between accepted changes
    pub cooldown: Option<Duration>,

    /// Inactivity after which the state falls back to the default
    pub timeout: Option<Duration>,

    /// Decimal places to round each element to
    pub precision: Option<u32>,

    /// Maintain an interpolated shadow of the state
    pub smoothed: bool,

    /// Echo every change to the log
    pub log: bool,

    decoder: Option<Arc<dyn Decode>>,
    on_change: Option<Arc<dyn ChangeHook>>,
}

impl MetricDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            suffix: None,
            default_state: vec![0.0],
            dependencies: Vec::new(),
            cooldown: None,
            timeout: None,
            precision: None,
            smoothed: false,
            log: false,
            decoder: None,
            on_change: None,
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn with_default_state(mut self, state: Vec<f64>) -> Self {
        self.default_state = state;
        self
    }

    pub fn with_dependencies(mut self, ids: &[&str]) -> Self {
        self.dependencies = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_precision(mut self, places: u32) -> Self {
        self.precision = Some(places);
        self
    }

    pub fn smoothed(mut self) -> Self {
        self.smoothed = true;
        self
    }

    pub fn logged(mut self) -> Self {
        self.log = true;
        self
    }

    /// Set a decoder that sees both frame data and the other metrics.
    pub fn decoder<F>(self, decoder: F) -> Self
    where
        F: Fn(Option<&[u8]>, &MetricView<'_>, &[f64]) -> Option<Vec<f64>> + Send + Sync + 'static,
    {
        self.decode_with(decoder)
    }

    /// Set a decoder that only reads the frame payload.
    ///
    /// Dependency-triggered calls (no payload) produce no update.
    pub fn frame<F>(self, decoder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<f64>> + Send + Sync + 'static,
    {
        self.decoder(move |data, _metrics, _current| data.and_then(|bytes| decoder(bytes)))
    }

    /// Set a decoder that derives the state from other metrics only.
    pub fn derived<F>(self, decoder: F) -> Self
    where
        F: Fn(&MetricView<'_>, &[f64]) -> Option<Vec<f64>> + Send + Sync + 'static,
    {
        self.decoder(move |_data, metrics, current| decoder(metrics, current))
    }

    pub fn decode_with(mut self, decoder: impl Decode + 'static) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    pub fn on_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[f64], &MetricView<'_>) -> Vec<Command> + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(hook));
        self
    }

    /// Run the decoder, if any.
    pub fn decode(
        &self,
        data: Option<&[u8]>,
        metrics: &MetricView<'_>,
        current: &[f64],
    ) -> Option<Vec<f64>> {
        self.decoder.as_ref()?.decode(data, metrics, current)
    }

    /// Run the change hook, if any.
    pub fn changed(&self, state: &[f64], metrics: &MetricView<'_>) -> Vec<Command> {
        match &self.on_change {
            Some(hook) => hook.on_change(state, metrics),
            None => Vec::new(),
        }
    }

    pub fn has_hook(&self) -> bool {
        self.on_change.is_some()
    }
}

impl fmt::Debug for MetricDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricDefinition")
            .field("id", &self.id)
            .field("suffix", &self.suffix)
            .field("default_state", &self.default_state)
            .field("dependencies", &self.dependencies)
            .field("cooldown", &self.cooldown)
            .field("timeout", &self.timeout)
            .field("precision", &self.precision)
            .field("smoothed", &self.smoothed)
            .field("log", &self.log)
            .field("decoder", &self.decoder.is_some())
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

/// A CAN frame id together with the metrics decoded from its payload
#[derive(Debug, Clone)]
pub struct Topic {
    pub id: u32,
    pub name: Option<String>,
    /// Decoded in declaration order; later decoders may read earlier results
    pub metrics: Vec<MetricDefinition>,
}

impl Topic {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            name: None,
            metrics: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_metric(mut self, metric: MetricDefinition) -> Self {
        self.metrics.push(metric);
        self
    }
}

/// Complete signal catalog for one vehicle model
#[derive(Debug, Clone, Default)]
pub struct VehicleDefinition {
    pub name: String,
    pub topics: Vec<Topic>,
    /// Metrics with no topic, driven by dependencies or commands
    pub extra_metrics: Vec<MetricDefinition>,
}

impl VehicleDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topics: Vec::new(),
            extra_metrics: Vec::new(),
        }
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn with_extra_metric(mut self, metric: MetricDefinition) -> Self {
        self.extra_metrics.push(metric);
        self
    }

    /// All metric definitions in registration order: topic metrics first,
    /// then extra metrics.
    pub fn metric_definitions(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.topics
            .iter()
            .flat_map(|topic| topic.metrics.iter())
            .chain(self.extra_metrics.iter())
    }
}

/// Errors that make a catalog unloadable
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error("Duplicate metric id: {0}")]
    DuplicateMetric(String),

    #[error("Duplicate topic: CAN ID 0x{0:X}")]
    DuplicateTopic(u32),

    #[error("Metric {0} has an empty default state")]
    EmptyDefaultState(String),

    #[error("Metric {metric} depends on unknown metric {dependency}")]
    UnknownDependency { metric: String, dependency: String },

    #[error("Dependency cycle between metrics: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
}
