//! Metric registry, CAN dispatch and change propagation
//!
//! The [`Vehicle`] owns every [`Metric`] created from the loaded catalog. All
//! state mutation funnels through it so that observers run in a fixed order:
//!
//! 1. debug echo for metrics flagged with `log`
//! 2. the update broadcast (transport fan-out)
//! 3. the trip recorder
//! 4. the metric's change hook
//! 5. dependents, recursively, in registration order
//!
//! Steps 3 to 5 are skipped while a trip is being replayed.

use crate::catalog::{CatalogError, MetricDefinition, VehicleDefinition};
use crate::command::{Command, CommandError};
use crate::graph::DependencyGraph;
use crate::metric::{Metric, UpdateOutcome};
use crate::source::CanFrame;
use crate::trip::{Keyframe, TripRecorder};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the update broadcast channel
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// A committed state change, as sent to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricUpdate {
    pub index: usize,
    pub state: Vec<f64>,
}

impl MetricUpdate {
    /// Compact wire form: `[index,[values...]]`
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&(self.index, &self.state))
    }
}

/// Read-only view over all metrics, handed to decoders and hooks
#[derive(Clone, Copy)]
pub struct MetricView<'a> {
    metrics: &'a [Metric],
    index: &'a HashMap<String, usize>,
}

impl<'a> MetricView<'a> {
    pub fn get(&self, id: &str) -> Option<&'a Metric> {
        let metrics = self.metrics;
        self.index.get(id).map(|&i| &metrics[i])
    }

    pub fn state(&self, id: &str) -> Option<&'a [f64]> {
        self.get(id).map(Metric::state)
    }

    /// First element of a metric's state
    pub fn value(&self, id: &str) -> Option<f64> {
        self.get(id).map(Metric::value)
    }

    pub fn by_index(&self, index: usize) -> Option<&'a Metric> {
        self.metrics.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Metric> {
        self.metrics.iter()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Runtime model of one vehicle: its metrics and everything observing them
pub struct Vehicle {
    name: String,
    metrics: Vec<Metric>,
    index: HashMap<String, usize>,
    topics: HashMap<u32, Arc<[usize]>>,
    graph: DependencyGraph,
    updates_tx: broadcast::Sender<MetricUpdate>,
    recorder: Option<TripRecorder>,
    replaying: bool,
    pending_commands: Vec<Command>,
}

impl Vehicle {
    /// Create a vehicle with no metrics registered
    pub fn new() -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            name: String::new(),
            metrics: Vec::new(),
            index: HashMap::new(),
            topics: HashMap::new(),
            graph: DependencyGraph::default(),
            updates_tx,
            recorder: None,
            replaying: false,
            pending_commands: Vec::new(),
        }
    }

    pub fn from_definition(definition: VehicleDefinition) -> Result<Self, CatalogError> {
        let mut vehicle = Self::new();
        vehicle.load_definition(definition)?;
        Ok(vehicle)
    }

    /// Replace every metric with fresh instances from `definition`.
    ///
    /// The catalog is fully validated before anything is swapped, so a
    /// rejected catalog leaves the current metrics untouched. Subscribers
    /// survive a reload; metric identities and an open recording do not.
    pub fn load_definition(&mut self, definition: VehicleDefinition) -> Result<(), CatalogError> {
        info!(target: "vehicle", "Loading definition: {} ...", definition.name);

        let mut definitions: Vec<Arc<MetricDefinition>> = Vec::new();
        let mut index = HashMap::new();
        let mut topics = HashMap::new();

        let VehicleDefinition {
            name,
            topics: topic_defs,
            extra_metrics,
        } = definition;

        let mut register = |def: MetricDefinition| -> Result<usize, CatalogError> {
            if def.default_state.is_empty() {
                return Err(CatalogError::EmptyDefaultState(def.id));
            }
            if index.contains_key(&def.id) {
                return Err(CatalogError::DuplicateMetric(def.id));
            }
            let idx = definitions.len();
            index.insert(def.id.clone(), idx);
            definitions.push(Arc::new(def));
            Ok(idx)
        };

        for topic in topic_defs {
            let members = topic
                .metrics
                .into_iter()
                .map(&mut register)
                .collect::<Result<Vec<usize>, _>>()?;

            if topics.insert(topic.id, Arc::<[usize]>::from(members)).is_some() {
                return Err(CatalogError::DuplicateTopic(topic.id));
            }
        }

        for def in extra_metrics {
            register(def)?;
        }

        let graph = DependencyGraph::build(&definitions, &index)?;

        if let Some(recorder) = self.recorder.take() {
            info!(target: "trip", "Closing {} before reload", recorder.path().display());
            recorder.close();
        }

        self.metrics = definitions
            .into_iter()
            .enumerate()
            .map(|(i, def)| {
                debug!(target: "vehicle", "Registered metric: {}", def.id);
                Metric::new(i, def)
            })
            .collect();
        self.name = name;
        self.index = index;
        self.topics = topics;
        self.graph = graph;
        self.pending_commands.clear();

        info!(
            target: "vehicle",
            "Loaded {} with {} metrics across {} topics",
            self.name,
            self.metrics.len(),
            self.topics.len()
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn metric(&self, id: &str) -> Option<&Metric> {
        self.index.get(id).map(|&i| &self.metrics[i])
    }

    /// Metric ids in registration order
    pub fn metric_ids(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.id().to_string()).collect()
    }

    /// Current state of every metric, in index order
    pub fn snapshot(&self) -> Vec<MetricUpdate> {
        self.metrics
            .iter()
            .map(|m| MetricUpdate {
                index: m.index(),
                state: m.state().to_vec(),
            })
            .collect()
    }

    pub fn view(&self) -> MetricView<'_> {
        MetricView {
            metrics: &self.metrics,
            index: &self.index,
        }
    }

    /// Subscribe to committed changes
    pub fn subscribe(&self) -> broadcast::Receiver<MetricUpdate> {
        self.updates_tx.subscribe()
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }

    /// Commands emitted by change hooks since the last call
    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.pending_commands)
    }

    /// Decode a raw CAN frame into every metric of its topic.
    ///
    /// Frames with no matching topic are ignored.
    pub fn handle_frame(&mut self, frame: &CanFrame, now: Instant) {
        let Some(members) = self.topics.get(&frame.id).cloned() else {
            return;
        };

        for &idx in members.iter() {
            let next = {
                let metric = &self.metrics[idx];
                metric
                    .definition()
                    .decode(Some(frame.data.as_slice()), &self.view(), metric.state())
            };
            self.update_metric(idx, next, false, now);
        }
    }

    /// Feed a value into one metric and notify observers if it commits.
    pub fn update_metric(
        &mut self,
        index: usize,
        new_state: Option<Vec<f64>>,
        force: bool,
        now: Instant,
    ) -> UpdateOutcome {
        let Some(metric) = self.metrics.get_mut(index) else {
            return UpdateOutcome::Ignored;
        };

        let outcome = metric.update(new_state, force, now);
        if outcome.is_committed() {
            self.notify(index, now);
        }
        outcome
    }

    /// Force a metric to a state, as the `metric set` command does.
    pub fn set_metric(
        &mut self,
        id: &str,
        state: Vec<f64>,
        now: Instant,
    ) -> Result<UpdateOutcome, CommandError> {
        let index = *self
            .index
            .get(id)
            .ok_or_else(|| CommandError::UnknownMetric(id.to_string()))?;

        let expected = self.metrics[index].state().len();
        if state.len() != expected {
            return Err(CommandError::Arity {
                metric: id.to_string(),
                expected,
                got: state.len(),
            });
        }

        Ok(self.update_metric(index, Some(state), true, now))
    }

    /// Force-apply a replayed keyframe. Unknown metric ids are skipped so
    /// logs stay replayable against newer catalogs.
    pub fn apply_keyframe(&mut self, keyframe: &Keyframe, now: Instant) -> UpdateOutcome {
        match self.index.get(&keyframe.metric_id) {
            Some(&index) => self.update_metric(index, Some(keyframe.values.clone()), true, now),
            None => {
                debug!(target: "trip", "Skipping keyframe for unknown metric {}", keyframe.metric_id);
                UpdateOutcome::Ignored
            }
        }
    }

    /// Reset one metric to its default and notify observers unconditionally.
    pub fn reset_metric(&mut self, index: usize, now: Instant) {
        if let Some(metric) = self.metrics.get_mut(index) {
            metric.reset();
            self.notify(index, now);
        }
    }

    /// Reset every metric whose staleness deadline has passed.
    pub fn expire_stale(&mut self, now: Instant) -> usize {
        let stale: Vec<usize> = self
            .metrics
            .iter()
            .filter(|m| m.is_stale(now))
            .map(Metric::index)
            .collect();

        for &index in &stale {
            debug!(target: "vehicle", "{} timed out", self.metrics[index].id());
            self.reset_metric(index, now);
        }
        stale.len()
    }

    /// Earliest pending staleness deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.metrics.iter().filter_map(Metric::stale_at).min()
    }

    /// Start recording to `path`, closing any previous recording first.
    ///
    /// Every metric's current state is written immediately so playback can
    /// start from a complete snapshot.
    pub fn start_recording(&mut self, path: &Path, now: Instant) -> std::io::Result<()> {
        self.stop_recording();

        let mut recorder = TripRecorder::create(path, &self.metric_ids(), now)?;
        for metric in &self.metrics {
            recorder.record(metric.index(), metric.state(), now);
        }
        self.recorder = Some(recorder);
        Ok(())
    }

    pub fn stop_recording(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            recorder.close();
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn recorder(&self) -> Option<&TripRecorder> {
        self.recorder.as_ref()
    }

    fn notify(&mut self, index: usize, now: Instant) {
        let metric = &self.metrics[index];
        let definition = Arc::clone(metric.definition());
        let state = metric.state().to_vec();

        if definition.log {
            info!(target: "vehicle", "{}: {:?}", definition.id, state);
        }

        // No receivers is fine; nobody is watching yet
        let _ = self.updates_tx.send(MetricUpdate {
            index,
            state: state.clone(),
        });

        if self.replaying {
            return;
        }

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(index, &state, now);
        }

        if definition.has_hook() {
            let commands = definition.changed(&state, &self.view());
            self.pending_commands.extend(commands);
        }

        let dependents = self.graph.dependents(index).to_vec();
        for dependent in dependents {
            let next = {
                let metric = &self.metrics[dependent];
                metric.definition().decode(None, &self.view(), metric.state())
            };
            self.update_metric(dependent, next, false, now);
        }
    }
}

impl Default for Vehicle {
    fn default() -> Self {
        Self::new()
    }
}
