//! Per-signal state machine
//!
//! A [`Metric`] holds the current state of one signal together with the
//! timestamps used for cooldown, smoothing and staleness. It knows nothing
//! about CAN or files; the [`Vehicle`](crate::Vehicle) feeds it and reacts to
//! the returned [`UpdateOutcome`].

use crate::catalog::MetricDefinition;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time over which the smoothed state catches up with a new value.
pub const SMOOTHING_WINDOW: Duration = Duration::from_millis(2000);

/// Result of feeding a value into [`Metric::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Decoder produced nothing
    Ignored,
    /// Value had the wrong number of elements
    Rejected,
    /// Value equals the current state
    Unchanged,
    /// Change arrived inside the cooldown window and was discarded
    Dropped,
    /// State changed; observers must be notified
    Committed,
}

impl UpdateOutcome {
    pub fn is_committed(self) -> bool {
        self == UpdateOutcome::Committed
    }
}

/// Runtime instance of a [`MetricDefinition`]
#[derive(Debug, Clone)]
pub struct Metric {
    index: usize,
    definition: Arc<MetricDefinition>,
    state: Vec<f64>,
    smoothed_state: Option<Vec<f64>>,
    last_update: Option<Instant>,
    last_change: Option<Instant>,
    stale_at: Option<Instant>,
}

impl Metric {
    pub fn new(index: usize, definition: Arc<MetricDefinition>) -> Self {
        let state = definition.default_state.clone();
        let smoothed_state = definition.smoothed.then(|| state.clone());

        Self {
            index,
            definition,
            state,
            smoothed_state,
            last_update: None,
            last_change: None,
            stale_at: None,
        }
    }

    /// Registration index, used as the compact reference in trip logs
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &Arc<MetricDefinition> {
        &self.definition
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    /// First element of the state; every metric has at least one.
    pub fn value(&self) -> f64 {
        self.state.first().copied().unwrap_or_default()
    }

    pub fn smoothed_state(&self) -> Option<&[f64]> {
        self.smoothed_state.as_deref()
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    pub fn last_change(&self) -> Option<Instant> {
        self.last_change
    }

    /// When the pending staleness reset fires, if one is armed
    pub fn stale_at(&self) -> Option<Instant> {
        self.stale_at
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.stale_at.is_some_and(|deadline| deadline <= now)
    }

    /// Restore the default state and clear all timers.
    pub fn reset(&mut self) {
        self.state = self.definition.default_state.clone();
        if self.smoothed_state.is_some() {
            self.smoothed_state = Some(self.definition.default_state.clone());
        }
        self.last_update = None;
        self.last_change = None;
        self.stale_at = None;
    }

    /// Feed a decoded value into the state machine.
    ///
    /// Forced updates bypass the cooldown and do not arm the staleness timer.
    pub fn update(&mut self, new_state: Option<Vec<f64>>, force: bool, now: Instant) -> UpdateOutcome {
        let Some(mut new_state) = new_state else {
            return UpdateOutcome::Ignored;
        };

        if new_state.len() != self.state.len() {
            tracing::warn!(
                target: "vehicle",
                "Rejected state for {}: expected {} values, got {}",
                self.id(),
                self.state.len(),
                new_state.len()
            );
            return UpdateOutcome::Rejected;
        }

        // Non-finite values never compare equal and cannot be written to a trip log
        if new_state.iter().any(|v| !v.is_finite()) {
            tracing::warn!(target: "vehicle", "Rejected non-finite state for {}: {:?}", self.id(), new_state);
            return UpdateOutcome::Rejected;
        }

        if let Some(places) = self.definition.precision {
            for value in new_state.iter_mut() {
                *value = round_to(*value, places);
            }
        }

        if let Some(smoothed) = self.smoothed_state.as_mut() {
            let amount = match self.last_update {
                Some(last) => {
                    (now.saturating_duration_since(last).as_secs_f64()
                        / SMOOTHING_WINDOW.as_secs_f64())
                    .clamp(0.0, 1.0)
                }
                None => 1.0,
            };
            for (current, target) in smoothed.iter_mut().zip(&new_state) {
                *current = lerp(*current, *target, amount);
            }
        }

        if let (Some(timeout), false) = (self.definition.timeout, force) {
            self.stale_at = Some(now + timeout);
        }

        self.last_update = Some(now);

        if new_state == self.state {
            return UpdateOutcome::Unchanged;
        }

        if let (Some(cooldown), false, Some(last_change)) =
            (self.definition.cooldown, force, self.last_change)
        {
            if now.saturating_duration_since(last_change) < cooldown {
                return UpdateOutcome::Dropped;
            }
        }

        self.state = new_state;
        self.last_change = Some(now);
        UpdateOutcome::Committed
    }
}

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

pub fn lerp(start: f64, end: f64, amount: f64) -> f64 {
    (1.0 - amount) * start + amount * end
}
