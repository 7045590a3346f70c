//! Observability hooks
//!
//! Components never talk to a global registry. They receive an
//! [`ObservabilityContext`] and report through its [`MetricsSink`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

/// Destination for operation counts and durations
pub trait MetricsSink: Send + Sync {
    fn count(&self, name: &'static str, value: u64);

    fn duration(&self, name: &'static str, elapsed: Duration);
}

/// Emits every measurement as a `trace!` event
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn count(&self, name: &'static str, value: u64) {
        trace!(metric = name, value, "count");
    }

    fn duration(&self, name: &'static str, elapsed: Duration) {
        trace!(metric = name, micros = elapsed.as_micros() as u64, "duration");
    }
}

/// Keeps totals in memory so they can be inspected
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    counts: Mutex<HashMap<&'static str, u64>>,
    durations: Mutex<HashMap<&'static str, Vec<Duration>>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_of(&self, name: &str) -> u64 {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(name).copied().unwrap_or(0)
    }

    pub fn samples_of(&self, name: &str) -> usize {
        let durations = self.durations.lock().unwrap_or_else(PoisonError::into_inner);
        durations.get(name).map(Vec::len).unwrap_or(0)
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn count(&self, name: &'static str, value: u64) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry(name).or_insert(0) += value;
    }

    fn duration(&self, name: &'static str, elapsed: Duration) {
        let mut durations = self.durations.lock().unwrap_or_else(PoisonError::into_inner);
        durations.entry(name).or_default().push(elapsed);
    }
}

/// Handle passed to every component that reports measurements
#[derive(Clone)]
pub struct ObservabilityContext {
    sink: Arc<dyn MetricsSink>,
}

impl ObservabilityContext {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        ObservabilityContext { sink }
    }

    pub fn count(&self, name: &'static str, value: u64) {
        self.sink.count(name, value);
    }

    /// Count one call to `name` and record its duration when the guard drops
    pub fn time(&self, name: &'static str) -> OperationTimer {
        self.sink.count(name, 1);
        OperationTimer {
            sink: self.sink.clone(),
            name,
            started: Instant::now(),
        }
    }
}

impl Default for ObservabilityContext {
    fn default() -> Self {
        ObservabilityContext::new(Arc::new(TracingMetricsSink))
    }
}

pub struct OperationTimer {
    sink: Arc<dyn MetricsSink>,
    name: &'static str,
    started: Instant,
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        self.sink.duration(self.name, self.started.elapsed());
    }
}
