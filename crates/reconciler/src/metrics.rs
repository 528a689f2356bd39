//! Periodic gauges sampled from the object cache.
//!
//! Published gauges:
//!
//! - `objects_by_phase{kind, phase}`: cached objects per phase (every phase,
//!   zero included)
//! - `running_objects{kind}`: objects in `Running`
//! - `work_queue_depth`: keys waiting for a worker
//!
//! Publishing is best-effort: sink failures are logged and the loop carries on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use runwarden_core::Phase;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ObjectCache;
use crate::error::{Error, Result};
use crate::queue::WorkQueue;

pub const OBJECTS_BY_PHASE: &str = "objects_by_phase";
pub const RUNNING_OBJECTS: &str = "running_objects";
pub const WORK_QUEUE_DEPTH: &str = "work_queue_depth";

/// Destination for gauge updates.
pub trait MetricsSink: Send + Sync {
    /// Set gauge `name` with `labels` to `value`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Metrics` if the sample could not be recorded.
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) -> Result<()>;
}

/// Sink that writes every sample to the log at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) -> Result<()> {
        debug!(gauge = name, labels = ?labels, value, "Gauge");
        Ok(())
    }
}

/// Sink that keeps the latest value of every gauge series.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    gauges: Mutex<BTreeMap<String, f64>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest value of a series, e.g. `gauge("running_objects", &[("kind", "PipelineRun")])`.
    #[must_use]
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.lock().get(&series_name(name, labels)).copied()
    }

    /// Every recorded series with its latest value.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.gauges.lock().clone()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) -> Result<()> {
        self.gauges.lock().insert(series_name(name, labels), value);
        Ok(())
    }
}

/// Render `name{k1=v1,k2=v2}`, or just `name` without labels.
fn series_name(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

#[allow(clippy::cast_precision_loss)]
fn as_gauge(count: usize) -> f64 {
    count as f64
}

/// Samples the cache on a fixed interval and publishes gauges.
pub struct MetricsReporter {
    cache: Arc<ObjectCache>,
    queue: Arc<WorkQueue>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(
        cache: Arc<ObjectCache>,
        queue: Arc<WorkQueue>,
        sink: Arc<dyn MetricsSink>,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            queue,
            sink,
            interval,
        }
    }

    /// Publish one sample of every gauge.
    ///
    /// Returns the number of gauges the sink rejected.
    pub fn report_once(&self) -> usize {
        let kind = self.cache.kind().as_str();
        let counts = self.cache.count_by_phase();
        let running = counts.get(&Phase::Running).copied().unwrap_or(0);

        let mut failures = 0_usize;
        let mut publish = |name: &str, labels: &[(&str, &str)], value: f64| {
            if let Err(e) = self.sink.set_gauge(name, labels, value) {
                warn!(gauge = name, error = %e, "Failed to publish gauge");
                failures = failures.saturating_add(1);
            }
        };

        for (phase, count) in &counts {
            publish(
                OBJECTS_BY_PHASE,
                &[("kind", kind), ("phase", phase.as_str())],
                as_gauge(*count),
            );
        }
        publish(RUNNING_OBJECTS, &[("kind", kind)], as_gauge(running));
        publish(WORK_QUEUE_DEPTH, &[], as_gauge(self.queue.len()));

        failures
    }

    /// Publish on every tick until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Metrics reporter started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.report_once();
                }
            }
        }
        debug!("Metrics reporter stopped");
    }
}

/// Sink that rejects every sample. Useful for checking that a broken metrics
/// backend never affects reconciliation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingMetricsSink;

impl MetricsSink for RejectingMetricsSink {
    fn set_gauge(&self, name: &str, _labels: &[(&str, &str)], _value: f64) -> Result<()> {
        Err(Error::metrics(format!("sink rejected {name}")))
    }
}
