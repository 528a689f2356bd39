//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers.
    pub workers: usize,
    /// Fixed run timeout applied to every object from its start time.
    pub timeout_secs: u64,
    /// Interval between metrics samples.
    pub metrics_interval_secs: u64,
    /// How long a dependency watch stays valid without being renewed.
    pub tracker_lease_secs: u64,
    /// Capacity of the channel between the change stream and the cache updater.
    pub change_buffer: usize,
    /// Restrict the engine to one namespace. `None` watches all namespaces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// First retry delay after a transient failure.
    pub backoff_base_ms: u64,
    /// Upper bound on the retry delay.
    pub backoff_max_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            timeout_secs: 3600,
            metrics_interval_secs: 30,
            tracker_lease_secs: 30 * 60,
            change_buffer: 1024,
            namespace: None,
            backoff_base_ms: 5,
            backoff_max_ms: 60_000,
        }
    }
}

impl ControllerConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the run timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Set the metrics interval.
    #[must_use]
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval_secs = interval.as_secs();
        self
    }

    /// Set the dependency watch lease.
    #[must_use]
    pub fn with_tracker_lease(mut self, lease: Duration) -> Self {
        self.tracker_lease_secs = lease.as_secs();
        self
    }

    /// Restrict the engine to a namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the transient-failure backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self.backoff_max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Run timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Metrics interval as a `Duration`.
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    /// Tracker lease as a `Duration`.
    pub fn tracker_lease(&self) -> Duration {
        Duration::from_secs(self.tracker_lease_secs)
    }

    /// Backoff base as a `Duration`.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Backoff cap as a `Duration`.
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Check the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.timeout_secs == 0 {
            return Err(Error::invalid_config("timeout_secs must be positive"));
        }
        if self.metrics_interval_secs == 0 {
            return Err(Error::invalid_config(
                "metrics_interval_secs must be positive",
            ));
        }
        if self.tracker_lease_secs == 0 {
            return Err(Error::invalid_config("tracker_lease_secs must be positive"));
        }
        if self.change_buffer == 0 {
            return Err(Error::invalid_config("change_buffer must be at least 1"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::invalid_config(
                "backoff_base_ms must not exceed backoff_max_ms",
            ));
        }
        if self.namespace.as_deref() == Some("") {
            return Err(Error::invalid_config("namespace must not be empty"));
        }
        Ok(())
    }
}
