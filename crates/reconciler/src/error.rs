//! Error types for the reconciliation engine.

use runwarden_core::Key;
use runwarden_events::{ChangeStreamError, StoreError};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// `arm` was called twice for the same key without a `disarm` in between.
    #[error("timeout for {key} is already armed")]
    AlreadyArmed { key: Key },

    /// A scheduling invariant was broken, e.g. `done` without a matching `get`.
    #[error("invariant violated: {reason}")]
    InvariantViolated { reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("change stream error: {0}")]
    ChangeStream(#[from] ChangeStreamError),

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("metrics sink error: {reason}")]
    Metrics { reason: String },

    /// A background task ended abnormally.
    #[error("task '{task}' failed: {reason}")]
    TaskFailed { task: String, reason: String },
}

impl Error {
    /// Create an already armed error.
    pub fn already_armed(key: Key) -> Self {
        Self::AlreadyArmed { key }
    }

    /// Create an invariant violation error.
    pub fn invariant_violated(reason: impl Into<String>) -> Self {
        Self::InvariantViolated {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a metrics error.
    pub fn metrics(reason: impl Into<String>) -> Self {
        Self::Metrics {
            reason: reason.into(),
        }
    }

    /// Create a task failed error.
    pub fn task_failed(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TaskFailed {
            task: task.into(),
            reason: reason.into(),
        }
    }

    /// Fatal errors mean a scheduling guarantee no longer holds; the engine
    /// must stop rather than continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AlreadyArmed { .. } | Self::InvariantViolated { .. }
        )
    }
}
