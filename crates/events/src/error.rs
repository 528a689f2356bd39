//! Error types for the object store and its change streams.

use runwarden_core::{Key, ObjectKind, ResourceVersion};
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Optimistic-concurrency check failed: the write was based on a stale version.
    #[error("conflict writing {kind} {key}: expected version {expected}, found {actual}")]
    Conflict {
        kind: ObjectKind,
        key: Key,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },

    #[error("{kind} {key} not found")]
    NotFound { kind: ObjectKind, key: Key },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ObjectKind, key: Key },

    #[error("object store closed")]
    Closed,

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Create a conflict error.
    pub fn conflict(
        kind: ObjectKind,
        key: Key,
        expected: ResourceVersion,
        actual: ResourceVersion,
    ) -> Self {
        Self::Conflict {
            kind,
            key,
            expected,
            actual,
        }
    }

    /// Create a not found error.
    pub fn not_found(kind: ObjectKind, key: Key) -> Self {
        Self::NotFound { kind, key }
    }

    /// Create an already exists error.
    pub fn already_exists(kind: ObjectKind, key: Key) -> Self {
        Self::AlreadyExists { kind, key }
    }

    /// Errors expected to resolve on retry without outside intervention.
    ///
    /// `NotFound` counts because the writer may be acting on a cache that lags
    /// the store.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::NotFound { .. })
    }

    /// Check if this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors surfaced by a change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChangeStreamError {
    /// The subscriber fell behind and missed events; it must relist.
    #[error("change stream lagged, {0} events skipped")]
    Lagged(u64),

    #[error("change stream closed")]
    Closed,
}
