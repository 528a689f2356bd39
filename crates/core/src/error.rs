//! Core error types for runwarden.
//!
//! All errors are explicit and typed. Nothing in the core panics.

use thiserror::Error;

/// Core error type for object-model operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid key '{input}': {reason}")]
    InvalidKey { input: String, reason: String },

    #[error("invalid phase transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error("start time of {key} is immutable once set")]
    StartTimeImmutable { key: String },
}

impl Error {
    /// Create an invalid key error.
    pub fn invalid_key(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid transition error.
    pub fn invalid_transition(
        key: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            key: key.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a start-time immutability error.
    pub fn start_time_immutable(key: impl Into<String>) -> Self {
        Self::StartTimeImmutable { key: key.into() }
    }
}
