//! The business-logic seam: what a reconcile does to one object.

use std::time::Duration;

use async_trait::async_trait;
use runwarden_core::{ManagedObject, ObjectRef};
use thiserror::Error;
use tracing::{debug, warn};

/// Error reported by a [`Reconciler`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// Expected to clear up on retry. The key is re-enqueued with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// The object cannot make progress. It is marked `Failed` with this
    /// message and not retried.
    #[error("{0}")]
    Permanent(String),
}

impl ReconcileError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result of a successful reconcile.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Desired new state of the object. Only status fields are persisted.
    pub object: ManagedObject,
    /// Related objects whose changes should re-enqueue this one.
    pub watch: Vec<ObjectRef>,
    /// Reconcile again after this delay even if nothing changes.
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    /// Outcome carrying `object` with no watches and no requeue.
    pub fn new(object: ManagedObject) -> Self {
        Self {
            object,
            watch: Vec::new(),
            requeue_after: None,
        }
    }

    /// Watch `child` for changes.
    #[must_use]
    pub fn watching(mut self, child: ObjectRef) -> Self {
        if !self.watch.contains(&child) {
            self.watch.push(child);
        }
        self
    }

    /// Ask to be reconciled again after `delay`.
    #[must_use]
    pub fn requeue_after(mut self, delay: Duration) -> Self {
        self.requeue_after = Some(delay);
        self
    }
}

/// Decides how to advance one object.
///
/// Implementations re-derive what to do from the object's state alone; the
/// reason the key was enqueued is not passed in.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Reconcile one object.
    ///
    /// # Errors
    ///
    /// `Transient` to retry later, `Permanent` to fail the object.
    async fn reconcile(&self, object: &ManagedObject)
    -> Result<ReconcileOutcome, ReconcileError>;
}

/// Reconciler wrapper that logs every call.
pub struct TracingReconciler<R: Reconciler> {
    inner: R,
}

impl<R: Reconciler> TracingReconciler<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: Reconciler> Reconciler for TracingReconciler<R> {
    async fn reconcile(
        &self,
        object: &ManagedObject,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        debug!(kind = %object.kind, key = %object.key, phase = %object.phase, "Reconciling");
        let result = self.inner.reconcile(object).await;
        match &result {
            Ok(outcome) => debug!(
                key = %object.key,
                phase = %outcome.object.phase,
                watches = outcome.watch.len(),
                "Reconcile succeeded"
            ),
            Err(e) => warn!(key = %object.key, error = %e, "Reconcile failed"),
        }
        result
    }
}
