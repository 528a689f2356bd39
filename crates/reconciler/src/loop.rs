//! The reconcile loop: workers pulling keys and driving objects through their
//! lifecycle.
//!
//! Per dequeued key:
//!
//! 1. Load the object from the cache. A miss means it was deleted: drop its
//!    timeout, watches and backoff state.
//! 2. Terminal objects are skipped without a store write.
//! 3. A timeout-triggered item forces `TimedOut` without calling the
//!    reconciler.
//! 4. Otherwise call the [`Reconciler`] and persist its status through the
//!    store's optimistic concurrency. A version conflict re-enqueues at once,
//!    other transient failures back off, permanent failures mark the object
//!    `Failed`.
//! 5. Arm the timeout on entering `Running`; disarm and unwatch on reaching a
//!    terminal phase.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use runwarden_core::{
    EnqueueReason, GenericResultExt, Key, ManagedObject, ObjectKind, ObjectRef, Phase, WorkItem,
};
use runwarden_events::{ChangeEvent, ObjectStore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::cache::ObjectCache;
use crate::clock::{Clock, SystemClock};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::informer::Informer;
use crate::metrics::{MetricsReporter, MetricsSink, TracingMetricsSink};
use crate::queue::WorkQueue;
use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
use crate::timeout::TimeoutSupervisor;
use crate::tracker::DependencyTracker;

/// Reconcile engine for one primary kind and its child kinds.
///
/// Cheap to clone; clones share every component.
#[derive(Clone)]
pub struct Controller {
    store: Arc<dyn ObjectStore>,
    reconciler: Arc<dyn Reconciler>,
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    primary: Arc<ObjectCache>,
    children: Arc<HashMap<ObjectKind, Arc<ObjectCache>>>,
    queue: Arc<WorkQueue>,
    tracker: Arc<DependencyTracker>,
    timeouts: Arc<TimeoutSupervisor>,
    metrics: Arc<dyn MetricsSink>,
}

/// Handle for code outside the engine that wants a key reconciled.
#[derive(Clone)]
pub struct ControllerHandle {
    queue: Arc<WorkQueue>,
}

impl ControllerHandle {
    /// Enqueue `key`. Returns `false` if it was already pending or the engine
    /// is shutting down.
    pub fn enqueue(&self, key: Key, reason: EnqueueReason) -> bool {
        self.queue.enqueue(key, reason)
    }
}

impl Controller {
    /// Start building a controller.
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Cache of the primary kind.
    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.primary
    }

    /// Cache of a child kind.
    pub fn child_cache(&self, kind: &ObjectKind) -> Option<&Arc<ObjectCache>> {
        self.children.get(kind)
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn tracker(&self) -> &Arc<DependencyTracker> {
        &self.tracker
    }

    pub fn timeouts(&self) -> &Arc<TimeoutSupervisor> {
        &self.timeouts
    }

    /// Run the engine until `cancel` fires or a fatal error occurs.
    ///
    /// Starts the informers and waits for their initial sync, recovers
    /// timeouts of running objects, then runs the workers, the timeout timer
    /// and the metrics reporter. On cancellation the work queue is drained
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error (a broken scheduling invariant, a closed
    /// change stream, a failed initial listing or a crashed task).
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let engine = cancel.child_token();
        info!(
            kind = %self.primary.kind(),
            children = self.children.len(),
            workers = self.config.workers,
            namespace = ?self.config.namespace,
            "Starting controller"
        );

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        // Children first, so owner lookups are warm when parents reconcile.
        let caches = self
            .children
            .values()
            .cloned()
            .chain(std::iter::once(Arc::clone(&self.primary)));
        for cache in caches {
            let informer = Informer::new(Arc::clone(&self.store), cache, self.config.change_buffer)
                .with_namespace(self.config.namespace.clone());
            let handle = match informer.start(engine.clone()).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!(error = %e, "Informer failed to sync");
                    engine.cancel();
                    tasks.shutdown().await;
                    return Err(e);
                }
            };
            tasks.spawn(async move {
                handle
                    .await
                    .map_err(|e| Error::task_failed("informer", e.to_string()))?
            });
        }

        let recovery = self.timeouts.recover(self.primary.list().iter());
        if !recovery.expired.is_empty() {
            warn!(
                expired = recovery.expired.len(),
                "Objects exceeded their timeout while the controller was down"
            );
        }

        tasks.spawn({
            let timeouts = Arc::clone(&self.timeouts);
            let cancel = engine.clone();
            async move {
                timeouts.run(cancel).await;
                Ok(())
            }
        });

        tasks.spawn({
            let reporter = MetricsReporter::new(
                Arc::clone(&self.primary),
                Arc::clone(&self.queue),
                Arc::clone(&self.metrics),
                self.config.metrics_interval(),
            );
            let cancel = engine.clone();
            async move {
                reporter.run(cancel).await;
                Ok(())
            }
        });

        for worker in 0..self.config.workers {
            let controller = self.clone();
            tasks.spawn(async move { controller.work(worker).await });
        }

        tasks.spawn({
            let queue = Arc::clone(&self.queue);
            let cancel = engine.clone();
            async move {
                cancel.cancelled().await;
                queue.shutdown().await;
                Ok(())
            }
        });

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| Error::task_failed("controller", e.to_string()))
                .and_then(|r| r);
            if let Err(e) = result {
                if failure.is_none() {
                    error!(error = %e, "Controller stopping on fatal error");
                    engine.cancel();
                    failure = Some(e);
                }
            }
        }

        info!(kind = %self.primary.kind(), "Controller stopped");
        failure.map_or(Ok(()), Err)
    }

    async fn work(&self, worker: usize) -> Result<()> {
        debug!(worker, "Worker started");
        while self.process_next().await? {}
        debug!(worker, "Worker stopped");
        Ok(())
    }

    /// Take one key off the queue and reconcile it.
    ///
    /// Returns `Ok(false)` once the queue has shut down.
    ///
    /// # Errors
    ///
    /// Only fatal errors are returned; everything else is logged and retried.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(item) = self.queue.get().await else {
            return Ok(false);
        };

        let result = self.reconcile_item(&item).await;
        let done = self.queue.done(&item.key);

        match result {
            Err(e) if e.is_fatal() => {
                error!(key = %item.key, error = %e, "Scheduling invariant violated");
                return Err(e);
            }
            Err(e) => {
                let delay = self.queue.backoff_delay(&item.key);
                warn!(
                    key = %item.key,
                    error = %e,
                    retry_ms = delay.as_millis(),
                    "Reconcile failed, retrying"
                );
                self.queue
                    .enqueue_after(item.key.clone(), EnqueueReason::Requeue, delay);
            }
            Ok(()) => {}
        }

        done.tap_err(|e| error!(key = %item.key, error = %e, "Work queue invariant violated"))?;
        Ok(true)
    }

    async fn reconcile_item(&self, item: &WorkItem) -> Result<()> {
        let key = &item.key;
        trace!(key = %key, reasons = ?item.reasons, "Processing");

        let Some(obj) = self.primary.get(key) else {
            debug!(key = %key, "Object gone, cleaning up");
            self.release(key);
            return Ok(());
        };

        if obj.phase.is_terminal() {
            trace!(key = %key, phase = %obj.phase, "Terminal, nothing to do");
            self.release(key);
            return Ok(());
        }

        if obj.phase == Phase::Running {
            if item.is_timeout() {
                return self.time_out(obj).await;
            }
            if self.ensure_armed(&obj)? {
                return self.time_out(obj).await;
            }
        }

        let outcome = match self.reconciler.reconcile(&obj).await {
            Ok(outcome) => outcome,
            Err(ReconcileError::Transient(reason)) => {
                let delay = self.queue.backoff_delay(key);
                warn!(
                    key = %key,
                    reason = %reason,
                    retry_ms = delay.as_millis(),
                    "Transient reconcile failure"
                );
                self.queue
                    .enqueue_after(key.clone(), EnqueueReason::Requeue, delay);
                return Ok(());
            }
            Err(ReconcileError::Permanent(reason)) => {
                warn!(key = %key, reason = %reason, "Reconcile failed permanently");
                return self.fail(obj, reason).await;
            }
        };

        self.apply_outcome(obj, outcome).await
    }

    async fn apply_outcome(&self, obj: ManagedObject, outcome: ReconcileOutcome) -> Result<()> {
        let key = obj.key.clone();
        let ReconcileOutcome {
            object: mut next,
            watch,
            requeue_after,
        } = outcome;

        if next.kind != obj.kind || next.key != obj.key {
            return self
                .fail(obj, "reconciler returned a different object".to_string())
                .await;
        }
        if !obj.phase.can_transition_to(next.phase) {
            let reason = format!("invalid phase transition {} -> {}", obj.phase, next.phase);
            return self.fail(obj, reason).await;
        }

        let now = self.clock.now();
        stamp_times(&obj, &mut next, now);

        if status_changed(&obj, &next) {
            let Some(stored) = self.persist(next, EnqueueReason::Requeue).await? else {
                return Ok(());
            };
            next = stored;
        }

        if obj.phase == Phase::Pending && next.phase == Phase::Running {
            // The write proved the stored object was pending, so any deadline
            // or watch still held belongs to an earlier object of this key
            // whose delete merged with the re-add.
            if self.timeouts.disarm(&key) {
                info!(key = %key, "Object was recreated, dropping state of the previous one");
                self.tracker.unwatch(&key);
            }
            let start = next.start_time.unwrap_or(now);
            self.timeouts.arm(key.clone(), self.timeouts.deadline_for(start))?;
        }

        if next.phase.is_terminal() {
            info!(key = %key, phase = %next.phase, "Reached terminal phase");
            self.release(&key);
            return Ok(());
        }

        for child in watch {
            self.watch_child(&next, child);
        }
        self.queue.forget(&key);
        if let Some(delay) = requeue_after {
            self.queue.enqueue_after(key, EnqueueReason::Requeue, delay);
        }
        Ok(())
    }

    /// Make sure a running object has a deadline. Returns `true` if its
    /// deadline has already passed.
    fn ensure_armed(&self, obj: &ManagedObject) -> Result<bool> {
        if self.timeouts.is_armed(&obj.key) {
            return Ok(false);
        }
        let now = self.clock.now();
        let deadline = self.timeouts.deadline_for(obj.start_time.unwrap_or(now));
        if deadline <= now {
            return Ok(true);
        }
        debug!(key = %obj.key, deadline = %deadline, "Arming timeout for running object");
        self.timeouts.arm(obj.key.clone(), deadline)?;
        Ok(false)
    }

    async fn time_out(&self, obj: ManagedObject) -> Result<()> {
        let key = obj.key.clone();
        let mut next = obj;
        next.phase = Phase::TimedOut;
        next.completion_time = Some(self.clock.now());
        next.message = Some(format!(
            "exceeded run timeout of {}s",
            self.timeouts.timeout().as_secs()
        ));

        // A conflict must retry the timeout, not a normal reconcile.
        if self.persist(next, EnqueueReason::Timeout).await?.is_some() {
            warn!(key = %key, "Timed out");
            self.release(&key);
        }
        Ok(())
    }

    async fn fail(&self, obj: ManagedObject, reason: String) -> Result<()> {
        let key = obj.key.clone();
        let mut next = obj;
        next.phase = Phase::Failed;
        next.completion_time = Some(self.clock.now());
        next.message = Some(reason);

        if self.persist(next, EnqueueReason::Requeue).await?.is_some() {
            self.release(&key);
        }
        Ok(())
    }

    /// Write status. Returns `None` if the write was rejected and the key
    /// re-enqueued.
    async fn persist(
        &self,
        next: ManagedObject,
        retry: EnqueueReason,
    ) -> Result<Option<ManagedObject>> {
        let key = next.key.clone();
        match self.store.update_status(next).await {
            Ok(stored) => {
                debug!(
                    key = %key,
                    phase = %stored.phase,
                    version = %stored.resource_version,
                    "Status persisted"
                );
                Ok(Some(stored))
            }
            Err(e) if e.is_conflict() => {
                debug!(key = %key, error = %e, "Stale version, requeueing");
                self.queue.enqueue(key, retry);
                Ok(None)
            }
            // The cache lags a delete; once the Deleted event lands the
            // retried key misses the cache.
            Err(e) if e.is_transient() => {
                let delay = self.queue.backoff_delay(&key);
                debug!(
                    key = %key,
                    error = %e,
                    retry_ms = delay.as_millis(),
                    "Object missing from store, requeueing"
                );
                self.queue.enqueue_after(key, retry, delay);
                Ok(None)
            }
            Err(e) => {
                let delay = self.queue.backoff_delay(&key);
                warn!(
                    key = %key,
                    error = %e,
                    retry_ms = delay.as_millis(),
                    "Status write failed"
                );
                self.queue.enqueue_after(key, retry, delay);
                Ok(None)
            }
        }
    }

    /// Register a watch if `child` names `parent` among its owners.
    ///
    /// Children not yet in the cache are accepted; the reconciler has usually
    /// just created them.
    fn watch_child(&self, parent: &ManagedObject, child: ObjectRef) {
        let Some(cache) = self.children.get(&child.kind) else {
            debug!(parent = %parent.key, child = %child, "No cache for child kind, not watching");
            return;
        };
        let owner = parent.object_ref();
        let qualifies = cache
            .get(&child.key)
            .is_none_or(|cached| cached.is_owned_by(&owner));
        if qualifies {
            self.tracker.watch(parent.key.clone(), child);
        } else {
            debug!(parent = %parent.key, child = %child, "Child not owned by parent, not watching");
        }
    }

    /// Drop everything the engine holds for `key`.
    fn release(&self, key: &Key) {
        self.timeouts.disarm(key);
        self.tracker.unwatch(key);
        self.queue.forget(key);
    }
}

/// Keep `start_time` immutable and fill in the lifecycle timestamps.
fn stamp_times(obj: &ManagedObject, next: &mut ManagedObject, now: DateTime<Utc>) {
    if let Some(original) = obj.start_time {
        if next.start_time != Some(original) {
            if next.start_time.is_some() {
                warn!(key = %obj.key, "Start time is immutable, keeping the recorded one");
            }
            next.start_time = Some(original);
        }
    }
    if next.phase == Phase::Running && next.start_time.is_none() {
        next.start_time = Some(now);
    }
    if next.phase.is_terminal() && next.completion_time.is_none() {
        next.completion_time = Some(now);
    }
}

fn status_changed(before: &ManagedObject, after: &ManagedObject) -> bool {
    before.phase != after.phase
        || before.start_time != after.start_time
        || before.completion_time != after.completion_time
        || before.message != after.message
        || before.status != after.status
        || before.resource_version != after.resource_version
}

/// Builder for [`Controller`].
pub struct ControllerBuilder {
    store: Option<Arc<dyn ObjectStore>>,
    reconciler: Option<Arc<dyn Reconciler>>,
    primary: Option<ObjectKind>,
    children: Vec<ObjectKind>,
    config: ControllerConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            reconciler: None,
            primary: None,
            children: Vec::new(),
            config: ControllerConfig::default(),
            metrics: None,
            clock: None,
        }
    }

    /// Set the object store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the business logic.
    #[must_use]
    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Set the kind this controller reconciles.
    #[must_use]
    pub fn for_kind(mut self, kind: impl Into<ObjectKind>) -> Self {
        self.primary = Some(kind.into());
        self
    }

    /// Also watch a child kind; its changes re-enqueue their owners.
    #[must_use]
    pub fn owns(mut self, kind: impl Into<ObjectKind>) -> Self {
        let kind = kind.into();
        if !self.children.contains(&kind) {
            self.children.push(kind);
        }
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the controller and wire its components together.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the store, reconciler or primary kind is
    /// missing, a child kind equals the primary kind, or the config does not
    /// validate.
    pub fn build(self) -> Result<Controller> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| Error::invalid_config("object store is required"))?;
        let reconciler = self
            .reconciler
            .ok_or_else(|| Error::invalid_config("reconciler is required"))?;
        let primary_kind = self
            .primary
            .ok_or_else(|| Error::invalid_config("primary kind is required"))?;
        if self.children.contains(&primary_kind) {
            return Err(Error::invalid_config(format!(
                "{primary_kind} cannot own itself"
            )));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let queue = Arc::new(WorkQueue::with_backoff(
            self.config.backoff_base(),
            self.config.backoff_max(),
        ));
        let tracker = Arc::new(DependencyTracker::new(self.config.tracker_lease()));
        let timeouts = Arc::new(TimeoutSupervisor::new(
            self.config.timeout(),
            Arc::clone(&clock),
        ));

        let primary = Arc::new(ObjectCache::new(primary_kind.clone()));
        primary.on_change(primary_listener(Arc::clone(&queue)));

        let children: HashMap<ObjectKind, Arc<ObjectCache>> = self
            .children
            .into_iter()
            .map(|kind| {
                let cache = Arc::new(ObjectCache::new(kind.clone()));
                cache.on_change(child_listener(
                    Arc::downgrade(&cache),
                    primary_kind.clone(),
                    Arc::clone(&queue),
                    Arc::clone(&tracker),
                ));
                (kind, cache)
            })
            .collect();

        timeouts.on_expire({
            let queue = Arc::clone(&queue);
            Arc::new(move |key| {
                queue.enqueue(key, EnqueueReason::Timeout);
            })
        });

        Ok(Controller {
            store,
            reconciler,
            config: self.config,
            clock,
            primary,
            children: Arc::new(children),
            queue,
            tracker,
            timeouts,
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(TracingMetricsSink)),
        })
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Every change to a primary object, deletes included, enqueues it.
fn primary_listener(queue: Arc<WorkQueue>) -> crate::cache::ChangeListener {
    Arc::new(move |event: &ChangeEvent| {
        queue.enqueue(event.key().clone(), EnqueueReason::WatchEvent);
    })
}

/// A child change enqueues every parent watching it plus every owner of the
/// primary kind. A deleted child is resolved one last time, then forgotten.
fn child_listener(
    cache: Weak<ObjectCache>,
    primary_kind: ObjectKind,
    queue: Arc<WorkQueue>,
    tracker: Arc<DependencyTracker>,
) -> crate::cache::ChangeListener {
    Arc::new(move |event: &ChangeEvent| {
        let child = event.object().object_ref();
        let watchers = tracker.resolve_parents(&child);

        let owners = if event.is_delete() {
            tracker.forget_child(&child);
            event.object().owner_refs.clone()
        } else {
            cache
                .upgrade()
                .map(|cache| cache.owners_of(event.key()))
                .unwrap_or_default()
        };
        let parents = watchers.into_iter().chain(
            owners
                .into_iter()
                .filter(|owner| owner.kind == primary_kind)
                .map(|owner| owner.key),
        );

        for parent in parents.unique() {
            trace!(child = %child, parent = %parent, "Child changed, enqueueing parent");
            queue.enqueue(parent, EnqueueReason::DependencyChange);
        }
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use runwarden_events::InMemoryObjectStore;

    /// Pending -> Running -> Succeeded, counting calls.
    #[derive(Default)]
    struct TwoStep {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Reconciler for TwoStep {
        async fn reconcile(
            &self,
            object: &ManagedObject,
        ) -> std::result::Result<ReconcileOutcome, ReconcileError> {
            *self.calls.lock() += 1;
            let mut next = object.clone();
            next.phase = match object.phase {
                Phase::Pending => Phase::Running,
                _ => Phase::Succeeded,
            };
            Ok(ReconcileOutcome::new(next))
        }
    }

    struct Failing(ReconcileError);

    #[async_trait]
    impl Reconciler for Failing {
        async fn reconcile(
            &self,
            _object: &ManagedObject,
        ) -> std::result::Result<ReconcileOutcome, ReconcileError> {
            Err(self.0.clone())
        }
    }

    struct Fixture {
        store: Arc<InMemoryObjectStore>,
        controller: Controller,
        clock: ManualClock,
    }

    fn fixture(reconciler: Arc<dyn Reconciler>) -> Fixture {
        let store = InMemoryObjectStore::new_arc();
        let clock = ManualClock::new(Utc::now());
        let controller = Controller::builder()
            .with_store(store.clone())
            .with_reconciler(reconciler)
            .for_kind("PipelineRun")
            .owns("StepRun")
            .with_clock(Arc::new(clock.clone()))
            .build()
            .expect("build");
        Fixture {
            store,
            controller,
            clock,
        }
    }

    impl Fixture {
        /// Create in the store and feed the result to the cache, as the
        /// informer would.
        async fn create(&self, obj: ManagedObject) -> ManagedObject {
            let stored = self.store.create(obj).await.expect("create");
            self.observe(ChangeEvent::Added(stored.clone()));
            stored
        }

        fn observe(&self, event: ChangeEvent) {
            let cache = if event.kind() == self.controller.cache().kind() {
                self.controller.cache()
            } else {
                self.controller.child_cache(event.kind()).expect("child cache")
            };
            cache.apply(event);
        }

        async fn refresh(&self, key: &Key) -> ManagedObject {
            let kind = self.controller.cache().kind().clone();
            let obj = self.store.get(&kind, key).await.expect("get");
            self.observe(ChangeEvent::Updated(obj.clone()));
            obj
        }
    }

    fn run_key(name: &str) -> Key {
        Key::new("ci", name)
    }

    #[tokio::test]
    async fn test_build_requires_store() {
        let result = Controller::builder()
            .with_reconciler(Arc::new(TwoStep::default()))
            .for_kind("PipelineRun")
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_build_rejects_self_ownership() {
        let result = Controller::builder()
            .with_store(InMemoryObjectStore::new_arc())
            .with_reconciler(Arc::new(TwoStep::default()))
            .for_kind("PipelineRun")
            .owns("PipelineRun")
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pending_to_running_arms_timeout() {
        let fx = fixture(Arc::new(TwoStep::default()));
        fx.create(ManagedObject::new("PipelineRun", run_key("r"))).await;

        assert!(fx.controller.process_next().await.expect("process"));

        let stored = fx.refresh(&run_key("r")).await;
        assert_eq!(stored.phase, Phase::Running);
        assert_eq!(stored.start_time, Some(fx.clock.now()));
        let timeout = chrono::Duration::from_std(fx.controller.config().timeout()).expect("fits");
        assert_eq!(
            fx.controller.timeouts().deadline_of(&run_key("r")),
            Some(fx.clock.now() + timeout)
        );
    }

    #[tokio::test]
    async fn test_terminal_transition_disarms_and_stamps_completion() {
        let fx = fixture(Arc::new(TwoStep::default()));
        fx.create(ManagedObject::new("PipelineRun", run_key("r"))).await;
        fx.controller.process_next().await.expect("to running");
        fx.refresh(&run_key("r")).await;
        fx.clock.advance(chrono::Duration::seconds(5));
        fx.controller.process_next().await.expect("to succeeded");

        let stored = fx.refresh(&run_key("r")).await;
        assert_eq!(stored.phase, Phase::Succeeded);
        assert_eq!(stored.completion_time, Some(fx.clock.now()));
        assert!(!fx.controller.timeouts().is_armed(&run_key("r")));
    }

    #[tokio::test]
    async fn test_permanent_error_marks_failed_with_message() {
        let fx = fixture(Arc::new(Failing(ReconcileError::permanent("bad pipeline spec"))));
        fx.create(ManagedObject::new("PipelineRun", run_key("r"))).await;

        fx.controller.process_next().await.expect("process");

        let stored = fx.refresh(&run_key("r")).await;
        assert_eq!(stored.phase, Phase::Failed);
        assert_eq!(stored.message.as_deref(), Some("bad pipeline spec"));
        // The refresh above enqueued a watch event; it must be a no-op.
        let writes = fx.store.writes();
        fx.controller.process_next().await.expect("noop");
        assert_eq!(fx.store.writes(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_backs_off_without_write() {
        let fx = fixture(Arc::new(Failing(ReconcileError::transient("registry busy"))));
        fx.create(ManagedObject::new("PipelineRun", run_key("r"))).await;
        let writes = fx.store.writes();

        fx.controller.process_next().await.expect("process");

        assert_eq!(fx.store.writes(), writes);
        assert_eq!(fx.controller.queue().failures(&run_key("r")), 1);
        assert!(!fx.controller.queue().is_pending(&run_key("r")));
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(fx.controller.queue().is_pending(&run_key("r")));
    }

    #[tokio::test]
    async fn test_timeout_item_forces_timed_out_without_reconciler() {
        let reconciler = Arc::new(TwoStep::default());
        let fx = fixture(reconciler.clone());
        fx.create(ManagedObject::new("PipelineRun", run_key("r"))).await;
        fx.controller.process_next().await.expect("to running");
        fx.refresh(&run_key("r")).await;
        assert_eq!(*reconciler.calls.lock(), 1);

        // Merges with the pending watch event; the timeout still wins.
        fx.controller
            .queue()
            .enqueue(run_key("r"), EnqueueReason::Timeout);
        fx.controller.process_next().await.expect("timeout");

        let stored = fx.refresh(&run_key("r")).await;
        assert_eq!(stored.phase, Phase::TimedOut);
        assert!(stored.message.is_some());
        assert_eq!(*reconciler.calls.lock(), 1);
        assert!(!fx.controller.timeouts().is_armed(&run_key("r")));
    }

    #[tokio::test]
    async fn test_child_update_enqueues_owner_once() {
        let fx = fixture(Arc::new(TwoStep::default()));
        let parent = ObjectRef::new("PipelineRun", run_key("p"));
        let child = fx
            .create(ManagedObject::new("StepRun", Key::new("ci", "p-step-0")).with_owner(parent))
            .await;

        for bump in 1..=3_u64 {
            let mut updated = child.clone();
            updated.resource_version = runwarden_core::ResourceVersion::new(
                child.resource_version.as_u64() + bump,
            );
            fx.observe(ChangeEvent::Updated(updated));
        }

        assert_eq!(fx.controller.queue().len(), 1);
        let item = fx.controller.queue().get().await.expect("item");
        assert_eq!(item.key, run_key("p"));
        assert_eq!(item.reasons, vec![EnqueueReason::DependencyChange]);
        fx.controller.queue().done(&item.key).expect("done");
    }

    #[tokio::test]
    async fn test_deleted_primary_is_cleaned_up() {
        let fx = fixture(Arc::new(TwoStep::default()));
        let created = fx.create(ManagedObject::new("PipelineRun", run_key("r"))).await;
        fx.controller.process_next().await.expect("to running");
        assert!(fx.controller.timeouts().is_armed(&run_key("r")));

        fx.observe(ChangeEvent::Deleted(created));
        fx.controller.process_next().await.expect("cleanup");
        assert!(!fx.controller.timeouts().is_armed(&run_key("r")));
    }

    #[tokio::test]
    async fn test_recreated_primary_gets_fresh_timeout() {
        let fx = fixture(Arc::new(TwoStep::default()));
        fx.create(ManagedObject::new("PipelineRun", run_key("r"))).await;
        fx.controller.process_next().await.expect("to running");
        let kind = fx.controller.cache().kind().clone();
        let running = fx.store.get(&kind, &run_key("r")).await.expect("get");
        let old_deadline = fx.controller.timeouts().deadline_of(&run_key("r"));
        assert!(old_deadline.is_some());
        let old_step = ObjectRef::new("StepRun", Key::new("ci", "r-step-0"));
        fx.controller.tracker().watch(run_key("r"), old_step.clone());

        // Delete and re-add land before a worker sees either.
        fx.store.delete(&kind, &run_key("r")).await.expect("delete");
        fx.observe(ChangeEvent::Deleted(running));
        fx.clock.advance(chrono::Duration::seconds(30));
        fx.create(ManagedObject::new("PipelineRun", run_key("r"))).await;
        assert_eq!(fx.controller.queue().len(), 1);

        fx.controller.process_next().await.expect("recreated object runs");

        let stored = fx.refresh(&run_key("r")).await;
        assert_eq!(stored.phase, Phase::Running);
        let new_deadline = fx.controller.timeouts().deadline_of(&run_key("r"));
        assert!(new_deadline > old_deadline);
        assert_eq!(fx.controller.timeouts().armed_count(), 1);
        assert!(!fx.controller.tracker().is_watching(&run_key("r"), &old_step));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_delete_ahead_of_cache_retries_quietly() {
        let fx = fixture(Arc::new(TwoStep::default()));
        let created = fx.create(ManagedObject::new("PipelineRun", run_key("r"))).await;
        let kind = fx.controller.cache().kind().clone();
        fx.store.delete(&kind, &run_key("r")).await.expect("delete");

        // The cache still holds the object, so the status write misses.
        assert!(fx.controller.process_next().await.expect("not fatal"));
        assert!(!fx.controller.timeouts().is_armed(&run_key("r")));
        assert_eq!(fx.controller.queue().failures(&run_key("r")), 1);

        fx.observe(ChangeEvent::Deleted(created));
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(fx.controller.process_next().await.expect("cleanup"));
        assert_eq!(fx.controller.queue().failures(&run_key("r")), 0);
        assert!(fx.controller.queue().is_empty());
    }
}
