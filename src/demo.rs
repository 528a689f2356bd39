//! Demo pipeline over the in-memory store.
//!
//! Two controllers share one store:
//!
//! - `PipelineRun` objects own a chain of `StepRun` children, created one at
//!   a time; the run succeeds when its last step succeeds
//! - `StepRun` objects simulate work by staying `Running` for `duration_ms`
//!
//! A step change wakes its run through the dependency tracker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runwarden_core::{
    EnqueueReason, GenericResultExt, Key, ManagedObject, ObjectKind, ObjectRef, Phase,
};
use runwarden_events::{ObjectStore, StoreError};
use runwarden_reconciler::{
    Clock, Controller, ControllerConfig, MetricsSink, ReconcileError, ReconcileOutcome,
    Reconciler, SystemClock, TracingReconciler,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const PIPELINE_RUN: &str = "PipelineRun";
pub const STEP_RUN: &str = "StepRun";

/// Desired state of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub steps: u32,
    #[serde(default)]
    pub step_ms: u64,
    /// Zero-based index of a step that should fail.
    #[serde(default)]
    pub fail_step: Option<u32>,
    #[serde(default)]
    pub cancel: bool,
}

/// Observed progress of a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub completed_steps: u32,
}

impl PipelineStatus {
    /// Read the status of `run`; a run that has never been written has none.
    fn from_object(run: &ManagedObject) -> Result<Self, ReconcileError> {
        if run.status.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(run.status.clone())
            .map_err(|e| ReconcileError::permanent(format!("invalid pipeline status: {e}")))
    }
}

/// Desired state of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub index: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub fail: bool,
}

/// Key of step `index` of `run`.
pub fn step_key(run: &Key, index: u32) -> Key {
    Key::new(run.namespace.clone(), format!("{}-step-{index}", run.name))
}

fn step_ref(run: &Key, index: u32) -> ObjectRef {
    ObjectRef::new(STEP_RUN, step_key(run, index))
}

fn transient(e: &StoreError) -> ReconcileError {
    ReconcileError::transient(e.to_string())
}

fn advance(obj: &mut ManagedObject, target: Phase) -> Result<(), ReconcileError> {
    obj.transition(target)
        .map_err(|e| ReconcileError::permanent(e.to_string()))
}

/// Drives a pipeline run through its steps.
pub struct PipelineReconciler {
    store: Arc<dyn ObjectStore>,
}

impl PipelineReconciler {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    async fn ensure_step(
        &self,
        run: &ManagedObject,
        spec: &PipelineSpec,
        index: u32,
    ) -> Result<ObjectRef, ReconcileError> {
        let step_spec = StepSpec {
            index,
            duration_ms: spec.step_ms,
            fail: spec.fail_step == Some(index),
        };
        let step = ManagedObject::new(STEP_RUN, step_key(&run.key, index))
            .with_owner(run.object_ref())
            .with_spec(
                serde_json::to_value(step_spec)
                    .map_err(|e| ReconcileError::permanent(e.to_string()))?,
            );
        match self.store.create(step).await {
            Ok(created) => debug!(run = %run.key, step = %created.key, "Created step"),
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(transient(&e)),
        }
        Ok(step_ref(&run.key, index))
    }
}

#[async_trait]
impl Reconciler for PipelineReconciler {
    async fn reconcile(&self, run: &ManagedObject) -> Result<ReconcileOutcome, ReconcileError> {
        let spec: PipelineSpec = serde_json::from_value(run.spec.clone())
            .map_err(|e| ReconcileError::permanent(format!("invalid pipeline spec: {e}")))?;
        let mut status = PipelineStatus::from_object(run)?;
        let mut next = run.clone();

        if spec.cancel {
            advance(&mut next, Phase::Cancelled)?;
            next.message = Some("cancelled on request".to_string());
            return Ok(ReconcileOutcome::new(next));
        }

        let mut watch = None;
        match run.phase {
            Phase::Pending => {
                advance(&mut next, Phase::Running)?;
                if spec.steps > 0 {
                    watch = Some(self.ensure_step(run, &spec, 0).await?);
                }
            }
            Phase::Running if status.completed_steps < spec.steps => {
                let index = status.completed_steps;
                let key = step_key(&run.key, index);
                let step = match self.store.get(&ObjectKind::new(STEP_RUN), &key).await {
                    Ok(step) => Some(step),
                    Err(StoreError::NotFound { .. }) => None,
                    Err(e) => return Err(transient(&e)),
                };
                match step.map(|s| s.phase) {
                    None => watch = Some(self.ensure_step(run, &spec, index).await?),
                    Some(Phase::Succeeded) => {
                        status.completed_steps = index.saturating_add(1);
                        if status.completed_steps < spec.steps {
                            let index = status.completed_steps;
                            watch = Some(self.ensure_step(run, &spec, index).await?);
                        }
                    }
                    Some(phase) if phase.is_terminal() => {
                        return Err(ReconcileError::permanent(format!(
                            "step {key} ended {phase}"
                        )));
                    }
                    Some(_) => watch = Some(step_ref(&run.key, index)),
                }
            }
            _ => {}
        }

        if run.phase == Phase::Running && status.completed_steps >= spec.steps {
            advance(&mut next, Phase::Succeeded)?;
            next.message = Some(format!("completed {} steps", spec.steps));
        }
        next.status =
            serde_json::to_value(status).map_err(|e| ReconcileError::permanent(e.to_string()))?;

        let mut outcome = ReconcileOutcome::new(next);
        if let Some(child) = watch {
            outcome = outcome.watching(child);
        } else if run.phase == Phase::Pending && spec.steps == 0 {
            outcome = outcome.requeue_after(Duration::ZERO);
        }
        Ok(outcome)
    }
}

/// Simulates a step that runs for a fixed duration.
pub struct StepReconciler {
    clock: Arc<dyn Clock>,
}

impl StepReconciler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Reconciler for StepReconciler {
    async fn reconcile(&self, step: &ManagedObject) -> Result<ReconcileOutcome, ReconcileError> {
        let spec: StepSpec = serde_json::from_value(step.spec.clone())
            .map_err(|e| ReconcileError::permanent(format!("invalid step spec: {e}")))?;
        let duration = Duration::from_millis(spec.duration_ms);
        let mut next = step.clone();

        match step.phase {
            Phase::Pending => {
                advance(&mut next, Phase::Running)?;
                Ok(ReconcileOutcome::new(next).requeue_after(duration))
            }
            Phase::Running => {
                let now = self.clock.now();
                let started = step.start_time.unwrap_or(now);
                let elapsed = (now - started).to_std().unwrap_or_default();
                if elapsed < duration {
                    let remaining = duration.saturating_sub(elapsed);
                    return Ok(ReconcileOutcome::new(next).requeue_after(remaining));
                }
                if spec.fail {
                    return Err(ReconcileError::permanent(format!("step {} failed", spec.index)));
                }
                advance(&mut next, Phase::Succeeded)?;
                Ok(ReconcileOutcome::new(next))
            }
            _ => Ok(ReconcileOutcome::new(next)),
        }
    }
}

/// The pipeline and step controllers over one store.
#[derive(Clone)]
pub struct Demo {
    pub pipelines: Controller,
    pub steps: Controller,
    store: Arc<dyn ObjectStore>,
}

impl Demo {
    /// Build both controllers with the same engine settings.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn build(
        store: Arc<dyn ObjectStore>,
        config: &ControllerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> runwarden_reconciler::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pipelines = Controller::builder()
            .with_store(store.clone())
            .with_reconciler(Arc::new(TracingReconciler::new(PipelineReconciler::new(
                store.clone(),
            ))))
            .for_kind(PIPELINE_RUN)
            .owns(STEP_RUN)
            .with_config(config.clone())
            .with_metrics(metrics.clone())
            .with_clock(clock.clone())
            .build()?;
        let steps = Controller::builder()
            .with_store(store.clone())
            .with_reconciler(Arc::new(TracingReconciler::new(StepReconciler::new(
                clock.clone(),
            ))))
            .for_kind(STEP_RUN)
            .with_config(config.clone())
            .with_metrics(metrics)
            .with_clock(clock)
            .build()?;
        Ok(Self {
            pipelines,
            steps,
            store,
        })
    }

    /// Run both controllers until `cancel` fires or one fails.
    ///
    /// # Errors
    ///
    /// Returns the first fatal engine error.
    pub async fn run(&self, cancel: CancellationToken) -> runwarden_reconciler::Result<()> {
        let scope = cancel.child_token();
        let result = tokio::try_join!(
            self.pipelines.run(scope.child_token()),
            self.steps.run(scope.child_token()),
        );
        if result.is_err() {
            scope.cancel();
        }
        result.map(|_| ())
    }

    /// Ask the pipeline run `key` to stop.
    ///
    /// Sets the cancel flag in the run's spec, retrying on version conflicts,
    /// then enqueues the run on the pipeline controller. The change event
    /// enqueues it too; the queue merges the two.
    ///
    /// # Errors
    ///
    /// Returns the store error if the run cannot be read or written.
    pub async fn cancel_run(&self, key: &Key) -> Result<(), StoreError> {
        let kind = ObjectKind::new(PIPELINE_RUN);
        loop {
            let mut run = self.store.get(&kind, key).await?;
            let Some(flags) = run.spec.as_object_mut() else {
                warn!(key = %key, "Run has no spec to cancel");
                return Ok(());
            };
            flags.insert("cancel".to_string(), serde_json::Value::Bool(true));
            match self
                .store
                .update(run)
                .await
                .tap_ok(|updated| info!(key = %updated.key, "Cancel requested"))
            {
                Ok(_) => break,
                Err(e) if e.is_conflict() => {
                    debug!(key = %key, "Run changed while cancelling, retrying");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to request cancel");
                    return Err(e);
                }
            }
        }
        self.pipelines
            .handle()
            .enqueue(key.clone(), EnqueueReason::Requeue);
        Ok(())
    }

    /// Check whether every run in `keys` has reached a terminal phase.
    pub fn all_terminal(&self, keys: &[Key]) -> bool {
        keys.iter().all(|key| {
            self.pipelines
                .cache()
                .get(key)
                .is_some_and(|run| run.phase.is_terminal())
        })
    }
}

/// Create `count` pending pipeline runs in `namespace`.
///
/// # Errors
///
/// Returns the store error of the first failed create.
pub async fn seed_runs(
    store: &dyn ObjectStore,
    namespace: &str,
    count: usize,
    spec: &PipelineSpec,
) -> Result<Vec<Key>, StoreError> {
    let value = serde_json::to_value(spec).unwrap_or_default();
    let mut keys = Vec::with_capacity(count);
    for i in 0..count {
        let run = ManagedObject::new(PIPELINE_RUN, Key::new(namespace, format!("run-{i}")))
            .with_spec(value.clone());
        keys.push(store.create(run).await?.key);
    }
    info!(namespace, runs = keys.len(), steps = spec.steps, "Seeded pipeline runs");
    Ok(keys)
}
