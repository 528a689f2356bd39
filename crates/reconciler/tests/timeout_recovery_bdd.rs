//! BDD tests: run timeouts across restarts, and child changes fanning in to
//! their parent.
//!
//! Time is driven by a `ManualClock` and deadlines are fired with
//! `TimeoutSupervisor::fire_due`, so no test waits on the wall clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runwarden_core::{EnqueueReason, Key, ManagedObject, ObjectKind, ObjectRef, Phase};
use runwarden_events::{ChangeEvent, InMemoryObjectStore, ObjectStore};
use runwarden_reconciler::{
    Clock, Controller, ControllerConfig, Error, ManualClock, ReconcileError, ReconcileOutcome,
    Reconciler,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const RUN: &str = "PipelineRun";
const STEP: &str = "StepRun";

/// Starts runs with the creation time recorded in their spec and never
/// finishes them.
struct StartAtCreation;

#[async_trait]
impl Reconciler for StartAtCreation {
    async fn reconcile(&self, run: &ManagedObject) -> Result<ReconcileOutcome, ReconcileError> {
        let created: DateTime<Utc> = run
            .spec
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ReconcileError::permanent("missing created_at"))?;
        let mut next = run.clone();
        next.phase = Phase::Running;
        next.set_start_time_once(created)
            .map_err(|e| ReconcileError::permanent(e.to_string()))?;
        Ok(ReconcileOutcome::new(next))
    }
}

fn controller(store: &Arc<InMemoryObjectStore>, clock: &ManualClock) -> Result<Controller, Error> {
    Controller::builder()
        .with_store(store.clone())
        .with_reconciler(Arc::new(StartAtCreation))
        .for_kind(RUN)
        .owns(STEP)
        .with_clock(Arc::new(clock.clone()))
        .with_config(ControllerConfig::default().with_timeout(Duration::from_secs(300)))
        .build()
}

/// Feed the stored object to the controller's cache, as its informer would.
async fn observe(store: &InMemoryObjectStore, controller: &Controller, key: &Key) -> TestResult {
    let obj = store.get(&ObjectKind::new(RUN), key).await?;
    controller.cache().apply(ChangeEvent::Updated(obj));
    Ok(())
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

#[tokio::test]
async fn given_restart_mid_run_when_recovering_then_deadline_is_kept() -> TestResult {
    // Given: a run created at t=0 with a 300s timeout
    let t0 = Utc::now();
    let store = InMemoryObjectStore::new_arc();
    let key = Key::new("ci", "nightly");
    let run = ManagedObject::new(RUN, key.clone())
        .with_spec(serde_json::json!({ "created_at": t0.to_rfc3339() }));
    store.create(run).await?;

    // And: it was reconciled to Running at t=1
    let clock = ManualClock::new(t0 + secs(1));
    let first = controller(&store, &clock)?;
    observe(&store, &first, &key).await?;
    assert!(first.process_next().await?);
    assert_eq!(first.timeouts().deadline_of(&key), Some(t0 + secs(300)));

    // When: the controller restarts at t=250 and recovers from the store
    clock.set(t0 + secs(250));
    let second = controller(&store, &clock)?;
    observe(&store, &second, &key).await?;
    let recovery = second.timeouts().recover(second.cache().list().iter());
    assert_eq!(recovery.armed, 1);

    // Then: the deadline is still t=300, not t=550
    assert_eq!(second.timeouts().deadline_of(&key), Some(t0 + secs(300)));
    clock.set(t0 + secs(299));
    assert!(second.timeouts().fire_due().is_empty());

    clock.set(t0 + secs(300));
    assert_eq!(second.timeouts().fire_due(), vec![key.clone()]);

    // And: the expiry enqueues the run, which is forced to TimedOut
    assert!(second.queue().is_pending(&key));
    assert!(second.process_next().await?);
    let stored = store.get(&ObjectKind::new(RUN), &key).await?;
    assert_eq!(stored.phase, Phase::TimedOut);
    assert_eq!(stored.start_time, Some(t0));
    assert_eq!(stored.completion_time, Some(clock.now()));
    Ok(())
}

#[tokio::test]
async fn given_overdue_run_when_recovering_then_fires_without_timer_tick() -> TestResult {
    // Given: a running run whose deadline passed while nothing was watching
    let t0 = Utc::now();
    let store = InMemoryObjectStore::new_arc();
    let key = Key::new("ci", "overdue");
    let mut run = store.create(ManagedObject::new(RUN, key.clone())).await?;
    run.phase = Phase::Running;
    run.start_time = Some(t0);
    store.update_status(run).await?;

    let clock = ManualClock::new(t0 + secs(301));
    let restarted = controller(&store, &clock)?;
    observe(&store, &restarted, &key).await?;
    let item = restarted.queue().get().await;
    if let Some(item) = item {
        restarted.queue().done(&item.key)?;
    }

    // When: timeouts are recovered
    let recovery = restarted.timeouts().recover(restarted.cache().list().iter());

    // Then: the callback fired at once and the run is queued as a timeout
    assert_eq!(recovery.expired, vec![key.clone()]);
    assert!(!restarted.timeouts().is_armed(&key));
    let item = restarted.queue().get().await.ok_or("queue closed")?;
    assert_eq!(item.key, key);
    assert!(item.is_timeout());
    restarted.queue().done(&item.key)?;
    Ok(())
}

#[tokio::test]
async fn given_armed_key_when_arming_again_then_already_armed() -> TestResult {
    let clock = ManualClock::new(Utc::now());
    let store = InMemoryObjectStore::new_arc();
    let ctl = controller(&store, &clock)?;
    let key = Key::new("ci", "twice");

    ctl.timeouts().arm(key.clone(), clock.now() + secs(10))?;
    let second = ctl.timeouts().arm(key.clone(), clock.now() + secs(20));

    assert!(matches!(second, Err(Error::AlreadyArmed { .. })));
    assert!(second.is_err_and(|e| e.is_fatal()));
    Ok(())
}

#[tokio::test]
async fn given_watched_child_when_updated_three_times_then_parent_queued_once() -> TestResult {
    // Given: parent P watching child C, where C names P as its owner
    let clock = ManualClock::new(Utc::now());
    let store = InMemoryObjectStore::new_arc();
    let ctl = controller(&store, &clock)?;
    let parent = Key::new("ci", "p");
    let child_ref = ObjectRef::new(STEP, Key::new("ci", "c"));
    ctl.tracker().watch(parent.clone(), child_ref.clone());

    let child = store
        .create(
            ManagedObject::new(STEP, child_ref.key.clone())
                .with_owner(ObjectRef::new(RUN, parent.clone())),
        )
        .await?;
    let children = ctl
        .child_cache(&ObjectKind::new(STEP))
        .ok_or("no child cache")?
        .clone();

    // When: C changes three times before P is dequeued
    let mut latest = child;
    for _ in 0..3 {
        latest.message = Some(format!("progress {}", latest.resource_version));
        latest = store.update_status(latest).await?;
        children.apply(ChangeEvent::Updated(latest.clone()));
    }

    // Then: resolving C names P, and P is queued exactly once
    assert_eq!(ctl.tracker().resolve_parents(&child_ref), vec![parent.clone()]);
    assert_eq!(ctl.queue().len(), 1);
    let item = ctl.queue().get().await.ok_or("queue closed")?;
    assert_eq!(item.key, parent);
    assert_eq!(item.reasons, vec![EnqueueReason::DependencyChange]);
    ctl.queue().done(&item.key)?;
    assert!(ctl.queue().is_empty());
    Ok(())
}

#[tokio::test]
async fn given_deleted_child_when_notified_then_parents_resolved_one_last_time() -> TestResult {
    let clock = ManualClock::new(Utc::now());
    let store = InMemoryObjectStore::new_arc();
    let ctl = controller(&store, &clock)?;
    let parent = Key::new("ci", "p");
    let child = ManagedObject::new(STEP, Key::new("ci", "c"));
    let child_ref = child.object_ref();
    ctl.tracker().watch(parent.clone(), child_ref.clone());

    let children = ctl
        .child_cache(&ObjectKind::new(STEP))
        .ok_or("no child cache")?
        .clone();
    children.apply(ChangeEvent::Added(child.clone()));
    let item = ctl.queue().get().await.ok_or("queue closed")?;
    ctl.queue().done(&item.key)?;

    children.apply(ChangeEvent::Deleted(child));

    assert!(ctl.queue().is_pending(&parent));
    assert!(ctl.tracker().resolve_parents(&child_ref).is_empty());
    Ok(())
}
