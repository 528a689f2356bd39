//! Deduplicating work queue with a get/done protocol.
//!
//! A key is in at most one of two places: queued (waiting for a worker) or in
//! flight (held by a worker between [`WorkQueue::get`] and [`WorkQueue::done`]).
//! Enqueueing a key that is in flight only marks it dirty; `done` then puts it
//! back on the queue. Together these give:
//!
//! - a key is queued at most once at any instant
//! - a key is never handed to two workers at the same time

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use runwarden_core::{EnqueueReason, Key, WorkItem};
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(5);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Default)]
struct QueueState {
    /// Keys ready for a worker, in order of first enqueue.
    queue: VecDeque<Key>,
    /// Every key waiting for a reconcile, queued or dirty-in-flight, with the
    /// reasons collected so far.
    pending: HashMap<Key, Vec<EnqueueReason>>,
    in_flight: HashSet<Key>,
    failures: HashMap<Key, u32>,
    shutting_down: bool,
}

/// Work queue shared by the informer listeners, the timeout supervisor and
/// the reconcile workers.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    items: Notify,
    drained: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// Create an empty queue with the default backoff bounds.
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX)
    }

    /// Create an empty queue with custom backoff bounds.
    pub fn with_backoff(base: Duration, max: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            items: Notify::new(),
            drained: Notify::new(),
            backoff_base: base,
            backoff_max: max,
        }
    }

    /// Add `key` to the queue.
    ///
    /// Returns `true` if the key became pending, `false` if it was already
    /// pending (the reason is merged) or the queue is shutting down.
    pub fn enqueue(&self, key: Key, reason: EnqueueReason) -> bool {
        let mut state = self.state.lock();
        if state.shutting_down {
            trace!(key = %key, reason = %reason, "Queue shutting down, dropping enqueue");
            return false;
        }

        if let Some(reasons) = state.pending.get_mut(&key) {
            if !reasons.contains(&reason) {
                reasons.push(reason);
            }
            trace!(key = %key, reason = %reason, "Key already pending");
            return false;
        }

        state.pending.insert(key.clone(), vec![reason]);
        if state.in_flight.contains(&key) {
            trace!(key = %key, reason = %reason, "Key in flight, marked for requeue");
        } else {
            trace!(key = %key, reason = %reason, "Key queued");
            state.queue.push_back(key);
            drop(state);
            self.items.notify_one();
        }
        true
    }

    /// Enqueue `key` once `delay` has elapsed.
    ///
    /// The delay runs on a detached task; if the queue is shut down before it
    /// elapses the enqueue is dropped.
    pub fn enqueue_after(self: &Arc<Self>, key: Key, reason: EnqueueReason, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key, reason);
            return;
        }
        debug!(key = %key, reason = %reason, delay_ms = delay.as_millis(), "Delayed enqueue");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key, reason);
        });
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue has shut down and every in-flight key has
    /// been released.
    pub async fn get(&self) -> Option<WorkItem> {
        loop {
            let notified = self.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    if state.in_flight.is_empty() {
                        return None;
                    }
                } else if let Some(key) = state.queue.pop_front() {
                    let reasons = state.pending.remove(&key).unwrap_or_default();
                    state.in_flight.insert(key.clone());
                    return Some(WorkItem { key, reasons });
                }
            }

            notified.await;
        }
    }

    /// Release `key` after a [`WorkQueue::get`].
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolated` if `key` is not in flight. This is fatal:
    /// the caller broke the get/done pairing.
    pub fn done(&self, key: &Key) -> Result<()> {
        let mut state = self.state.lock();
        if !state.in_flight.remove(key) {
            return Err(Error::invariant_violated(format!(
                "done called for {key} without a matching get"
            )));
        }

        if state.shutting_down {
            state.pending.remove(key);
            if state.in_flight.is_empty() {
                drop(state);
                self.drained.notify_waiters();
                self.items.notify_waiters();
            }
            return Ok(());
        }

        if state.pending.contains_key(key) {
            trace!(key = %key, "Requeue after completion");
            state.queue.push_back(key.clone());
            drop(state);
            self.items.notify_one();
        }
        Ok(())
    }

    /// Stop accepting keys, wait for in-flight keys to be released, then
    /// release every blocked [`WorkQueue::get`] with `None`.
    pub async fn shutdown(&self) {
        let dropped = {
            let mut state = self.state.lock();
            if state.shutting_down {
                0
            } else {
                state.shutting_down = true;
                let dropped = state.queue.len();
                state.queue.clear();
                state.pending.clear();
                dropped
            }
        };
        info!(dropped, "Work queue shutting down");

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().in_flight.is_empty() {
                break;
            }
            notified.await;
        }

        self.items.notify_waiters();
        debug!("Work queue drained");
    }

    /// Next retry delay for `key`: `base * 2^failures`, capped at the max.
    ///
    /// Each call counts as one more failure.
    pub fn backoff_delay(&self, key: &Key) -> Duration {
        let mut state = self.state.lock();
        let failures = state.failures.entry(key.clone()).or_insert(0);
        let factor = 1_u32.checked_shl(*failures).unwrap_or(u32::MAX);
        *failures = failures.saturating_add(1);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_max, |delay| delay.min(self.backoff_max))
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &Key) {
        self.state.lock().failures.remove(key);
    }

    /// Failures recorded for `key` since the last [`WorkQueue::forget`].
    #[must_use]
    pub fn failures(&self, key: &Key) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting for a worker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Number of keys held by workers.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Check if `key` is waiting for a reconcile (queued or marked dirty).
    #[must_use]
    pub fn is_pending(&self, key: &Key) -> bool {
        self.state.lock().pending.contains_key(key)
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}
