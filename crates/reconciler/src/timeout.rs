//! Run-timeout supervision.
//!
//! One deadline per running object, held in a min-heap and served by a single
//! timer task. Disarming only removes the map entry; the heap entry is
//! discarded when it surfaces (each arm gets a fresh generation number, so a
//! stale heap entry never matches a newer arm). Once stale entries outnumber
//! live ones the heap is rebuilt, so it never holds more than twice the armed
//! deadlines.
//!
//! Deadlines are absolute wall-clock times computed from the persisted start
//! time, which is what lets [`TimeoutSupervisor::recover`] rebuild them after
//! a restart.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use runwarden_core::{Key, ManagedObject, Phase};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};

/// Called with the key of every object whose deadline passed.
///
/// Must not block; the engine's callback only enqueues the key.
pub type TimeoutCallback = Arc<dyn Fn(Key) + Send + Sync>;

/// Longest the timer sleeps before re-reading the clock, so a wall-clock jump
/// is noticed even when no deadline is near.
const MAX_SLEEP: Duration = Duration::from_secs(5);

/// Heaps smaller than this are never compacted.
const COMPACT_MIN: usize = 16;

type DeadlineHeap = BinaryHeap<Reverse<(DateTime<Utc>, u64, Key)>>;

#[derive(Default)]
struct TimeoutState {
    armed: HashMap<Key, (DateTime<Utc>, u64)>,
    heap: DeadlineHeap,
    generation: u64,
}

impl TimeoutState {
    /// Drop heap entries whose arm was cancelled or replaced.
    fn prune_stale(&mut self) {
        while let Some(Reverse((deadline, generation, key))) = self.heap.peek() {
            if self.armed.get(key) == Some(&(*deadline, *generation)) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Rebuild the heap from live entries once stale ones dominate.
    fn compact_if_sparse(&mut self) {
        let live = self.armed.len();
        if self.heap.len() < COMPACT_MIN || self.heap.len() <= live.saturating_mul(2) {
            return;
        }
        let stale = self.heap.len().saturating_sub(live);
        let armed = &self.armed;
        self.heap.retain(|Reverse((deadline, generation, key))| {
            armed.get(key) == Some(&(*deadline, *generation))
        });
        debug!(stale, live, "Timeout heap compacted");
    }
}

/// What [`TimeoutSupervisor::recover`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Objects re-armed with a future deadline.
    pub armed: usize,
    /// Objects whose deadline had already passed; the callback fired for each.
    pub expired: Vec<Key>,
    /// Objects that were already armed and kept their deadline.
    pub kept: usize,
}

/// Tracks one deadline per running object and fires a callback on expiry.
pub struct TimeoutSupervisor {
    timeout: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<TimeoutState>,
    callback: RwLock<Option<TimeoutCallback>>,
    wake: Notify,
}

impl TimeoutSupervisor {
    /// Create a supervisor applying `timeout` to every object.
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            timeout,
            clock,
            state: Mutex::new(TimeoutState::default()),
            callback: RwLock::new(None),
            wake: Notify::new(),
        }
    }

    /// The fixed run timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register the expiry callback, replacing any previous one.
    pub fn on_expire(&self, callback: TimeoutCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Deadline for an object that started at `start`.
    #[must_use]
    pub fn deadline_for(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|timeout| start.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Arm a deadline for `key`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyArmed` if `key` is armed. This is fatal: a running
    /// object would otherwise carry two deadlines.
    pub fn arm(&self, key: Key, deadline: DateTime<Utc>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.armed.contains_key(&key) {
                return Err(Error::already_armed(key));
            }
            state.generation = state.generation.wrapping_add(1);
            let generation = state.generation;
            state.armed.insert(key.clone(), (deadline, generation));
            state.heap.push(Reverse((deadline, generation, key.clone())));
        }
        debug!(key = %key, deadline = %deadline, "Timeout armed");
        self.wake.notify_one();
        Ok(())
    }

    /// Remove the deadline for `key`. No-op if not armed.
    ///
    /// Returns whether a deadline was removed.
    pub fn disarm(&self, key: &Key) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.armed.remove(key).is_some();
            state.compact_if_sparse();
            removed
        };
        if removed {
            debug!(key = %key, "Timeout disarmed");
        }
        removed
    }

    #[must_use]
    pub fn is_armed(&self, key: &Key) -> bool {
        self.state.lock().armed.contains_key(key)
    }

    /// Deadline armed for `key`, if any.
    #[must_use]
    pub fn deadline_of(&self, key: &Key) -> Option<DateTime<Utc>> {
        self.state.lock().armed.get(key).map(|(deadline, _)| *deadline)
    }

    /// Number of armed deadlines.
    #[must_use]
    pub fn armed_count(&self) -> usize {
        self.state.lock().armed.len()
    }

    /// Earliest armed deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let mut state = self.state.lock();
        state.prune_stale();
        state.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Disarm every deadline that has passed and run the callback for each.
    ///
    /// Returns the expired keys in deadline order.
    pub fn fire_due(&self) -> Vec<Key> {
        let now = self.clock.now();
        let expired = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            loop {
                state.prune_stale();
                let due = state
                    .heap
                    .peek()
                    .is_some_and(|Reverse((deadline, _, _))| *deadline <= now);
                if !due {
                    break;
                }
                if let Some(Reverse((_, _, key))) = state.heap.pop() {
                    state.armed.remove(&key);
                    expired.push(key);
                }
            }
            expired
        };

        for key in &expired {
            info!(key = %key, "Run timeout expired");
            self.notify(key.clone());
        }
        expired
    }

    /// Rebuild deadlines from persisted state after a restart.
    ///
    /// Every `Running` object gets `start_time + timeout`. Objects already
    /// past their deadline fire the callback right away instead of waiting
    /// for the timer. Objects that are already armed keep their deadline.
    pub fn recover<'a>(&self, objects: impl IntoIterator<Item = &'a ManagedObject>) -> Recovery {
        let now = self.clock.now();
        let mut recovery = Recovery::default();

        for obj in objects {
            if obj.phase != Phase::Running {
                continue;
            }
            let start = obj.start_time.unwrap_or_else(|| {
                warn!(key = %obj.key, "Running object has no start time, timing from now");
                now
            });
            let deadline = self.deadline_for(start);

            // An armed object is already served by the timer.
            if deadline <= now && !self.is_armed(&obj.key) {
                recovery.expired.push(obj.key.clone());
                continue;
            }
            match self.arm(obj.key.clone(), deadline) {
                Ok(()) => recovery.armed = recovery.armed.saturating_add(1),
                Err(e) => {
                    debug!(key = %obj.key, error = %e, "Keeping the armed deadline");
                    recovery.kept = recovery.kept.saturating_add(1);
                }
            }
        }

        info!(
            armed = recovery.armed,
            kept = recovery.kept,
            expired = recovery.expired.len(),
            "Timeouts recovered"
        );
        for key in &recovery.expired {
            self.notify(key.clone());
        }
        recovery
    }

    /// Serve deadlines until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        debug!("Timeout supervisor started");
        loop {
            let woken = self.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            self.fire_due();

            let sleep_for = self
                .next_deadline()
                .map_or(MAX_SLEEP, |deadline| {
                    (deadline - self.clock.now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(MAX_SLEEP)
                });

            tokio::select! {
                () = cancel.cancelled() => break,
                () = &mut woken => {}
                () = tokio::time::sleep(sleep_for) => {}
            }
        }
        debug!("Timeout supervisor stopped");
    }

    fn notify(&self, key: Key) {
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => callback(key),
            None => warn!(key = %key, "Timeout expired with no callback registered"),
        }
    }
}
