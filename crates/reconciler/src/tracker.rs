//! Parent-to-child watch registrations.
//!
//! A parent calls [`DependencyTracker::watch`] for each child it wants to hear
//! about. When a child changes, [`DependencyTracker::resolve_parents`] names
//! the parents to enqueue. Watches expire after a lease unless renewed, which
//! bounds memory for parents that stop reconciling without reaching a terminal
//! phase.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use runwarden_core::{Key, ObjectRef};
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct Watcher {
    parent: Key,
    expires_at: Instant,
}

#[derive(Default)]
struct TrackerState {
    /// Watchers per child, in order of their first `watch` call.
    by_child: HashMap<ObjectRef, Vec<Watcher>>,
    by_parent: HashMap<Key, HashSet<ObjectRef>>,
}

/// Records which parents are watching which children.
pub struct DependencyTracker {
    lease: Duration,
    state: Mutex<TrackerState>,
}

impl DependencyTracker {
    /// Create a tracker whose watches last `lease` unless renewed.
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Record that `parent` is interested in `child`.
    ///
    /// Watching again renews the lease and keeps the original position.
    pub fn watch(&self, parent: Key, child: ObjectRef) {
        let expires_at = Instant::now() + self.lease;
        let mut state = self.state.lock();

        let watchers = state.by_child.entry(child.clone()).or_default();
        match watchers.iter_mut().find(|w| w.parent == parent) {
            Some(existing) => existing.expires_at = expires_at,
            None => watchers.push(Watcher {
                parent: parent.clone(),
                expires_at,
            }),
        }

        trace!(parent = %parent, child = %child, "Watching dependency");
        state.by_parent.entry(parent).or_default().insert(child);
    }

    /// Remove every watch held by `parent`.
    pub fn unwatch(&self, parent: &Key) {
        let mut state = self.state.lock();
        let Some(children) = state.by_parent.remove(parent) else {
            return;
        };
        for child in children {
            if let Some(watchers) = state.by_child.get_mut(&child) {
                watchers.retain(|w| &w.parent != parent);
                if watchers.is_empty() {
                    state.by_child.remove(&child);
                }
            }
        }
        trace!(parent = %parent, "Dropped dependency watches");
    }

    /// Parents currently watching `child`, in watch order.
    ///
    /// Expired watches are pruned and not returned.
    pub fn resolve_parents(&self, child: &ObjectRef) -> Vec<Key> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(watchers) = state.by_child.get_mut(child) else {
            return Vec::new();
        };

        let mut expired = Vec::new();
        watchers.retain(|w| {
            let live = w.expires_at > now;
            if !live {
                expired.push(w.parent.clone());
            }
            live
        });
        let parents: Vec<Key> = watchers.iter().map(|w| w.parent.clone()).collect();
        if watchers.is_empty() {
            state.by_child.remove(child);
        }

        for parent in expired {
            trace!(parent = %parent, child = %child, "Watch lease expired");
            if let Some(children) = state.by_parent.get_mut(&parent) {
                children.remove(child);
                if children.is_empty() {
                    state.by_parent.remove(&parent);
                }
            }
        }

        parents
    }

    /// Drop every watch on `child`. Used once a deleted child has been
    /// resolved for the last time.
    pub fn forget_child(&self, child: &ObjectRef) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(watchers) = state.by_child.remove(child) else {
            return;
        };
        for watcher in watchers {
            if let Some(children) = state.by_parent.get_mut(&watcher.parent) {
                children.remove(child);
                if children.is_empty() {
                    state.by_parent.remove(&watcher.parent);
                }
            }
        }
    }

    /// Check if `parent` holds a watch on `child`, expired or not.
    #[must_use]
    pub fn is_watching(&self, parent: &Key, child: &ObjectRef) -> bool {
        self.state
            .lock()
            .by_parent
            .get(parent)
            .is_some_and(|children| children.contains(child))
    }

    /// Number of (parent, child) watches held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().by_child.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().by_child.is_empty()
    }
}
