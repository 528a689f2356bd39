//! In-memory mirror of one kind of object, kept fresh by a change stream.
//!
//! The cache has a single writer (the informer's updater task) and many
//! readers (workers, the metrics reporter). Each write updates the object map
//! and the [`DependencyIndex`] inside one critical section, and only then runs
//! the registered listeners, so a listener never sees a stale index.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use runwarden_core::{Key, ManagedObject, ObjectKind, OwnerRef, Phase};
use runwarden_events::ChangeEvent;
use tracing::{debug, trace};

/// Listener invoked for every change the cache applies.
///
/// Listeners run on the cache's delivery path and must not block: they may
/// read the cache and enqueue work, nothing more.
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Child-to-owner relation derived from the `owner_refs` of cached objects.
///
/// Never persisted; rebuilt from the cache contents.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DependencyIndex {
    owners: HashMap<Key, Vec<OwnerRef>>,
    children: HashMap<OwnerRef, HashSet<Key>>,
}

impl DependencyIndex {
    /// Build an index from a set of objects.
    pub fn from_objects<'a>(objects: impl IntoIterator<Item = &'a ManagedObject>) -> Self {
        let mut index = Self::default();
        for obj in objects {
            index.upsert(obj);
        }
        index
    }

    /// Record (or refresh) the owners of `obj`.
    pub fn upsert(&mut self, obj: &ManagedObject) {
        self.remove(&obj.key);
        if obj.owner_refs.is_empty() {
            return;
        }
        for owner in &obj.owner_refs {
            self.children
                .entry(owner.clone())
                .or_default()
                .insert(obj.key.clone());
        }
        self.owners.insert(obj.key.clone(), obj.owner_refs.clone());
    }

    /// Forget everything about `child`.
    pub fn remove(&mut self, child: &Key) {
        let Some(previous) = self.owners.remove(child) else {
            return;
        };
        for owner in previous {
            if let Some(keys) = self.children.get_mut(&owner) {
                keys.remove(child);
                if keys.is_empty() {
                    self.children.remove(&owner);
                }
            }
        }
    }

    /// Owners of `child`, in the order its `owner_refs` list them.
    pub fn owners_of(&self, child: &Key) -> Vec<OwnerRef> {
        self.owners.get(child).cloned().unwrap_or_default()
    }

    /// Keys of the children that name `owner`.
    pub fn children_of(&self, owner: &OwnerRef) -> Vec<Key> {
        self.children
            .get(owner)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of children with at least one owner.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Check if no child has an owner.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[derive(Default)]
struct CacheState {
    objects: HashMap<Key, ManagedObject>,
    index: DependencyIndex,
}

/// Eventually-consistent mirror of one object kind.
pub struct ObjectCache {
    kind: ObjectKind,
    state: RwLock<CacheState>,
    listeners: RwLock<Vec<ChangeListener>>,
    synced: AtomicBool,
}

impl ObjectCache {
    /// Create an empty cache for `kind`.
    pub fn new(kind: impl Into<ObjectKind>) -> Self {
        Self {
            kind: kind.into(),
            state: RwLock::new(CacheState::default()),
            listeners: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
        }
    }

    /// Kind mirrored by this cache.
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Register a listener for Add/Update/Delete events.
    pub fn on_change(&self, listener: ChangeListener) {
        self.listeners.write().push(listener);
    }

    /// Point lookup.
    pub fn get(&self, key: &Key) -> Option<ManagedObject> {
        self.state.read().objects.get(key).cloned()
    }

    /// Snapshot of every cached object, sorted by key.
    pub fn list(&self) -> Vec<ManagedObject> {
        let mut objects: Vec<ManagedObject> =
            self.state.read().objects.values().cloned().collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        objects
    }

    /// Objects naming `owner` among their owner references.
    ///
    /// Unordered; consistent as of the call.
    pub fn list_by_owner(&self, owner: &OwnerRef) -> Vec<ManagedObject> {
        let state = self.state.read();
        state
            .index
            .children_of(owner)
            .iter()
            .filter_map(|key| state.objects.get(key).cloned())
            .collect()
    }

    /// Owners recorded for `child`.
    pub fn owners_of(&self, child: &Key) -> Vec<OwnerRef> {
        self.state.read().index.owners_of(child)
    }

    /// Copy of the current dependency index.
    pub fn dependency_index(&self) -> DependencyIndex {
        self.state.read().index.clone()
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.state.read().objects.is_empty()
    }

    /// Count of cached objects per phase. Every phase is present.
    pub fn count_by_phase(&self) -> BTreeMap<Phase, usize> {
        let mut counts: BTreeMap<Phase, usize> = Phase::ALL.iter().map(|p| (*p, 0)).collect();
        for obj in self.state.read().objects.values() {
            if let Some(count) = counts.get_mut(&obj.phase) {
                *count = count.saturating_add(1);
            }
        }
        counts
    }

    /// Whether the initial list has been applied.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub(crate) fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    /// Apply one change event and notify listeners.
    ///
    /// Events older than the cached copy (by resource version) are dropped,
    /// which makes replays after a relist harmless. Returns whether the event
    /// was applied.
    pub fn apply(&self, event: ChangeEvent) -> bool {
        if event.kind() != &self.kind {
            trace!(kind = %event.kind(), expected = %self.kind, "Ignoring event for other kind");
            return false;
        }

        let applied = {
            let mut state = self.state.write();
            let obj = event.object();
            match &event {
                ChangeEvent::Added(_) | ChangeEvent::Updated(_) => {
                    let stale = state
                        .objects
                        .get(&obj.key)
                        .is_some_and(|cached| cached.resource_version >= obj.resource_version);
                    if stale {
                        false
                    } else {
                        state.index.upsert(obj);
                        state.objects.insert(obj.key.clone(), obj.clone());
                        true
                    }
                }
                ChangeEvent::Deleted(_) => {
                    state.index.remove(&obj.key);
                    state.objects.remove(&obj.key).is_some()
                }
            }
        };

        if applied {
            self.notify(&event);
        } else {
            trace!(key = %event.key(), event_type = event.event_type(), "Dropped stale event");
        }
        applied
    }

    /// Replace the cache contents with a fresh listing.
    ///
    /// Objects missing from the listing are reported as deletions; the rest
    /// go through [`ObjectCache::apply`] as additions.
    pub fn replace_all(&self, objects: Vec<ManagedObject>) {
        let listed: HashSet<Key> = objects.iter().map(|o| o.key.clone()).collect();
        let vanished: Vec<ManagedObject> = self
            .state
            .read()
            .objects
            .values()
            .filter(|o| !listed.contains(&o.key))
            .cloned()
            .collect();

        debug!(
            kind = %self.kind,
            listed = listed.len(),
            vanished = vanished.len(),
            "Replacing cache contents"
        );

        for obj in vanished {
            self.apply(ChangeEvent::Deleted(obj));
        }
        for obj in objects {
            self.apply(ChangeEvent::Added(obj));
        }
    }

    fn notify(&self, event: &ChangeEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use runwarden_core::{ObjectRef, ResourceVersion};

    fn step(name: &str, version: u64, owner: Option<&str>) -> ManagedObject {
        let mut obj = ManagedObject::new("StepRun", Key::new("ci", name));
        obj.resource_version = ResourceVersion::new(version);
        match owner {
            Some(parent) => obj.with_owner(ObjectRef::new("PipelineRun", Key::new("ci", parent))),
            None => obj,
        }
    }

    fn parent(name: &str) -> OwnerRef {
        ObjectRef::new("PipelineRun", Key::new("ci", name))
    }

    #[test]
    fn test_get_after_add() {
        let cache = ObjectCache::new("StepRun");
        assert!(cache.apply(ChangeEvent::Added(step("s1", 1, None))));
        assert!(cache.get(&Key::new("ci", "s1")).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stale_update_is_dropped() {
        let cache = ObjectCache::new("StepRun");
        cache.apply(ChangeEvent::Added(step("s1", 5, None)));
        let mut old = step("s1", 3, None);
        old.phase = Phase::Failed;
        assert!(!cache.apply(ChangeEvent::Updated(old)));
        assert_eq!(
            cache.get(&Key::new("ci", "s1")).map(|o| o.phase),
            Some(Phase::Pending)
        );
    }

    #[test]
    fn test_other_kind_is_ignored() {
        let cache = ObjectCache::new("PipelineRun");
        assert!(!cache.apply(ChangeEvent::Added(step("s1", 1, None))));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_list_by_owner_follows_updates() {
        let cache = ObjectCache::new("StepRun");
        cache.apply(ChangeEvent::Added(step("s1", 1, Some("p1"))));
        cache.apply(ChangeEvent::Added(step("s2", 2, Some("p1"))));
        cache.apply(ChangeEvent::Added(step("s3", 3, Some("p2"))));
        assert_eq!(cache.list_by_owner(&parent("p1")).len(), 2);

        // s2 is re-parented
        cache.apply(ChangeEvent::Updated(step("s2", 4, Some("p2"))));
        assert_eq!(cache.list_by_owner(&parent("p1")).len(), 1);
        assert_eq!(cache.list_by_owner(&parent("p2")).len(), 2);

        cache.apply(ChangeEvent::Deleted(step("s3", 5, Some("p2"))));
        assert_eq!(cache.list_by_owner(&parent("p2")).len(), 1);
        assert!(cache.owners_of(&Key::new("ci", "s3")).is_empty());
    }

    #[test]
    fn test_index_is_derivable_from_contents() {
        let cache = ObjectCache::new("StepRun");
        cache.apply(ChangeEvent::Added(step("s1", 1, Some("p1"))));
        cache.apply(ChangeEvent::Added(step("s2", 2, None)));
        cache.apply(ChangeEvent::Updated(step("s2", 3, Some("p1"))));
        cache.apply(ChangeEvent::Deleted(step("s1", 4, Some("p1"))));

        let rebuilt = DependencyIndex::from_objects(cache.list().iter());
        assert_eq!(cache.dependency_index(), rebuilt);
    }

    #[test]
    fn test_listener_sees_fresh_index() {
        let cache = Arc::new(ObjectCache::new("StepRun"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let cache_in_listener = Arc::clone(&cache);
        let seen_in_listener = Arc::clone(&seen);
        cache.on_change(Arc::new(move |event: &ChangeEvent| {
            let owners = cache_in_listener.owners_of(event.key());
            seen_in_listener.lock().push(owners);
        }));

        cache.apply(ChangeEvent::Added(step("s1", 1, Some("p1"))));
        assert_eq!(seen.lock().as_slice(), &[vec![parent("p1")]]);
    }

    #[test]
    fn test_replace_all_reports_vanished_objects() {
        let cache = ObjectCache::new("StepRun");
        let deletes = Arc::new(Mutex::new(Vec::new()));
        let deletes_in_listener = Arc::clone(&deletes);
        cache.on_change(Arc::new(move |event: &ChangeEvent| {
            if event.is_delete() {
                deletes_in_listener.lock().push(event.key().clone());
            }
        }));

        cache.apply(ChangeEvent::Added(step("s1", 1, None)));
        cache.apply(ChangeEvent::Added(step("s2", 2, None)));
        cache.replace_all(vec![step("s2", 2, None), step("s3", 3, None)]);

        assert_eq!(deletes.lock().as_slice(), &[Key::new("ci", "s1")]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_count_by_phase_includes_every_phase() {
        let cache = ObjectCache::new("StepRun");
        let mut running = step("s1", 1, None);
        running.phase = Phase::Running;
        cache.apply(ChangeEvent::Added(running));
        cache.apply(ChangeEvent::Added(step("s2", 2, None)));

        let counts = cache.count_by_phase();
        assert_eq!(counts.len(), Phase::ALL.len());
        assert_eq!(counts.get(&Phase::Running), Some(&1));
        assert_eq!(counts.get(&Phase::Pending), Some(&1));
        assert_eq!(counts.get(&Phase::Failed), Some(&0));
    }
}
