//! Object store trait and implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use runwarden_core::{Key, ManagedObject, ObjectKind, ObjectRef, ResourceVersion};
use tokio::sync::{broadcast, RwLock};

use crate::error::{ChangeStreamError, Result, StoreError};
use crate::event::ChangeEvent;

/// Default capacity of the change broadcast channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Key-value object store with optimistic-concurrency writes and change streams.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read one object.
    async fn get(&self, kind: &ObjectKind, key: &Key) -> Result<ManagedObject>;

    /// List every object of a kind.
    async fn list(&self, kind: &ObjectKind) -> Result<Vec<ManagedObject>>;

    /// Create an object. The store assigns its resource version.
    async fn create(&self, object: ManagedObject) -> Result<ManagedObject>;

    /// Replace an object (spec and status).
    ///
    /// Fails with `Conflict` if `object.resource_version` is stale.
    async fn update(&self, object: ManagedObject) -> Result<ManagedObject>;

    /// Write the status fields of an object.
    ///
    /// Fails with `Conflict` if `object.resource_version` is stale. Returns the
    /// stored object with its new resource version.
    async fn update_status(&self, object: ManagedObject) -> Result<ManagedObject>;

    /// Delete an object.
    async fn delete(&self, kind: &ObjectKind, key: &Key) -> Result<()>;

    /// Subscribe to changes of one kind.
    fn subscribe(&self, kind: &ObjectKind) -> ChangeSubscription;
}

/// Subscription handle for receiving change events of a single kind.
pub struct ChangeSubscription {
    kind: ObjectKind,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl ChangeSubscription {
    /// Wrap a broadcast receiver, filtering for `kind`.
    pub fn new(kind: ObjectKind, receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { kind, receiver }
    }

    /// Kind this subscription delivers.
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Receive the next event for this kind.
    ///
    /// # Errors
    ///
    /// `Lagged` when events were dropped because the subscriber fell behind,
    /// `Closed` when the store is gone.
    pub async fn recv(&mut self) -> std::result::Result<ChangeEvent, ChangeStreamError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.kind() == &self.kind => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(ChangeStreamError::Lagged(n))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ChangeStreamError::Closed),
            }
        }
    }
}

/// In-memory object store.
///
/// Resource versions come from a single store-wide counter, so every write
/// produces a strictly larger version than any earlier write.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectRef, ManagedObject>>,
    broadcast: broadcast::Sender<ChangeEvent>,
    last_version: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryObjectStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a store whose change channel holds `capacity` events.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity.max(1));
        Self {
            objects: RwLock::new(HashMap::new()),
            broadcast,
            last_version: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Create a new in-memory store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of successful mutating calls so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    fn next_version(&self) -> ResourceVersion {
        let v = self
            .last_version
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        ResourceVersion::new(v)
    }

    fn publish(&self, event: ChangeEvent) {
        tracing::trace!(
            event_type = event.event_type(),
            kind = %event.kind(),
            key = %event.key(),
            "Publishing change"
        );
        // No receivers is fine: nobody is watching yet.
        let _ = self.broadcast.send(event);
        self.writes.fetch_add(1, Ordering::AcqRel);
    }

    async fn write_checked<F>(&self, object: ManagedObject, apply: F) -> Result<ManagedObject>
    where
        F: FnOnce(&mut ManagedObject, ManagedObject) + Send,
    {
        let id = object.object_ref();
        let mut objects = self.objects.write().await;
        let stored = objects
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(id.kind.clone(), id.key.clone()))?;

        if stored.resource_version != object.resource_version {
            return Err(StoreError::conflict(
                id.kind,
                id.key,
                object.resource_version,
                stored.resource_version,
            ));
        }

        apply(stored, object);
        stored.resource_version = self.next_version();
        let updated = stored.clone();
        // Publish under the lock so per-key event order matches write order.
        self.publish(ChangeEvent::Updated(updated.clone()));
        Ok(updated)
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, kind: &ObjectKind, key: &Key) -> Result<ManagedObject> {
        let objects = self.objects.read().await;
        objects
            .get(&ObjectRef::new(kind.clone(), key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::not_found(kind.clone(), key.clone()))
    }

    async fn list(&self, kind: &ObjectKind) -> Result<Vec<ManagedObject>> {
        let objects = self.objects.read().await;
        let mut listed: Vec<ManagedObject> = objects
            .values()
            .filter(|obj| &obj.kind == kind)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }

    async fn create(&self, mut object: ManagedObject) -> Result<ManagedObject> {
        let id = object.object_ref();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&id) {
            return Err(StoreError::already_exists(id.kind, id.key));
        }
        object.resource_version = self.next_version();
        objects.insert(id, object.clone());
        self.publish(ChangeEvent::Added(object.clone()));
        Ok(object)
    }

    async fn update(&self, object: ManagedObject) -> Result<ManagedObject> {
        self.write_checked(object, |stored, incoming| *stored = incoming)
            .await
    }

    async fn update_status(&self, object: ManagedObject) -> Result<ManagedObject> {
        self.write_checked(object, |stored, incoming| {
            stored.phase = incoming.phase;
            stored.start_time = incoming.start_time;
            stored.completion_time = incoming.completion_time;
            stored.message = incoming.message;
            stored.status = incoming.status;
        })
        .await
    }

    async fn delete(&self, kind: &ObjectKind, key: &Key) -> Result<()> {
        let mut objects = self.objects.write().await;
        let removed = objects
            .remove(&ObjectRef::new(kind.clone(), key.clone()))
            .ok_or_else(|| StoreError::not_found(kind.clone(), key.clone()))?;
        self.publish(ChangeEvent::Deleted(removed));
        Ok(())
    }

    fn subscribe(&self, kind: &ObjectKind) -> ChangeSubscription {
        ChangeSubscription::new(kind.clone(), self.broadcast.subscribe())
    }
}

/// A wrapper that adds tracing to an object store.
pub struct TracingObjectStore<S: ObjectStore> {
    inner: S,
}

impl<S: ObjectStore> TracingObjectStore<S> {
    /// Create a new tracing object store.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Get the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for TracingObjectStore<S> {
    async fn get(&self, kind: &ObjectKind, key: &Key) -> Result<ManagedObject> {
        tracing::trace!(kind = %kind, key = %key, "Getting object");
        self.inner.get(kind, key).await
    }

    async fn list(&self, kind: &ObjectKind) -> Result<Vec<ManagedObject>> {
        tracing::debug!(kind = %kind, "Listing objects");
        self.inner.list(kind).await
    }

    async fn create(&self, object: ManagedObject) -> Result<ManagedObject> {
        tracing::debug!(kind = %object.kind, key = %object.key, "Creating object");
        self.inner.create(object).await
    }

    async fn update(&self, object: ManagedObject) -> Result<ManagedObject> {
        tracing::debug!(
            kind = %object.kind,
            key = %object.key,
            version = %object.resource_version,
            "Updating object"
        );
        self.inner.update(object).await
    }

    async fn update_status(&self, object: ManagedObject) -> Result<ManagedObject> {
        tracing::debug!(
            kind = %object.kind,
            key = %object.key,
            version = %object.resource_version,
            phase = %object.phase,
            "Updating status"
        );
        let result = self.inner.update_status(object).await;
        if let Ok(ref stored) = result {
            tracing::trace!(key = %stored.key, version = %stored.resource_version, "Status written");
        }
        result
    }

    async fn delete(&self, kind: &ObjectKind, key: &Key) -> Result<()> {
        tracing::debug!(kind = %kind, key = %key, "Deleting object");
        self.inner.delete(kind, key).await
    }

    fn subscribe(&self, kind: &ObjectKind) -> ChangeSubscription {
        tracing::debug!(kind = %kind, "Subscribing to changes");
        self.inner.subscribe(kind)
    }
}
