//! Keeps an [`ObjectCache`] in step with the store.
//!
//! Two halves joined by a bounded channel:
//!
//! - the pump reads the change subscription and forwards events, turning a
//!   lagged subscription into a resync request
//! - the updater is the cache's only writer; it applies events in arrival
//!   order and relists the store on resync
//!
//! The informer subscribes before its initial list, so nothing written in
//! between is missed. Events the list already covered are dropped by the
//! cache's resource-version check.

use std::sync::Arc;
use std::time::Duration;

use runwarden_events::{ChangeEvent, ChangeStreamError, ChangeSubscription, ObjectStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ObjectCache;
use crate::error::Result;

const RESYNC_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Delivery {
    Event(ChangeEvent),
    Resync,
}

/// Feeds one cache from one store subscription.
pub struct Informer {
    store: Arc<dyn ObjectStore>,
    cache: Arc<ObjectCache>,
    namespace: Option<String>,
    buffer: usize,
}

impl Informer {
    /// Create an informer for the kind `cache` mirrors.
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<ObjectCache>, buffer: usize) -> Self {
        Self {
            store,
            cache,
            namespace: None,
            buffer: buffer.max(1),
        }
    }

    /// Only mirror objects in `namespace`.
    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Subscribe, load the initial listing, then keep the cache fresh in the
    /// background until `cancel` fires.
    ///
    /// Returns once the cache has synced. The handle resolves when the
    /// informer stops.
    ///
    /// # Errors
    ///
    /// Returns a store error if the initial listing fails. The background
    /// task ends with `ChangeStream(Closed)` if the store goes away.
    pub async fn start(self, cancel: CancellationToken) -> Result<JoinHandle<Result<()>>> {
        let kind = self.cache.kind().clone();
        let subscription = self.store.subscribe(&kind);

        self.resync().await?;
        self.cache.mark_synced();
        info!(kind = %kind, objects = self.cache.len(), "Informer synced");

        let (tx, rx) = mpsc::channel(self.buffer);
        let informer = Arc::new(self);
        let handle = tokio::spawn(async move {
            let (pumped, ()) = tokio::join!(
                informer.pump(subscription, tx, cancel.clone()),
                informer.update(rx, cancel.clone()),
            );
            debug!(kind = %kind, "Informer stopped");
            pumped
        });
        Ok(handle)
    }

    fn wants(&self, event: &ChangeEvent) -> bool {
        self.namespace
            .as_deref()
            .is_none_or(|ns| event.key().namespace == ns)
    }

    async fn pump(
        &self,
        mut subscription: ChangeSubscription,
        tx: mpsc::Sender<Delivery>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                received = subscription.recv() => received,
            };

            let delivery = match received {
                Ok(event) if self.wants(&event) => Delivery::Event(event),
                Ok(_) => continue,
                Err(ChangeStreamError::Lagged(skipped)) => {
                    warn!(kind = %subscription.kind(), skipped, "Change stream lagged, resyncing");
                    Delivery::Resync
                }
                Err(e @ ChangeStreamError::Closed) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    error!(kind = %subscription.kind(), "Change stream closed");
                    return Err(e.into());
                }
            };

            let sent = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                sent = tx.send(delivery) => sent,
            };
            if sent.is_err() {
                return Ok(());
            }
        }
    }

    async fn update(&self, mut rx: mpsc::Receiver<Delivery>, cancel: CancellationToken) {
        loop {
            let delivery = tokio::select! {
                () = cancel.cancelled() => return,
                delivery = rx.recv() => delivery,
            };
            match delivery {
                Some(Delivery::Event(event)) => {
                    self.cache.apply(event);
                }
                Some(Delivery::Resync) => {
                    while let Err(e) = self.resync().await {
                        warn!(kind = %self.cache.kind(), error = %e, "Resync failed, retrying");
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(RESYNC_RETRY) => {}
                        }
                    }
                }
                None => return,
            }
        }
    }

    async fn resync(&self) -> Result<()> {
        let listed = self.store.list(self.cache.kind()).await?;
        let listed: Vec<_> = listed
            .into_iter()
            .filter(|obj| {
                self.namespace
                    .as_deref()
                    .is_none_or(|ns| obj.key.namespace == ns)
            })
            .collect();
        debug!(kind = %self.cache.kind(), objects = listed.len(), "Relisted");
        self.cache.replace_all(listed);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use runwarden_core::{Key, ManagedObject, Phase};
    use runwarden_events::InMemoryObjectStore;

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(check(), "condition not reached");
    }

    #[tokio::test]
    async fn test_initial_list_then_watch() {
        let store = InMemoryObjectStore::new_arc();
        store
            .create(ManagedObject::new("PipelineRun", Key::new("ci", "before")))
            .await
            .expect("create");

        let cache = Arc::new(ObjectCache::new("PipelineRun"));
        let cancel = CancellationToken::new();
        let handle = Informer::new(store.clone(), cache.clone(), 16)
            .start(cancel.clone())
            .await
            .expect("start");

        assert!(cache.has_synced());
        assert!(cache.get(&Key::new("ci", "before")).is_some());

        let mut created = store
            .create(ManagedObject::new("PipelineRun", Key::new("ci", "after")))
            .await
            .expect("create");
        created.phase = Phase::Running;
        store.update_status(created).await.expect("update");

        wait_until(|| {
            cache
                .get(&Key::new("ci", "after"))
                .is_some_and(|o| o.phase == Phase::Running)
        })
        .await;

        store
            .delete(&"PipelineRun".into(), &Key::new("ci", "before"))
            .await
            .expect("delete");
        wait_until(|| cache.get(&Key::new("ci", "before")).is_none()).await;

        cancel.cancel();
        assert!(handle.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn test_namespace_filter() {
        let store = InMemoryObjectStore::new_arc();
        store
            .create(ManagedObject::new("PipelineRun", Key::new("ci", "mine")))
            .await
            .expect("create");
        store
            .create(ManagedObject::new("PipelineRun", Key::new("prod", "theirs")))
            .await
            .expect("create");

        let cache = Arc::new(ObjectCache::new("PipelineRun"));
        let cancel = CancellationToken::new();
        let _handle = Informer::new(store.clone(), cache.clone(), 16)
            .with_namespace(Some("ci".to_string()))
            .start(cancel.clone())
            .await
            .expect("start");

        store
            .create(ManagedObject::new("PipelineRun", Key::new("prod", "later")))
            .await
            .expect("create");
        store
            .create(ManagedObject::new("PipelineRun", Key::new("ci", "later")))
            .await
            .expect("create");

        wait_until(|| cache.get(&Key::new("ci", "later")).is_some()).await;
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&Key::new("prod", "theirs")).is_none());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_lagged_subscription_resyncs() {
        let store = Arc::new(InMemoryObjectStore::with_channel_capacity(2));
        let cache = Arc::new(ObjectCache::new("PipelineRun"));
        let cancel = CancellationToken::new();
        let _handle = Informer::new(store.clone(), cache.clone(), 1)
            .start(cancel.clone())
            .await
            .expect("start");

        for i in 0..20 {
            store
                .create(ManagedObject::new("PipelineRun", Key::new("ci", format!("run-{i}"))))
                .await
                .expect("create");
        }

        wait_until(|| cache.len() == 20).await;
        cancel.cancel();
    }
}
