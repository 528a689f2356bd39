//! Object store collaborator for runwarden.
//!
//! - **Store trait**: [`ObjectStore`] with optimistic-concurrency writes
//!   (`update_status` fails with [`StoreError::Conflict`] on a stale
//!   resource version)
//! - **Change streams**: per-kind [`ChangeSubscription`]s of [`ChangeEvent`]s
//! - **Implementations**: [`InMemoryObjectStore`] and the [`TracingObjectStore`]
//!   decorator
//!
//! # Example
//!
//! ```ignore
//! use runwarden_core::{Key, ManagedObject, ObjectKind};
//! use runwarden_events::{InMemoryObjectStore, ObjectStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = InMemoryObjectStore::new();
//!     let mut changes = store.subscribe(&ObjectKind::new("PipelineRun"));
//!
//!     store
//!         .create(ManagedObject::new("PipelineRun", Key::new("ci", "build-1")))
//!         .await?;
//!
//!     let event = changes.recv().await?;
//!     println!("{} {}", event.event_type(), event.key());
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod event;
pub mod store;

pub use error::{ChangeStreamError, Result, StoreError};
pub use event::ChangeEvent;
pub use store::{ChangeSubscription, InMemoryObjectStore, ObjectStore, TracingObjectStore};
