//! Core object model for runwarden.
//!
//! - **Keys**: [`Key`] (`namespace/name`) and kind-qualified [`ObjectRef`]s
//! - **Objects**: [`ManagedObject`] with its [`Phase`] lifecycle and
//!   [`ResourceVersion`] for optimistic concurrency
//! - **Work items**: [`WorkItem`] and [`EnqueueReason`]
//! - **Errors**: [`Error`] and [`Result`]

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod result;
pub mod types;

pub use error::Error;
pub use result::{GenericResultExt, Result};
pub use types::{
    EnqueueReason, Key, ManagedObject, ObjectKind, ObjectRef, OwnerRef, Phase, ResourceVersion,
    WorkItem,
};
