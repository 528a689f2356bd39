//! Change events emitted by the object store.

use runwarden_core::{Key, ManagedObject, ObjectKind};
use serde::{Deserialize, Serialize};

/// A change to a single object, as delivered by a change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// The object was created (or listed during a resync).
    Added(ManagedObject),
    /// The object was updated; carries the new state.
    Updated(ManagedObject),
    /// The object was deleted; carries its last known state.
    Deleted(ManagedObject),
}

impl ChangeEvent {
    /// The object carried by this event.
    pub fn object(&self) -> &ManagedObject {
        match self {
            Self::Added(obj) | Self::Updated(obj) | Self::Deleted(obj) => obj,
        }
    }

    /// Consume the event, returning its object.
    pub fn into_object(self) -> ManagedObject {
        match self {
            Self::Added(obj) | Self::Updated(obj) | Self::Deleted(obj) => obj,
        }
    }

    /// Kind of the changed object.
    pub fn kind(&self) -> &ObjectKind {
        &self.object().kind
    }

    /// Key of the changed object.
    pub fn key(&self) -> &Key {
        &self.object().key
    }

    /// Event type name for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Updated(_) => "updated",
            Self::Deleted(_) => "deleted",
        }
    }

    /// Check if this is a delete.
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Deleted(_))
    }
}
