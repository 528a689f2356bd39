//! Object model shared by the store and the reconciliation engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Namespace-qualified name of a managed object.
///
/// Unique per [`ObjectKind`]. Displays as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub namespace: String,
    pub name: String,
}

impl Key {
    /// Create a key from a namespace and a name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (namespace, name) = s
            .split_once('/')
            .ok_or_else(|| Error::invalid_key(s, "expected 'namespace/name'"))?;
        if namespace.is_empty() || name.is_empty() {
            return Err(Error::invalid_key(s, "namespace and name must be non-empty"));
        }
        if name.contains('/') {
            return Err(Error::invalid_key(s, "name must not contain '/'"));
        }
        Ok(Self::new(namespace, name))
    }
}

/// Kind of a managed object, e.g. `PipelineRun` or `StepRun`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKind(String);

impl ObjectKind {
    /// Create a kind from its name.
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// Get the kind as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

/// Kind-qualified reference to an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub key: Key,
}

impl ObjectRef {
    /// Create a reference.
    pub fn new(kind: impl Into<ObjectKind>, key: Key) -> Self {
        Self {
            kind: kind.into(),
            key,
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// Back-reference from a child to the parent that created it.
///
/// A pure relation. Deleting the parent never cascades to the child.
pub type OwnerRef = ObjectRef;

/// Lifecycle state of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    /// Observed but not yet reconciled.
    Pending,
    /// Executing; a timeout is armed.
    Running,
    /// Terminal: finished successfully.
    Succeeded,
    /// Terminal: the reconciler reported a failure.
    Failed,
    /// Terminal: exceeded the run timeout.
    TimedOut,
    /// Terminal: cancelled on request.
    Cancelled,
}

impl Phase {
    /// Every phase, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::TimedOut,
        Self::Cancelled,
    ];

    /// Terminal phases are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Check if a transition to `target` is valid.
    ///
    /// Staying in the same phase is always allowed. Nothing leaves a terminal
    /// phase and nothing re-enters `Running`.
    pub fn can_transition_to(&self, target: Phase) -> bool {
        use Phase::*;
        *self == target
            || matches!(
                (self, target),
                (Pending, Running)
                    | (Pending, Failed)
                    | (Pending, Cancelled)
                    | (Running, Succeeded)
                    | (Running, Failed)
                    | (Running, TimedOut)
                    | (Running, Cancelled)
            )
    }

    /// Stable name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::TimedOut => "TimedOut",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonically increasing version used for optimistic-concurrency writes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// Create from a raw value.
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// The version following this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A declarative execution object managed by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub kind: ObjectKind,
    pub key: Key,
    pub phase: Phase,
    /// Set once when the object starts running, immutable afterwards.
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub resource_version: ResourceVersion,
    #[serde(default)]
    pub owner_refs: Vec<OwnerRef>,
    /// Human readable status message, e.g. the reconciler's failure reason.
    pub message: Option<String>,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: serde_json::Value,
}

impl ManagedObject {
    /// Create a new pending object.
    pub fn new(kind: impl Into<ObjectKind>, key: Key) -> Self {
        Self {
            kind: kind.into(),
            key,
            phase: Phase::Pending,
            start_time: None,
            completion_time: None,
            resource_version: ResourceVersion::default(),
            owner_refs: Vec::new(),
            message: None,
            spec: serde_json::Value::Null,
            status: serde_json::Value::Null,
        }
    }

    /// Set the spec payload.
    #[must_use]
    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }

    /// Add an owner reference.
    #[must_use]
    pub fn with_owner(mut self, owner: OwnerRef) -> Self {
        if !self.owner_refs.contains(&owner) {
            self.owner_refs.push(owner);
        }
        self
    }

    /// Kind-qualified reference to this object.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind.clone(), self.key.clone())
    }

    /// Check whether `owner` appears among this object's owner references.
    pub fn is_owned_by(&self, owner: &OwnerRef) -> bool {
        self.owner_refs.contains(owner)
    }

    /// Record the start time unless one was already recorded.
    ///
    /// # Errors
    ///
    /// Returns `StartTimeImmutable` if a different start time is already set.
    pub fn set_start_time_once(&mut self, at: DateTime<Utc>) -> Result<()> {
        match self.start_time {
            None => {
                self.start_time = Some(at);
                Ok(())
            }
            Some(existing) if existing == at => Ok(()),
            Some(_) => Err(Error::start_time_immutable(self.key.to_string())),
        }
    }

    /// Move to `target`, validating the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when the lifecycle forbids the move.
    pub fn transition(&mut self, target: Phase) -> Result<()> {
        if !self.phase.can_transition_to(target) {
            return Err(Error::invalid_transition(
                self.key.to_string(),
                self.phase.as_str(),
                target.as_str(),
            ));
        }
        self.phase = target;
        Ok(())
    }
}

/// Why a key was put on the work queue. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueReason {
    /// The object itself changed.
    WatchEvent,
    /// Its run timeout expired.
    Timeout,
    /// A watched child changed.
    DependencyChange,
    /// Retry after a transient failure or on request.
    Requeue,
}

impl fmt::Display for EnqueueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WatchEvent => "watch_event",
            Self::Timeout => "timeout",
            Self::DependencyChange => "dependency_change",
            Self::Requeue => "requeue",
        };
        f.write_str(name)
    }
}

/// A key handed to a worker together with the reasons it was enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub key: Key,
    /// Reasons collected while the key was pending, in arrival order, deduplicated.
    pub reasons: Vec<EnqueueReason>,
}

impl WorkItem {
    /// Check if the item was enqueued by a timeout.
    pub fn is_timeout(&self) -> bool {
        self.reasons.contains(&EnqueueReason::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_parse() {
        let key = Key::new("ci", "build-42");
        assert_eq!(key.to_string(), "ci/build-42");
        assert_eq!("ci/build-42".parse::<Key>(), Ok(key));
    }

    #[test]
    fn test_key_parse_rejects_malformed() {
        assert!("no-slash".parse::<Key>().is_err());
        assert!("/name".parse::<Key>().is_err());
        assert!("ns/".parse::<Key>().is_err());
        assert!("a/b/c".parse::<Key>().is_err());
    }

    #[test]
    fn test_terminal_phases() {
        assert!(!Phase::Pending.is_terminal());
        assert!(!Phase::Running.is_terminal());
        assert!(Phase::Succeeded.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::TimedOut.is_terminal());
        assert!(Phase::Cancelled.is_terminal());
    }

    #[test]
    fn test_terminal_phases_are_absorbing() {
        for from in Phase::ALL.iter().filter(|p| p.is_terminal()) {
            for to in Phase::ALL {
                assert_eq!(from.can_transition_to(to), *from == to, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_running_cannot_be_reentered() {
        assert!(Phase::Pending.can_transition_to(Phase::Running));
        assert!(!Phase::Running.can_transition_to(Phase::Pending));
        assert!(!Phase::Pending.can_transition_to(Phase::TimedOut));
    }

    #[test]
    fn test_start_time_set_once() {
        let mut obj = ManagedObject::new("PipelineRun", Key::new("ci", "run"));
        let t0 = Utc::now();
        assert!(obj.set_start_time_once(t0).is_ok());
        assert!(obj.set_start_time_once(t0).is_ok());
        let later = t0 + chrono::Duration::seconds(5);
        assert!(obj.set_start_time_once(later).is_err());
        assert_eq!(obj.start_time, Some(t0));
    }

    #[test]
    fn test_owner_refs() {
        let parent = ObjectRef::new("PipelineRun", Key::new("ci", "run"));
        let child = ManagedObject::new("StepRun", Key::new("ci", "run-step-0"))
            .with_owner(parent.clone())
            .with_owner(parent.clone());
        assert_eq!(child.owner_refs.len(), 1);
        assert!(child.is_owned_by(&parent));
    }

    #[test]
    fn test_resource_version_next() {
        let v = ResourceVersion::new(3);
        assert_eq!(v.next().as_u64(), 4);
        assert_eq!(ResourceVersion::new(u64::MAX).next().as_u64(), u64::MAX);
    }

    #[test]
    fn test_work_item_timeout() {
        let item = WorkItem {
            key: Key::new("ci", "run"),
            reasons: vec![EnqueueReason::WatchEvent, EnqueueReason::Timeout],
        };
        assert!(item.is_timeout());
    }
}
