//! Event-driven reconciliation engine.
//!
//! This crate drives managed objects through their lifecycle in response to
//! store changes:
//!
//! - **Cache**: [`ObjectCache`] mirrors one object kind, fed by an
//!   [`Informer`], with a [`DependencyIndex`] of child-to-owner relations
//! - **Queue**: [`WorkQueue`] deduplicates keys and hands each key to at most
//!   one worker at a time
//! - **Dependencies**: [`DependencyTracker`] maps child changes back to the
//!   parents watching them
//! - **Timeouts**: [`TimeoutSupervisor`] bounds how long an object may stay
//!   `Running`, across restarts
//! - **Loop**: [`Controller`] runs the workers that call your [`Reconciler`]
//! - **Metrics**: [`MetricsReporter`] publishes per-phase gauges
//!
//! # Lifecycle
//!
//! ```text
//! Pending --> Running --> Succeeded | Failed | TimedOut | Cancelled
//! ```
//!
//! Terminal phases are absorbing. Entering `Running` arms a timeout computed
//! from the object's start time; leaving it disarms the timeout.
//!
//! # Example
//!
//! ```ignore
//! use runwarden_events::InMemoryObjectStore;
//! use runwarden_reconciler::{Controller, ControllerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let controller = Controller::builder()
//!     .with_store(InMemoryObjectStore::new_arc())
//!     .with_reconciler(Arc::new(MyReconciler))
//!     .for_kind("PipelineRun")
//!     .owns("StepRun")
//!     .with_config(ControllerConfig::default().with_workers(4))
//!     .build()?;
//!
//! let cancel = CancellationToken::new();
//! controller.run(cancel.clone()).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod informer;
pub mod r#loop;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod timeout;
pub mod tracker;

pub use cache::{ChangeListener, DependencyIndex, ObjectCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ControllerConfig;
pub use error::{Error, Result};
pub use informer::Informer;
pub use metrics::{
    InMemoryMetricsSink, MetricsReporter, MetricsSink, RejectingMetricsSink, TracingMetricsSink,
};
pub use queue::WorkQueue;
pub use r#loop::{Controller, ControllerBuilder, ControllerHandle};
pub use reconciler::{ReconcileError, ReconcileOutcome, Reconciler, TracingReconciler};
pub use timeout::{Recovery, TimeoutCallback, TimeoutSupervisor};
pub use tracker::DependencyTracker;
