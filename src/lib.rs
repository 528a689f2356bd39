#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # Runwarden
//!
//! Event-driven controller that drives pipeline runs to completion.
//!
//! This library holds the binary's bootstrap pieces and re-exports the
//! workspace crates for convenience.

pub use runwarden_core;
pub use runwarden_events;
pub use runwarden_reconciler;

pub mod cli;
pub mod config;
pub mod demo;
