//! FDS Common - Shared types and utilities
//!
//! This crate provides the identifiers, error taxonomy, configuration,
//! lifecycle and request-dispatch primitives used by the Storage Manager
//! and Data Manager.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod migration;
pub mod qos;
pub mod timer;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use lifecycle::{Lifecycle, LifecycleSet};
pub use migration::{
    IoReqGuard, MigrationSeqNumReceiver, MigrationTrackIoReqs, OwnedIoReqGuard,
};
pub use qos::{Priority, QosDispatcher, QueueId, TokenBucket};
pub use timer::PeriodicTask;
pub use types::*;
