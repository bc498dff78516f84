//! DM volume migration
//!
//! When a DMT adds this node to a volume's group, the executor blocks the
//! volume, sends the old primary the blob versions it already holds and
//! applies the deltas that come back through the commit log. The old
//! primary's source streams those deltas in bounded batches and finishes
//! once every batch has been acknowledged.

mod base;
mod dest;
mod executor;
mod messages;
mod mgr;
mod src;

pub use base::DmMigrationBase;
pub use dest::{DmMigrationDest, MIGRATION_TX_BASE};
pub use executor::{DmMigrationExecutor, ExecutorEffect, ExecutorEvent, ExecutorState};
pub use messages::{DeltaBlob, DmMigrationMsg, DmMigrationTransport};
pub use mgr::DmMigrationMgr;
pub use src::{DeltaSet, DmMigrationSrc, SrcEffect, SrcEvent, SrcState, build_deltas};
