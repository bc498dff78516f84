//! FDS Storage Manager
//!
//! This crate implements the content-addressed object store of an SM node:
//! - Token files on HDD / SSD disks (`DataIo`)
//! - Object metadata (WAL + ordered index + ARC cache)
//! - Deduplicating put / get / delete with per-volume reference counts
//! - Tier placement and the hybrid tier controller
//! - Scavenger compaction of unreferenced objects
//! - SM token migration driven by DLT changes

pub mod data_cache;
pub mod data_io;
pub mod lock_table;
pub mod meta;
pub mod migration;
pub mod object_store;
pub mod request;
pub mod scavenger;
pub mod service;
pub mod tier;

// Re-exports
pub use data_io::{DataIo, DataIoConfig, TokenFileStats};
pub use meta::{ObjMetaData, ObjPhyLoc, ObjectMetadataStore};
pub use migration::{
    ReceiverState, SenderState, SmMigrationMsg, SmMigrationTransport, SyncPhase, TokenMigrationMgr,
};
pub use object_store::{ObjectStore, ObjectStoreConfig, PutOutcome};
pub use request::{SmCallback, SmIoReq, SmRequestHandler};
pub use scavenger::{CompactStats, ScavControl, TokenCompactor};
pub use service::StorageManager;
pub use tier::{
    HybridTierCtrlr, RankEngine, TierPutAlgorithm, TierRunStats, VolumeDesc, VolumePolicyTable,
};
