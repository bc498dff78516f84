//! FDS Data Manager
//!
//! This crate implements the volume catalogs of a DM node:
//! - Typed catalog keys and blob records stored in one redb file per volume
//! - Blob transactions journaled before they reach the catalog
//! - Client requests queued per volume and completed through callbacks
//! - Journal rotation, replay on reopen and pruning
//! - Catalog snapshots and the object expunge list
//! - DM volume migration driven by DMT changes

pub mod blob;
pub mod catalog;
pub mod commit_log;
pub mod journal;
pub mod keys;
pub mod migration;
pub mod persist;
pub mod request;
pub mod service;
pub mod volume;

// Re-exports
pub use blob::{BlobMetaDesc, BlobNode, BlobObjectInfo, BlobObjectList, MetadataPair};
pub use catalog::{DmVolumeCatalog, VolumeStats};
pub use commit_log::{BlobTxUpdate, CommitOutcome, DmCommitLog, TxMode};
pub use journal::{DmTvcOperationJournal, JournalRecord};
pub use migration::{
    DmMigrationMgr, DmMigrationMsg, DmMigrationTransport, ExecutorState, SrcState,
};
pub use persist::{DmPersistVolDir, RedbVolDir};
pub use request::{DmCallback, DmIoReq};
pub use service::DataManager;
pub use volume::{DmVolume, VolumeTable};
