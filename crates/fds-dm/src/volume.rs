//! One volume served by this DM: catalog, commit log and the I/O tracker
//! migrations use to quiesce it

use crate::catalog::DmVolumeCatalog;
use crate::commit_log::DmCommitLog;
use crate::persist::vol_dir;
use dashmap::DashMap;
use fds_common::config::DmConfig;
use fds_common::{MigrationTrackIoReqs, Result, VolumeId};
use std::path::Path;
use std::sync::Arc;

/// Volumes open on this node
pub type VolumeTable = DashMap<VolumeId, Arc<DmVolume>>;

pub struct DmVolume {
    vol: VolumeId,
    commit_log: DmCommitLog,
    io: Arc<MigrationTrackIoReqs>,
}

impl DmVolume {
    /// Open the catalog and journal of `vol` under `root`
    pub fn open(root: &Path, vol: VolumeId, config: &DmConfig) -> Result<Self> {
        let catalog = Arc::new(DmVolumeCatalog::open(root, vol, config.max_object_size)?);
        let commit_log = DmCommitLog::open(catalog, vol_dir(root, vol), config.journal_file_size)?;
        Ok(Self {
            vol,
            commit_log,
            io: Arc::new(MigrationTrackIoReqs::new()),
        })
    }

    pub const fn vol(&self) -> VolumeId {
        self.vol
    }

    pub fn catalog(&self) -> &DmVolumeCatalog {
        self.commit_log.catalog()
    }

    pub const fn commit_log(&self) -> &DmCommitLog {
        &self.commit_log
    }

    pub const fn io_tracker(&self) -> &Arc<MigrationTrackIoReqs> {
        &self.io
    }
}
