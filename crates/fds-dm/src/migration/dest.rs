//! Destination-side application of migrated blobs
//!
//! Object lists arrive ahead of, or interleaved with, the descriptors
//! that publish them. Lists are staged by blob name; a descriptor is
//! applied as a regular commit-log transaction that installs the staged
//! list under the source's version.

use super::messages::DeltaBlob;
use crate::blob::{BlobMetaDesc, BlobObjectList, MetadataPair};
use crate::commit_log::{DmCommitLog, TxMode};
use fds_common::{BlobTxId, Result, VolumeId};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Transaction ids at or above this are reserved for migration
pub const MIGRATION_TX_BASE: u64 = 1 << 63;

pub struct DmMigrationDest {
    vol: VolumeId,
    staged: HashMap<String, BlobObjectList>,
    deferred: Vec<BlobMetaDesc>,
    next_tx: u64,
    applied: usize,
}

impl DmMigrationDest {
    pub fn new(vol: VolumeId) -> Self {
        Self {
            vol,
            staged: HashMap::new(),
            deferred: Vec::new(),
            next_tx: MIGRATION_TX_BASE,
            applied: 0,
        }
    }

    pub fn stage_blobs(&mut self, blobs: Vec<DeltaBlob>) {
        for blob in blobs {
            self.staged.insert(blob.name, blob.objects);
        }
    }

    /// Hold descriptors until every object list has arrived
    pub fn defer_descs(&mut self, descs: Vec<BlobMetaDesc>) {
        self.deferred.extend(descs);
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Blobs installed or removed so far
    pub const fn applied(&self) -> usize {
        self.applied
    }

    pub fn apply_deferred(&mut self, commit_log: &DmCommitLog) -> Result<usize> {
        let descs = std::mem::take(&mut self.deferred);
        self.apply_descs(commit_log, descs)
    }

    pub fn apply_descs(
        &mut self,
        commit_log: &DmCommitLog,
        descs: Vec<BlobMetaDesc>,
    ) -> Result<usize> {
        let count = descs.len();
        for desc in descs {
            self.apply_one(commit_log, desc)?;
        }
        Ok(count)
    }

    fn apply_one(&mut self, commit_log: &DmCommitLog, desc: BlobMetaDesc) -> Result<()> {
        let tx = BlobTxId::new(self.next_tx);
        self.next_tx += 1;
        commit_log.start_tx(tx, &desc.name, TxMode::Migrated { version: desc.version })?;

        let staged = if desc.is_deleted() {
            commit_log.delete_blob(tx)
        } else {
            let objects = self.staged.remove(&desc.name).unwrap_or_default();
            let pairs: Vec<_> = desc
                .metadata
                .iter()
                .map(|(k, v)| MetadataPair::new(k.clone(), v.clone()))
                .collect();
            commit_log
                .update_catalog(tx, &objects)
                .and_then(|()| commit_log.set_blob_metadata(tx, &pairs))
        };
        if let Err(e) = staged {
            if let Err(abort) = commit_log.abort(tx) {
                warn!("{} could not abort {} for {}: {}", self.vol, tx, desc.name, abort);
            }
            return Err(e);
        }
        // A failed commit has already dropped the transaction
        commit_log.commit(tx)?;
        self.applied += 1;
        debug!("{} installed migrated blob {} v{}", self.vol, desc.name, desc.version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DmVolumeCatalog;
    use fds_common::ObjectId;
    use std::sync::Arc;
    use tempfile::tempdir;

    const MAX: u64 = 256;

    #[test]
    fn test_installs_staged_lists_and_deletes() {
        let dir = tempdir().unwrap();
        let vol = VolumeId::new(4);
        let catalog = Arc::new(DmVolumeCatalog::open(dir.path(), vol, MAX).unwrap());
        let log = DmCommitLog::open(catalog, dir.path().join("j"), 1 << 20).unwrap();

        // A local blob the source no longer has
        log.start_tx(BlobTxId::new(1), "gone", TxMode::Update).unwrap();
        log.update_catalog(
            BlobTxId::new(1),
            &[(0, ObjectId::from_data(b"g"), 1)].into_iter().collect(),
        )
        .unwrap();
        log.commit(BlobTxId::new(1)).unwrap();

        let mut dest = DmMigrationDest::new(vol);
        dest.stage_blobs(vec![DeltaBlob {
            name: "kept".into(),
            objects: [(0, ObjectId::from_data(b"k"), MAX)].into_iter().collect(),
        }]);
        let mut kept = BlobMetaDesc::new("kept");
        kept.version = 9;
        kept.metadata.insert("k".into(), "v".into());
        dest.defer_descs(vec![kept, BlobMetaDesc::new("gone")]);
        assert!(dest.has_deferred());
        assert_eq!(dest.apply_deferred(&log).unwrap(), 2);
        assert_eq!(dest.applied(), 2);

        let blob = log.catalog().get_blob("kept").unwrap();
        assert_eq!(blob.desc.version, 9);
        assert_eq!(blob.desc.metadata["k"], "v");
        assert_eq!(blob.objects.len(), 1);
        assert!(log.catalog().get_blob_meta("gone").unwrap_err().is_not_found());
        assert_eq!(log.open_txs(), 0);
    }

    #[test]
    fn test_rejected_list_leaves_no_open_tx() {
        let dir = tempdir().unwrap();
        let vol = VolumeId::new(4);
        let catalog = Arc::new(DmVolumeCatalog::open(dir.path(), vol, MAX).unwrap());
        let log = DmCommitLog::open(catalog, dir.path().join("j"), 1 << 20).unwrap();
        let mut dest = DmMigrationDest::new(vol);
        let mut desc = BlobMetaDesc::new("b");
        desc.version = 3;

        // Offset off the object grid
        dest.stage_blobs(vec![DeltaBlob {
            name: "b".into(),
            objects: [(7, ObjectId::from_data(b"bad"), MAX)].into_iter().collect(),
        }]);
        assert!(dest.apply_descs(&log, vec![desc.clone()]).is_err());
        assert_eq!(log.open_txs(), 0);
        assert_eq!(dest.applied(), 0);

        dest.stage_blobs(vec![DeltaBlob {
            name: "b".into(),
            objects: [(0, ObjectId::from_data(b"good"), MAX)].into_iter().collect(),
        }]);
        assert_eq!(dest.apply_descs(&log, vec![desc]).unwrap(), 1);
        assert_eq!(log.catalog().get_blob("b").unwrap().desc.version, 3);
    }
}
