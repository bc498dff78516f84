//! Volume catalog: blob descriptors and object lists of one volume
//!
//! Committed transactions are the only writers. Each commit lands as one
//! batch holding the blob descriptor, every touched extent, expunge
//! records for objects the commit dereferenced, and the volume record
//! with the journal sequence the commit was logged under.

use crate::blob::{BlobMetaDesc, BlobNode, BlobObjectList};
use crate::commit_log::{BlobTxUpdate, TxMode};
use crate::keys::{self, CatalogKeyType};
use crate::persist::{CatWriteBatch, DmPersistVolDir, RedbVolDir};
use fds_common::{
    BLOB_VERSION_DELETED, BLOB_VERSION_INITIAL, BlobVersion, Error, ObjectId, Result, VolumeId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Record stored under the volume metadata key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMetaDesc {
    pub vol: VolumeId,
    pub max_object_size: u64,
    /// Journal sequence of the last commit applied to this catalog
    pub last_applied_seq: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolumeStats {
    pub blobs: u64,
    pub bytes: u64,
    pub objects: u64,
}

pub struct DmVolumeCatalog {
    vol: VolumeId,
    persist: Box<dyn DmPersistVolDir>,
    max_object_size: u64,
    last_applied_seq: AtomicU64,
    write_lock: Mutex<()>,
}

impl DmVolumeCatalog {
    /// Open the redb catalog of `vol` under `root`
    pub fn open(root: impl AsRef<Path>, vol: VolumeId, max_object_size: u64) -> Result<Self> {
        let persist = RedbVolDir::open(root, vol)?;
        Self::with_persist(Box::new(persist), max_object_size)
    }

    /// Catalog over an already opened store; an existing volume record
    /// keeps the object size it was created with
    pub fn with_persist(persist: Box<dyn DmPersistVolDir>, max_object_size: u64) -> Result<Self> {
        if max_object_size == 0 {
            return Err(Error::invalid_argument("max object size must be non-zero"));
        }
        let vol = persist.vol_id();
        let desc = match persist.get(&keys::volume_metadata_key())? {
            Some(raw) => bincode::deserialize::<VolumeMetaDesc>(&raw)?,
            None => {
                let desc = VolumeMetaDesc {
                    vol,
                    max_object_size,
                    last_applied_seq: 0,
                };
                let mut batch = CatWriteBatch::new();
                batch.put(keys::volume_metadata_key(), bincode::serialize(&desc)?);
                persist.write_batch(batch)?;
                desc
            }
        };
        info!(
            "Opened catalog of {} (object size {}, applied through {})",
            vol, desc.max_object_size, desc.last_applied_seq
        );
        Ok(Self {
            vol,
            persist,
            max_object_size: desc.max_object_size,
            last_applied_seq: AtomicU64::new(desc.last_applied_seq),
            write_lock: Mutex::new(()),
        })
    }

    pub const fn vol(&self) -> VolumeId {
        self.vol
    }

    pub const fn max_object_size(&self) -> u64 {
        self.max_object_size
    }

    pub fn last_applied_seq(&self) -> u64 {
        self.last_applied_seq.load(Ordering::SeqCst)
    }

    fn read_desc(&self, name: &str) -> Result<Option<BlobMetaDesc>> {
        self.persist
            .get(&keys::blob_metadata_key(name))?
            .map(|raw| BlobMetaDesc::unmarshall(&raw))
            .transpose()
    }

    pub fn get_blob_meta(&self, name: &str) -> Result<BlobMetaDesc> {
        self.read_desc(name)?
            .ok_or_else(|| Error::not_found(format!("blob {name} in {}", self.vol)))
    }

    /// Complete object list of a blob; empty if it has none
    pub fn get_blob_objects(&self, name: &str) -> Result<BlobObjectList> {
        let mut list = BlobObjectList::new();
        for (_, raw) in self.persist.scan_prefix(&keys::blob_objects_prefix(name))? {
            list.merge(&BlobObjectList::unmarshall(&raw)?);
        }
        Ok(list)
    }

    pub fn get_blob(&self, name: &str) -> Result<BlobNode> {
        let desc = self.get_blob_meta(name)?;
        let objects = self.get_blob_objects(name)?;
        Ok(BlobNode { desc, objects })
    }

    pub fn list_blobs(&self) -> Result<Vec<BlobMetaDesc>> {
        self.persist
            .scan_prefix(&keys::type_prefix(CatalogKeyType::BlobMetadata))?
            .into_iter()
            .map(|(_, raw)| BlobMetaDesc::unmarshall(&raw))
            .collect()
    }

    /// Name -> version of every blob
    pub fn blob_versions(&self) -> Result<BTreeMap<String, BlobVersion>> {
        Ok(self
            .list_blobs()?
            .into_iter()
            .map(|d| (d.name, d.version))
            .collect())
    }

    pub fn stat(&self) -> Result<VolumeStats> {
        let mut stats = VolumeStats::default();
        for desc in self.list_blobs()? {
            stats.blobs += 1;
            stats.bytes += desc.size;
        }
        for (_, raw) in self
            .persist
            .scan_prefix(&keys::type_prefix(CatalogKeyType::BlobObjects))?
        {
            stats.objects += BlobObjectList::unmarshall(&raw)?.len() as u64;
        }
        Ok(stats)
    }

    /// Objects awaiting dereference in the SM, with the number of
    /// references to drop for each
    pub fn expunge_list(&self) -> Result<Vec<(ObjectId, u32)>> {
        let mut out = Vec::new();
        for (key, raw) in self
            .persist
            .scan_prefix(&keys::type_prefix(CatalogKeyType::ObjectExpunge))?
        {
            if let Some((_, oid)) = keys::parse_object_expunge_key(&key) {
                out.push((oid, bincode::deserialize::<u32>(&raw)?));
            }
        }
        Ok(out)
    }

    /// Forget expunge records once the SM has dropped the references
    pub fn clear_expunged(&self, oids: &[ObjectId]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut batch = CatWriteBatch::new();
        for oid in oids {
            batch.delete(keys::object_expunge_key(self.vol, oid));
        }
        self.persist.write_batch(batch)
    }

    /// Apply a committed transaction logged under journal sequence `seq`,
    /// returning the blob's new descriptor
    pub fn apply(
        &self,
        seq: u64,
        update: &BlobTxUpdate,
        committed_at: u64,
    ) -> Result<BlobMetaDesc> {
        let _guard = self.write_lock.lock();
        let name = update.blob.as_str();
        let old = self.read_desc(name)?;
        let mut batch = CatWriteBatch::new();
        let mut expunged: HashMap<ObjectId, u32> = HashMap::new();
        let mut dereference = |oid: ObjectId| *expunged.entry(oid).or_insert(0) += 1;

        let desc = if update.delete {
            if old.is_none() && !matches!(update.mode, TxMode::Migrated { .. }) {
                return Err(Error::not_found(format!("blob {name} in {}", self.vol)));
            }
            for (_, info) in self.get_blob_objects(name)?.iter() {
                dereference(info.oid);
            }
            batch.delete(keys::blob_metadata_key(name));
            batch.delete_prefix(keys::blob_objects_prefix(name));
            let mut desc = old.unwrap_or_else(|| BlobMetaDesc::new(name));
            desc.version = BLOB_VERSION_DELETED;
            desc.mod_time = committed_at;
            desc
        } else {
            let next_version = old
                .as_ref()
                .map_or(BLOB_VERSION_INITIAL, |d| d.version + 1);
            let mut desc = match update.mode {
                TxMode::Update => old.clone().unwrap_or_else(|| BlobMetaDesc::new(name)),
                TxMode::Replace | TxMode::Migrated { .. } => BlobMetaDesc::new(name),
            };
            desc.version = match update.mode {
                TxMode::Migrated { version } => version,
                TxMode::Update | TxMode::Replace => next_version,
            };
            desc.apply_pairs(&update.metadata);
            desc.mod_time = committed_at;

            let new_extents = update.objects.extents(self.max_object_size);
            match update.mode {
                TxMode::Update => {
                    for (extent, part) in &new_extents {
                        let key = keys::blob_objects_key(name, *extent);
                        let mut merged = match self.persist.get(&key)? {
                            Some(raw) => BlobObjectList::unmarshall(&raw)?,
                            None => BlobObjectList::new(),
                        };
                        for (off, info) in part.iter() {
                            if let Some(prev) = merged.insert(off, info.oid, info.size)
                                && prev.oid != info.oid
                            {
                                dereference(prev.oid);
                            }
                        }
                        batch.put(key, merged.marshall()?);
                    }
                    let old_size = old.as_ref().map_or(0, |d| d.size);
                    desc.size = old_size.max(update.objects.end_offset());
                }
                TxMode::Replace | TxMode::Migrated { .. } => {
                    for (off, info) in self.get_blob_objects(name)?.iter() {
                        if update.objects.get(off).is_none_or(|n| n.oid != info.oid) {
                            dereference(info.oid);
                        }
                    }
                    batch.delete_prefix(keys::blob_objects_prefix(name));
                    for (extent, part) in &new_extents {
                        batch.put(keys::blob_objects_key(name, *extent), part.marshall()?);
                    }
                    desc.size = update.objects.end_offset();
                }
            }
            batch.put(keys::blob_metadata_key(name), desc.marshall()?);
            desc
        };

        for (oid, count) in expunged {
            let key = keys::object_expunge_key(self.vol, &oid);
            let pending = match self.persist.get(&key)? {
                Some(raw) => bincode::deserialize::<u32>(&raw)?,
                None => 0,
            };
            batch.put(key, bincode::serialize(&(pending + count))?);
        }
        let vol_desc = VolumeMetaDesc {
            vol: self.vol,
            max_object_size: self.max_object_size,
            last_applied_seq: seq,
        };
        batch.put(keys::volume_metadata_key(), bincode::serialize(&vol_desc)?);

        self.persist.write_batch(batch)?;
        self.last_applied_seq.store(seq, Ordering::SeqCst);
        debug!(
            "{} blob {} -> version {} (seq {})",
            self.vol, name, desc.version, seq
        );
        Ok(desc)
    }

    pub fn snapshot(&self, snap_id: u64) -> Result<PathBuf> {
        let _guard = self.write_lock.lock();
        self.persist.snapshot(snap_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MetadataPair;
    use tempfile::tempdir;

    const MAX: u64 = 1024;

    fn oid(n: u32) -> ObjectId {
        ObjectId::from_data(&n.to_le_bytes())
    }

    fn update(blob: &str, mode: TxMode, objects: &[(u64, u32)]) -> BlobTxUpdate {
        BlobTxUpdate {
            blob: blob.to_string(),
            mode,
            objects: objects.iter().map(|(off, n)| (*off, oid(*n), MAX)).collect(),
            metadata: vec![MetadataPair::new("owner", "ops")],
            delete: false,
        }
    }

    #[test]
    fn test_update_merges_and_expunges_overwritten() {
        let dir = tempdir().unwrap();
        let cat = DmVolumeCatalog::open(dir.path(), VolumeId::new(1), MAX).unwrap();

        let desc = cat.apply(1, &update("b", TxMode::Update, &[(0, 1), (MAX, 2)]), 10).unwrap();
        assert_eq!(desc.version, BLOB_VERSION_INITIAL);
        assert_eq!(desc.size, 2 * MAX);

        let desc = cat.apply(2, &update("b", TxMode::Update, &[(MAX, 3)]), 20).unwrap();
        assert_eq!(desc.version, 2);
        let objects = cat.get_blob_objects("b").unwrap();
        assert_eq!(objects.get(0).unwrap().oid, oid(1));
        assert_eq!(objects.get(MAX).unwrap().oid, oid(3));
        assert_eq!(cat.expunge_list().unwrap(), vec![(oid(2), 1)]);
        assert_eq!(cat.last_applied_seq(), 2);
    }

    #[test]
    fn test_replace_and_delete() {
        let dir = tempdir().unwrap();
        let cat = DmVolumeCatalog::open(dir.path(), VolumeId::new(2), MAX).unwrap();
        cat.apply(1, &update("b", TxMode::Update, &[(0, 1), (MAX, 2)]), 1).unwrap();
        let desc = cat.apply(2, &update("b", TxMode::Replace, &[(0, 1)]), 2).unwrap();
        assert_eq!(desc.size, MAX);
        assert_eq!(cat.get_blob_objects("b").unwrap().len(), 1);
        assert_eq!(cat.expunge_list().unwrap(), vec![(oid(2), 1)]);

        let mut delete = update("b", TxMode::Update, &[]);
        delete.delete = true;
        cat.apply(3, &delete, 3).unwrap();
        assert!(cat.get_blob_meta("b").unwrap_err().is_not_found());
        assert!(cat.get_blob_objects("b").unwrap().is_empty());
        let expunge: BTreeMap<_, _> = cat.expunge_list().unwrap().into_iter().collect();
        assert_eq!(expunge[&oid(1)], 1);
        assert_eq!(expunge[&oid(2)], 1);
        assert!(cat.apply(4, &delete, 4).unwrap_err().is_not_found());

        cat.clear_expunged(&[oid(1), oid(2)]).unwrap();
        assert!(cat.expunge_list().unwrap().is_empty());
    }

    #[test]
    fn test_migrated_version_is_kept_and_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let vol = VolumeId::new(3);
        {
            let cat = DmVolumeCatalog::open(dir.path(), vol, MAX).unwrap();
            cat.apply(5, &update("m", TxMode::Migrated { version: 17 }, &[(0, 9)]), 1).unwrap();
        }
        // The stored object size wins over the one passed on reopen
        let cat = DmVolumeCatalog::open(dir.path(), vol, MAX * 2).unwrap();
        assert_eq!(cat.max_object_size(), MAX);
        assert_eq!(cat.last_applied_seq(), 5);
        let blob = cat.get_blob("m").unwrap();
        assert_eq!(blob.desc.version, 17);
        assert_eq!(blob.desc.metadata["owner"], "ops");
        assert_eq!(
            cat.stat().unwrap(),
            VolumeStats {
                blobs: 1,
                bytes: MAX,
                objects: 1
            }
        );
    }
}
