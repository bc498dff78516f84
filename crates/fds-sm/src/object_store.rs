//! Content-addressed object store
//!
//! Objects are keyed by the SHA-1 of their bytes. A put of an id that is
//! already stored only adds a volume reference. Deletes drop references;
//! the bytes stay readable until the scavenger reclaims them.
//!
//! Every metadata mutation of one object happens under its lock-table
//! bucket.

use crate::data_cache::ObjectDataCache;
use crate::data_io::{DataIo, DataIoConfig};
use crate::lock_table::ObjectLockTable;
use crate::meta::{MetaStoreConfig, ObjMetaData, ObjectMetadataStore, WalConfig};
use crate::tier::{
    RandomTestAlgo, RankEngine, RankTierPutAlgo, TierPutAlgorithm, VolumeDesc, VolumePolicyTable,
};
use bytes::Bytes;
use fds_common::config::{SmConfig, TierAlgorithm, TieringConfig};
use fds_common::{DiskId, Error, MediaPolicy, ObjectId, Result, SmTokenId, Tier, VolumeId};
use fds_placement::{ObjectLocationTable, SmTokenPlacement};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a successful put
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    /// Tier holding the object's bytes
    pub tier: Tier,
    /// The bytes were already stored; only a reference was added
    pub deduped: bool,
}

#[derive(Clone, Debug)]
pub struct ObjectStoreConfig {
    pub root: PathBuf,
    pub sm: SmConfig,
    pub tiering: TieringConfig,
    pub data: DataIoConfig,
    pub meta: MetaStoreConfig,
}

impl ObjectStoreConfig {
    pub fn new(root: impl AsRef<Path>, sm: SmConfig, tiering: TieringConfig) -> Self {
        let root = root.as_ref().to_path_buf();
        let data = DataIoConfig {
            max_file_size: sm.max_token_file_size,
            read_retries: sm.disk_read_retries,
            sync_writes: sm.sync_writes,
            ..DataIoConfig::new(root.join("data"), sm.token_bits)
        };
        let meta = MetaStoreConfig {
            cache_entries: sm.meta_cache_entries,
            wal: WalConfig {
                sync_on_write: sm.sync_writes,
                ..WalConfig::default()
            },
            ..MetaStoreConfig::with_data_dir(root.join("meta"))
        };
        Self {
            root,
            sm,
            tiering,
            data,
            meta,
        }
    }
}

pub struct ObjectStore {
    meta: ObjectMetadataStore,
    data: DataIo,
    data_cache: ObjectDataCache,
    locks: ObjectLockTable,
    policies: Arc<VolumePolicyTable>,
    rank: Arc<RankEngine>,
    put_algo: Box<dyn TierPutAlgorithm>,
    unavailable_tokens: RwLock<HashSet<SmTokenId>>,
    verify_dedup: bool,
    token_bits: u32,
}

impl ObjectStore {
    pub fn open(config: ObjectStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)?;
        let olt = Arc::new(Self::load_olt(&config.root, &config.sm)?);

        let rank = Arc::new(RankEngine::new(config.tiering.ssd_rank_table_size));
        let put_algo: Box<dyn TierPutAlgorithm> = match config.tiering.algorithm {
            TierAlgorithm::Rank => Box::new(RankTierPutAlgo::new(Arc::clone(&rank))),
            TierAlgorithm::RandomTest => {
                Box::new(RandomTestAlgo::new(u32::from(config.tiering.random_ssd_percent)))
            }
        };

        let store = Self {
            meta: ObjectMetadataStore::open(config.meta)?,
            data: DataIo::open(config.data, olt)?,
            data_cache: ObjectDataCache::new(config.sm.data_cache_entries),
            locks: ObjectLockTable::new(config.sm.lock_buckets),
            policies: Arc::new(VolumePolicyTable::new()),
            rank,
            put_algo,
            unavailable_tokens: RwLock::new(HashSet::new()),
            verify_dedup: config.sm.verify_dedup_content,
            token_bits: config.sm.token_bits,
        };
        info!(
            "Opened object store at {:?} ({} objects, {} token bits)",
            config.root,
            store.meta.len(),
            store.token_bits
        );
        Ok(store)
    }

    /// Load the persisted OLT, or compute and persist one
    fn load_olt(root: &Path, sm: &SmConfig) -> Result<ObjectLocationTable> {
        let path = root.join("olt.bin");
        let num_tokens = 1u32 << sm.token_bits;
        if path.exists() {
            let olt = ObjectLocationTable::unmarshall(&std::fs::read(&path)?)?;
            if olt.num_tokens() != num_tokens {
                return Err(Error::Configuration(format!(
                    "stored OLT has {} tokens, configuration wants {num_tokens}",
                    olt.num_tokens()
                )));
            }
            return Ok(olt);
        }
        let hdd: Vec<DiskId> = sm.hdd_disks.iter().copied().map(DiskId::new).collect();
        let ssd: Vec<DiskId> = sm.ssd_disks.iter().copied().map(DiskId::new).collect();
        let olt = SmTokenPlacement::compute(num_tokens, &hdd, &ssd)?;
        std::fs::write(&path, olt.marshall()?)?;
        Ok(olt)
    }

    pub const fn token_bits(&self) -> u32 {
        self.token_bits
    }

    pub fn token_of(&self, oid: &ObjectId) -> SmTokenId {
        oid.token(self.token_bits)
    }

    pub fn policies(&self) -> &Arc<VolumePolicyTable> {
        &self.policies
    }

    pub fn rank_engine(&self) -> &Arc<RankEngine> {
        &self.rank
    }

    pub(crate) const fn meta_store(&self) -> &ObjectMetadataStore {
        &self.meta
    }

    pub(crate) const fn data_io(&self) -> &DataIo {
        &self.data
    }

    pub(crate) const fn locks(&self) -> &ObjectLockTable {
        &self.locks
    }

    pub fn register_volume(&self, desc: VolumeDesc) -> Result<()> {
        self.policies.register(desc)
    }

    /// Store `data` under `oid` on behalf of `vol`
    pub fn put_object(&self, vol: VolumeId, oid: &ObjectId, data: &Bytes) -> Result<PutOutcome> {
        if self.verify_dedup && ObjectId::from_data(data) != *oid {
            return Err(Error::HashMismatch(*oid));
        }
        let _guard = self.locks.lock(oid);

        let existing = self.meta.get(oid)?;
        if let Some(mut meta) = existing.clone()
            && let Some(tier) = meta.read_tier()
        {
            if meta.is_deleted() {
                for t in Tier::ALL {
                    if let Some(loc) = meta.location(t) {
                        self.data.account_revived(t, oid, loc, meta.size());
                    }
                }
                debug!("put {} revives unreferenced object", oid);
            }
            meta.add_assoc(vol);
            self.meta.put(&meta)?;
            self.rank.record_access(oid);
            debug!("put {} vol={} dedup refs={}", oid, vol, meta.ref_cnt());
            return Ok(PutOutcome {
                tier,
                deduped: true,
            });
        }

        let size = u32::try_from(data.len())
            .map_err(|_| Error::invalid_argument("object larger than 4GB"))?;
        let desc = self.policies.get(vol);
        let mut tier = self.put_algo.select_tier(oid, desc.as_ref());
        if !self.data.has_tier(tier) {
            tier = tier.other();
        }
        let loc = match self.data.write(tier, oid, data) {
            Err(Error::DiskFull) if tier == Tier::Ssd && self.data.has_tier(Tier::Hdd) => {
                warn!("SSD full writing {}, falling back to hdd", oid);
                tier = Tier::Hdd;
                self.data.write(tier, oid, data)?
            }
            other => other?,
        };

        // Metadata without bytes: reclaimed, or merged from a peer ahead of its data
        let mut meta = existing.unwrap_or_else(|| ObjMetaData::new(*oid, size));
        meta.set_location(tier, loc);
        meta.add_assoc(vol);
        self.meta.put(&meta)?;

        self.rank.record_access(oid);
        if tier == Tier::Ssd
            && let Some(desc) = desc.filter(|d| d.policy == MediaPolicy::Hybrid)
        {
            self.rank.insert(*oid, self.rank.rank(oid, desc.relative_priority));
        }
        debug!("put {} vol={} size={} tier={}", oid, vol, size, tier);
        Ok(PutOutcome {
            tier,
            deduped: false,
        })
    }

    /// Read an object's bytes
    pub fn get_object(&self, vol: VolumeId, oid: &ObjectId) -> Result<Bytes> {
        let token = self.token_of(oid);
        if !self.is_token_available(token) {
            return Err(Error::not_found(format!(
                "{oid}: token {token} is still migrating"
            )));
        }
        if let Some(data) = self.data_cache.get(oid) {
            self.rank.record_access(oid);
            return Ok(data);
        }
        let meta = self
            .meta
            .get(oid)?
            .ok_or_else(|| Error::not_found(oid.to_string()))?;
        let data = match self.read_meta(&meta) {
            Err(e) if e.is_disk_io() => {
                // Compaction may have moved the record and dropped its file
                // since the lookup; it cannot do so again while we hold the lock
                let _guard = self.locks.lock(oid);
                let meta = self
                    .meta
                    .get(oid)?
                    .ok_or_else(|| Error::not_found(oid.to_string()))?;
                debug!("get {} retrying under lock after: {}", oid, e);
                self.read_meta(&meta)?
            }
            res => res?,
        };
        self.rank.record_access(oid);
        self.data_cache.insert(*oid, data.clone());
        debug!("get {} vol={} size={}", oid, vol, data.len());
        Ok(data)
    }

    /// Read through whichever tier holds the bytes, preferring flash
    fn read_meta(&self, meta: &ObjMetaData) -> Result<Bytes> {
        let oid = meta.oid();
        let tier = meta
            .read_tier()
            .ok_or_else(|| Error::not_found(format!("{oid} has been reclaimed")))?;
        let Some(loc) = meta.location(tier) else {
            return Err(Error::not_found(oid.to_string()));
        };
        match self.data.read(tier, oid, loc) {
            Err(e) if e.is_disk_io() => match meta.location(tier.other()) {
                Some(other) => {
                    warn!("Read of {} from {} failed ({}), trying {}", oid, tier, e, tier.other());
                    self.data.read(tier.other(), oid, other)
                }
                None => Err(e),
            },
            res => res,
        }
    }

    /// Drop one reference from `vol`; returns the remaining reference count
    pub fn delete_object(&self, vol: VolumeId, oid: &ObjectId) -> Result<u64> {
        let _guard = self.locks.lock(oid);
        let mut meta = self
            .meta
            .get(oid)?
            .ok_or_else(|| Error::not_found(oid.to_string()))?;
        if !meta.remove_assoc(vol) {
            return Err(Error::not_found(format!("{oid} is not referenced by {vol}")));
        }
        if meta.is_deleted() {
            for tier in Tier::ALL {
                if let Some(loc) = meta.location(tier) {
                    self.data.account_deleted(tier, oid, loc, meta.size());
                }
            }
            self.rank.remove(oid);
            self.data_cache.invalidate(oid);
        }
        self.meta.put(&meta)?;
        debug!("delete {} vol={} refs={}", oid, vol, meta.ref_cnt());
        Ok(meta.ref_cnt())
    }

    /// Relocate objects from one tier to the other; returns those moved
    pub fn move_objects_to_tier(
        &self,
        oids: &[ObjectId],
        from: Tier,
        to: Tier,
    ) -> Result<Vec<ObjectId>> {
        if from == to {
            return Err(Error::invalid_argument("source and target tier are the same"));
        }
        if !self.data.has_tier(to) {
            return Err(Error::invalid_argument(format!("no {to} disks")));
        }
        let mut moved = Vec::with_capacity(oids.len());
        for oid in oids {
            let _guard = self.locks.lock(oid);
            let Some(mut meta) = self.meta.get(oid)? else {
                continue;
            };
            let Some(src) = meta.location(from) else {
                continue;
            };
            if meta.is_deleted() || meta.on_tier(to) {
                continue;
            }
            let data = self.data.read(from, oid, src)?;
            let loc = match self.data.write(to, oid, &data) {
                Ok(loc) => loc,
                Err(Error::DiskFull) => {
                    warn!("{} full after moving {} objects", to, moved.len());
                    break;
                }
                Err(e) => return Err(e),
            };
            meta.set_location(to, loc);
            meta.clear_location(from);
            self.meta.put(&meta)?;
            self.data.account_deleted(from, oid, src, meta.size());
            moved.push(*oid);
        }
        info!("Moved {} of {} objects {} -> {}", moved.len(), oids.len(), from, to);
        Ok(moved)
    }

    pub fn set_token_unavailable(&self, token: SmTokenId) {
        self.unavailable_tokens.write().insert(token);
    }

    pub fn set_token_available(&self, token: SmTokenId) {
        self.unavailable_tokens.write().remove(&token);
    }

    pub fn is_token_available(&self, token: SmTokenId) -> bool {
        !self.unavailable_tokens.read().contains(&token)
    }

    pub fn get_meta(&self, oid: &ObjectId) -> Result<Option<ObjMetaData>> {
        self.meta.get(oid)
    }

    /// Metadata of every object in `token`
    pub fn snapshot_token(&self, token: SmTokenId) -> Result<Vec<ObjMetaData>> {
        self.meta.snapshot_token(token, self.token_bits)
    }

    /// Metadata in `token` modified at or after `since` (ms)
    pub fn snapshot_token_since(&self, token: SmTokenId, since: u64) -> Result<Vec<ObjMetaData>> {
        Ok(self
            .snapshot_token(token)?
            .into_iter()
            .filter(|m| m.mod_time() >= since)
            .collect())
    }

    /// Fold a peer's metadata into ours; `true` if we still need the bytes
    ///
    /// Per-volume reference counts take the larger of the two views.
    pub fn merge_migrated_meta(&self, theirs: &ObjMetaData) -> Result<bool> {
        let oid = theirs.oid();
        let _guard = self.locks.lock(oid);
        let mut meta = match self.meta.get(oid)? {
            Some(ours) => ours,
            None if theirs.is_deleted() => return Ok(false),
            None => ObjMetaData::new(*oid, theirs.size()),
        };
        meta.merge_assoc(theirs);
        self.meta.put(&meta)?;
        Ok(!meta.is_deleted() && meta.read_tier().is_none())
    }

    /// Store bytes pushed by a peer for metadata merged earlier
    pub fn put_migrated_object(&self, oid: &ObjectId, data: &Bytes) -> Result<Tier> {
        if ObjectId::from_data(data) != *oid {
            return Err(Error::HashMismatch(*oid));
        }
        let _guard = self.locks.lock(oid);
        let mut meta = self
            .meta
            .get(oid)?
            .ok_or_else(|| Error::not_found(format!("{oid} has no migrated metadata")))?;
        if let Some(tier) = meta.read_tier() {
            return Ok(tier);
        }
        let desc = self.best_volume(&meta);
        let mut tier = self.put_algo.select_tier(oid, desc.as_ref());
        if !self.data.has_tier(tier) {
            tier = tier.other();
        }
        let loc = self.data.write(tier, oid, data)?;
        meta.set_location(tier, loc);
        self.meta.put(&meta)?;
        if tier == Tier::Ssd
            && let Some(desc) = desc.filter(|d| d.policy == MediaPolicy::Hybrid)
        {
            self.rank.insert(*oid, self.rank.rank(oid, desc.relative_priority));
        }
        Ok(tier)
    }

    /// Metadata and bytes of a locally stored object, ignoring the token gate
    pub fn read_object_internal(&self, oid: &ObjectId) -> Result<Option<(ObjMetaData, Bytes)>> {
        let Some(meta) = self.meta.get(oid)? else {
            return Ok(None);
        };
        if meta.read_tier().is_none() {
            return Ok(None);
        }
        let data = self.read_meta(&meta)?;
        Ok(Some((meta, data)))
    }

    /// Most flash-deserving volume referencing an object
    pub fn best_volume(&self, meta: &ObjMetaData) -> Option<VolumeDesc> {
        meta.associations()
            .iter()
            .filter_map(|a| self.policies.get(a.vol))
            .min_by_key(|d| {
                let class = match d.policy {
                    MediaPolicy::AllSsd => 0,
                    MediaPolicy::Hybrid => 1,
                    MediaPolicy::HybridPrefcap => 2,
                    MediaPolicy::AllHdd => 3,
                };
                (class, d.relative_priority)
            })
    }

    pub fn sync(&self) -> Result<()> {
        self.meta.sync()
    }

    pub fn shutdown(&self) {
        self.meta.shutdown();
    }

    pub fn object_count(&self) -> usize {
        self.meta.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn open(ssd: bool) -> (TempDir, ObjectStore) {
        let dir = tempdir().unwrap();
        let sm = SmConfig {
            token_bits: 4,
            hdd_disks: vec![0],
            ssd_disks: if ssd { vec![1] } else { Vec::new() },
            ..SmConfig::default()
        };
        let tiering = TieringConfig {
            ssd_rank_table_size: 2,
            ..TieringConfig::default()
        };
        let store = ObjectStore::open(ObjectStoreConfig::new(dir.path(), sm, tiering)).unwrap();
        (dir, store)
    }

    fn obj(s: &str) -> (ObjectId, Bytes) {
        let data = Bytes::copy_from_slice(s.as_bytes());
        (ObjectId::from_data(&data), data)
    }

    #[test]
    fn test_dedup_keeps_one_copy() {
        let (_dir, store) = open(false);
        let (v1, v2) = (VolumeId::new(1), VolumeId::new(2));
        let (oid, data) = obj("shared");
        assert!(!store.put_object(v1, &oid, &data).unwrap().deduped);
        assert!(store.put_object(v2, &oid, &data).unwrap().deduped);
        assert_eq!(store.get_object(v1, &oid).unwrap(), data);
        assert_eq!(store.get_object(v2, &oid).unwrap(), data);

        let meta = store.get_meta(&oid).unwrap().unwrap();
        assert_eq!(meta.ref_cnt(), 2);
        let stats = store.data_io().token_stats(Tier::Hdd, store.token_of(&oid)).unwrap();
        let stored: u64 = stats.iter().map(|s| s.size).sum();
        assert_eq!(stored, crate::data_io::record_len(6));
    }

    #[test]
    fn test_ref_count_lifecycle() {
        let (_dir, store) = open(false);
        let (oid, data) = obj("counted");
        for v in 1..=3 {
            store.put_object(VolumeId::new(v), &oid, &data).unwrap();
        }
        assert_eq!(store.delete_object(VolumeId::new(1), &oid).unwrap(), 2);
        assert!(store.delete_object(VolumeId::new(1), &oid).unwrap_err().is_not_found());
        assert_eq!(store.delete_object(VolumeId::new(2), &oid).unwrap(), 1);
        assert_eq!(store.delete_object(VolumeId::new(3), &oid).unwrap(), 0);
        // Still readable until the scavenger runs
        assert_eq!(store.get_object(VolumeId::new(3), &oid).unwrap(), data);
        assert!(store.get_meta(&oid).unwrap().unwrap().is_deleted());

        store.put_object(VolumeId::new(4), &oid, &data).unwrap();
        let stats = store.data_io().token_stats(Tier::Hdd, store.token_of(&oid)).unwrap();
        assert_eq!(stats[0].deleted, 0);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, store) = open(false);
        let (oid, _) = obj("missing");
        assert!(store.get_object(VolumeId::new(1), &oid).unwrap_err().is_not_found());
        assert!(store.delete_object(VolumeId::new(1), &oid).unwrap_err().is_not_found());
    }

    #[test]
    fn test_unknown_volume_lands_on_hdd() {
        let (_dir, store) = open(true);
        let (oid, data) = obj("anon");
        assert_eq!(store.put_object(VolumeId::new(9), &oid, &data).unwrap().tier, Tier::Hdd);
    }

    #[test]
    fn test_media_policies() {
        let (_dir, store) = open(true);
        store
            .register_volume(VolumeDesc::new(VolumeId::new(1), MediaPolicy::AllSsd, 5))
            .unwrap();
        store
            .register_volume(VolumeDesc::new(VolumeId::new(2), MediaPolicy::AllHdd, 1))
            .unwrap();
        let (a, da) = obj("a");
        let (b, db) = obj("b");
        assert_eq!(store.put_object(VolumeId::new(1), &a, &da).unwrap().tier, Tier::Ssd);
        assert_eq!(store.put_object(VolumeId::new(2), &b, &db).unwrap().tier, Tier::Hdd);
        assert_eq!(store.get_object(VolumeId::new(1), &a).unwrap(), da);
    }

    #[test]
    fn test_ssd_policy_without_ssd_uses_hdd() {
        let (_dir, store) = open(false);
        store
            .register_volume(VolumeDesc::new(VolumeId::new(1), MediaPolicy::AllSsd, 1))
            .unwrap();
        let (oid, data) = obj("x");
        assert_eq!(store.put_object(VolumeId::new(1), &oid, &data).unwrap().tier, Tier::Hdd);
    }

    #[test]
    fn test_verify_dedup_content() {
        let dir = tempdir().unwrap();
        let sm = SmConfig {
            verify_dedup_content: true,
            ..SmConfig::default()
        };
        let store =
            ObjectStore::open(ObjectStoreConfig::new(dir.path(), sm, TieringConfig::default()))
                .unwrap();
        let (oid, _) = obj("real");
        let err = store
            .put_object(VolumeId::new(1), &oid, &Bytes::from_static(b"fake"))
            .unwrap_err();
        assert!(matches!(err, Error::HashMismatch(_)));
    }

    #[test]
    fn test_token_gate() {
        let (_dir, store) = open(false);
        let (oid, data) = obj("gated");
        store.put_object(VolumeId::new(1), &oid, &data).unwrap();
        let token = store.token_of(&oid);
        store.set_token_unavailable(token);
        assert!(store.get_object(VolumeId::new(1), &oid).unwrap_err().is_not_found());
        assert!(store.read_object_internal(&oid).unwrap().is_some());
        store.set_token_available(token);
        assert_eq!(store.get_object(VolumeId::new(1), &oid).unwrap(), data);
    }

    #[test]
    fn test_move_between_tiers() {
        let (_dir, store) = open(true);
        let (oid, data) = obj("mover");
        store.put_object(VolumeId::new(1), &oid, &data).unwrap();
        assert_eq!(
            store.move_objects_to_tier(&[oid], Tier::Hdd, Tier::Ssd).unwrap(),
            vec![oid]
        );
        let meta = store.get_meta(&oid).unwrap().unwrap();
        assert!(meta.on_tier(Tier::Ssd));
        assert!(!meta.on_tier(Tier::Hdd));
        assert_eq!(store.read_object_internal(&oid).unwrap().unwrap().1, data);
        assert!(store.move_objects_to_tier(&[oid], Tier::Hdd, Tier::Ssd).unwrap().is_empty());
    }

    #[test]
    fn test_migrated_meta_and_data() {
        let (_dir, store) = open(false);
        let (oid, data) = obj("incoming");
        let mut theirs = ObjMetaData::new(oid, 8);
        theirs.add_assoc(VolumeId::new(7));
        assert!(store.merge_migrated_meta(&theirs).unwrap());
        assert!(store.put_migrated_object(&oid, &Bytes::from_static(b"bogus")).is_err());
        assert_eq!(store.put_migrated_object(&oid, &data).unwrap(), Tier::Hdd);
        assert!(!store.merge_migrated_meta(&theirs).unwrap());
        assert_eq!(store.get_object(VolumeId::new(7), &oid).unwrap(), data);

        let mut gone = ObjMetaData::new(ObjectId::from_data(b"gone"), 1);
        gone.add_assoc(VolumeId::new(1));
        gone.remove_assoc(VolumeId::new(1));
        assert!(!store.merge_migrated_meta(&gone).unwrap());
        assert!(store.get_meta(gone.oid()).unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_objects() {
        let dir = tempdir().unwrap();
        let (oid, data) = obj("durable");
        let config = || {
            ObjectStoreConfig::new(dir.path(), SmConfig::default(), TieringConfig::default())
        };
        {
            let store = ObjectStore::open(config()).unwrap();
            store.put_object(VolumeId::new(1), &oid, &data).unwrap();
        }
        let store = ObjectStore::open(config()).unwrap();
        assert_eq!(store.get_object(VolumeId::new(1), &oid).unwrap(), data);
    }
}
