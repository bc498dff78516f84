//! Ordered in-memory index of object metadata with snapshot persistence
//!
//! Keys are object ids, so all objects of an SM token form one contiguous
//! range. Snapshots are written as `meta_<lsn>.snapshot`: a fixed header
//! followed by the bincode-encoded entries.

use fds_common::{Error, ObjectId, Result, SmTokenId, now_millis};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Snapshot file header
#[derive(Clone, Debug, PartialEq, Eq)]
struct SnapshotHeader {
    lsn: u64,
    entry_count: u64,
    checksum: u32,
    created_at: u64,
}

impl SnapshotHeader {
    const MAGIC: u32 = 0x534D_5348; // "SMSH"
    const SIZE: usize = 32;

    fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&Self::MAGIC.to_le_bytes());
        buf[4..12].copy_from_slice(&self.lsn.to_le_bytes());
        buf[12..20].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf[24..32].copy_from_slice(&self.created_at.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Option<Self> {
        let data = data.get(..Self::SIZE)?;
        if u32::from_le_bytes(data[0..4].try_into().ok()?) != Self::MAGIC {
            return None;
        }
        Some(Self {
            lsn: u64::from_le_bytes(data[4..12].try_into().ok()?),
            entry_count: u64::from_le_bytes(data[12..20].try_into().ok()?),
            checksum: u32::from_le_bytes(data[20..24].try_into().ok()?),
            created_at: u64::from_le_bytes(data[24..32].try_into().ok()?),
        })
    }
}

#[derive(Clone, Debug)]
pub struct IndexConfig {
    pub snapshot_dir: PathBuf,
    /// Mutations between snapshots
    pub snapshot_threshold: u64,
    /// Snapshots kept on disk
    pub snapshot_retention: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("."),
            snapshot_threshold: 10_000,
            snapshot_retention: 2,
        }
    }
}

/// Object id -> marshalled `ObjMetaData`
pub struct MetaIndex {
    tree: RwLock<BTreeMap<ObjectId, Vec<u8>>>,
    lsn: AtomicU64,
    mutations_since_snapshot: AtomicU64,
    last_snapshot_lsn: AtomicU64,
    config: IndexConfig,
}

impl MetaIndex {
    #[must_use]
    pub fn new(config: IndexConfig) -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
            lsn: AtomicU64::new(0),
            mutations_since_snapshot: AtomicU64::new(0),
            last_snapshot_lsn: AtomicU64::new(0),
            config,
        }
    }

    /// Load from the newest snapshot, or start empty
    pub fn load(config: IndexConfig) -> Result<Self> {
        let Some(path) = Self::list_snapshots(&config.snapshot_dir)?.into_iter().next() else {
            return Ok(Self::new(config));
        };
        let buf = std::fs::read(&path.0)?;
        let header = SnapshotHeader::from_bytes(&buf)
            .ok_or_else(|| Error::Serialization(format!("bad snapshot header in {:?}", path.0)))?;
        let body = &buf[SnapshotHeader::SIZE..];
        if crc32c::crc32c(body) != header.checksum {
            return Err(Error::ChecksumMismatch(format!("{:?}", path.0)));
        }
        let entries: Vec<(ObjectId, Vec<u8>)> = bincode::deserialize(body)?;
        if entries.len() as u64 != header.entry_count {
            return Err(Error::Serialization("snapshot entry count mismatch".into()));
        }
        debug!(
            "Loaded metadata snapshot {:?} ({} entries, created {})",
            path.0, header.entry_count, header.created_at
        );

        let index = Self::new(config);
        index.lsn.store(header.lsn, Ordering::SeqCst);
        index.last_snapshot_lsn.store(header.lsn, Ordering::SeqCst);
        *index.tree.write() = entries.into_iter().collect();
        Ok(index)
    }

    /// Snapshot files, newest first
    fn list_snapshots(dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots: Vec<(PathBuf, u64)> = std::fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let lsn = name
                    .to_str()?
                    .strip_prefix("meta_")?
                    .strip_suffix(".snapshot")?
                    .parse::<u64>()
                    .ok()?;
                Some((entry.path(), lsn))
            })
            .collect();
        snapshots.sort_by_key(|(_, lsn)| std::cmp::Reverse(*lsn));
        Ok(snapshots)
    }

    pub fn put(&self, oid: ObjectId, value: Vec<u8>, lsn: u64) {
        self.tree.write().insert(oid, value);
        self.record_mutation(lsn);
    }

    pub fn delete(&self, oid: &ObjectId, lsn: u64) -> bool {
        let removed = self.tree.write().remove(oid).is_some();
        self.record_mutation(lsn);
        removed
    }

    #[must_use]
    pub fn get(&self, oid: &ObjectId) -> Option<Vec<u8>> {
        self.tree.read().get(oid).cloned()
    }

    #[must_use]
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.tree.read().contains_key(oid)
    }

    /// Every entry of one SM token, in object id order
    #[must_use]
    pub fn scan_token(&self, token: SmTokenId, bits: u32) -> Vec<(ObjectId, Vec<u8>)> {
        let lo = ObjectId::token_lower_bound(token, bits);
        let hi = ObjectId::token_upper_bound(token, bits);
        self.tree
            .read()
            .range(lo..=hi)
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    fn record_mutation(&self, lsn: u64) {
        self.lsn.fetch_max(lsn, Ordering::SeqCst);
        self.mutations_since_snapshot.fetch_add(1, Ordering::Relaxed);
    }

    /// Write a snapshot of the current contents
    pub fn write_snapshot(&self) -> Result<PathBuf> {
        let (lsn, entry_count, entries) = {
            let tree = self.tree.read();
            let entries: Vec<(&ObjectId, &Vec<u8>)> = tree.iter().collect();
            (
                self.lsn.load(Ordering::SeqCst),
                entries.len() as u64,
                bincode::serialize(&entries)?,
            )
        };
        let header = SnapshotHeader {
            lsn,
            entry_count,
            checksum: crc32c::crc32c(&entries),
            created_at: now_millis(),
        };

        std::fs::create_dir_all(&self.config.snapshot_dir)?;
        let name = format!("meta_{lsn}.snapshot");
        let path = self.config.snapshot_dir.join(&name);
        let tmp_path = self.config.snapshot_dir.join(format!("{name}.tmp"));
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&entries)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;

        self.last_snapshot_lsn.store(lsn, Ordering::SeqCst);
        self.mutations_since_snapshot.store(0, Ordering::Relaxed);
        self.cleanup_old_snapshots()?;
        Ok(path)
    }

    fn cleanup_old_snapshots(&self) -> Result<()> {
        for (path, _) in Self::list_snapshots(&self.config.snapshot_dir)?
            .into_iter()
            .skip(self.config.snapshot_retention)
        {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove old index snapshot {:?}: {}", path, e);
            }
        }
        Ok(())
    }

    pub fn needs_snapshot(&self) -> bool {
        self.mutations_since_snapshot.load(Ordering::Relaxed) >= self.config.snapshot_threshold
    }

    pub fn last_snapshot_lsn(&self) -> u64 {
        self.last_snapshot_lsn.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
