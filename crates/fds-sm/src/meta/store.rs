//! Object metadata store
//!
//! Combines the WAL, the ordered index and the ARC cache behind one
//! interface. Mutations go WAL -> index -> cache; reads go cache -> index.
//! A background thread snapshots the index and truncates the WAL.

use super::cache::{ArcCache, CacheStats};
use super::index::{IndexConfig, MetaIndex};
use super::obj_meta::ObjMetaData;
use super::wal::{MetaOp, MetaWal, WalConfig};
use crossbeam_channel::{RecvTimeoutError, Sender};
use fds_common::{ObjectId, Result, SmTokenId};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct MetaStoreConfig {
    /// Holds `metadata.wal` and `snapshots/`
    pub data_dir: PathBuf,
    pub wal: WalConfig,
    /// Mutations between index snapshots
    pub snapshot_threshold: u64,
    pub cache_entries: usize,
    /// Background compaction period; `None` disables the thread
    pub compaction_interval: Option<Duration>,
}

impl MetaStoreConfig {
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            wal: WalConfig::default(),
            snapshot_threshold: 10_000,
            cache_entries: 10_000,
            compaction_interval: Some(Duration::from_secs(60)),
        }
    }
}

struct Persist {
    wal: MetaWal,
    index: MetaIndex,
    /// Keeps WAL order and index order identical
    write_lock: Mutex<()>,
}

impl Persist {
    fn apply(index: &MetaIndex, lsn: u64, op: MetaOp) {
        match op {
            MetaOp::Put { oid, value } => index.put(oid, value, lsn),
            MetaOp::Delete { oid } => {
                index.delete(&oid, lsn);
            }
            MetaOp::Batch { ops } => {
                for op in ops {
                    Self::apply(index, lsn, op);
                }
            }
        }
    }

    fn needs_compaction(&self) -> bool {
        self.index.needs_snapshot() || self.wal.needs_compaction()
    }

    fn snapshot(&self) -> Result<PathBuf> {
        let path = {
            let _guard = self.write_lock.lock();
            self.index.write_snapshot()?
        };
        let lsn = self.index.last_snapshot_lsn();
        info!("Wrote metadata snapshot at LSN {}", lsn);
        if lsn > 0 {
            if let Err(e) = self.wal.truncate_before(lsn + 1) {
                warn!("Failed to truncate metadata WAL: {}", e);
            } else {
                debug!("Truncated metadata WAL before LSN {}", lsn + 1);
            }
        }
        Ok(path)
    }
}

/// Durable object metadata keyed by object id
pub struct ObjectMetadataStore {
    persist: Arc<Persist>,
    cache: ArcCache<ObjectId, ObjMetaData>,
    config: MetaStoreConfig,
    compaction_stop: Mutex<Option<Sender<()>>>,
    compaction_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ObjectMetadataStore {
    /// Open the store, loading the newest snapshot and replaying the WAL tail
    pub fn open(config: MetaStoreConfig) -> Result<Self> {
        let snapshot_dir = config.data_dir.join("snapshots");
        std::fs::create_dir_all(&snapshot_dir)?;

        let index = MetaIndex::load(IndexConfig {
            snapshot_dir,
            snapshot_threshold: config.snapshot_threshold,
            ..IndexConfig::default()
        })?;
        let wal = MetaWal::open(config.data_dir.join("metadata.wal"), config.wal.clone())?;
        wal.advance_to(index.last_snapshot_lsn());

        let from = index.last_snapshot_lsn() + 1;
        let mut replayed = 0u64;
        wal.replay(from, |lsn, op| {
            Persist::apply(&index, lsn, op);
            replayed += 1;
            Ok(())
        })?;
        info!(
            "Opened object metadata store at {:?} ({} objects, replayed {} records from LSN {})",
            config.data_dir,
            index.len(),
            replayed,
            from
        );

        let store = Self {
            persist: Arc::new(Persist {
                wal,
                index,
                write_lock: Mutex::new(()),
            }),
            cache: ArcCache::new(config.cache_entries),
            config,
            compaction_stop: Mutex::new(None),
            compaction_handle: Mutex::new(None),
        };
        if let Some(interval) = store.config.compaction_interval {
            store.start_background_compaction(interval)?;
        }
        Ok(store)
    }

    /// Write one object's metadata
    pub fn put(&self, meta: &ObjMetaData) -> Result<u64> {
        let op = MetaOp::Put {
            oid: *meta.oid(),
            value: meta.marshall(),
        };
        let _guard = self.persist.write_lock.lock();
        let lsn = self.persist.wal.append(&op)?;
        Persist::apply(&self.persist.index, lsn, op);
        self.cache.put(*meta.oid(), meta.clone());
        debug!("meta put {} lsn={}", meta.oid(), lsn);
        Ok(lsn)
    }

    /// Write several objects' metadata as one WAL record
    pub fn put_batch(&self, metas: &[ObjMetaData]) -> Result<u64> {
        let ops = metas
            .iter()
            .map(|m| MetaOp::Put {
                oid: *m.oid(),
                value: m.marshall(),
            })
            .collect::<Vec<_>>();
        let _guard = self.persist.write_lock.lock();
        let lsn = self.persist.wal.append_batch(ops.clone())?;
        for op in ops {
            Persist::apply(&self.persist.index, lsn, op);
        }
        for meta in metas {
            self.cache.put(*meta.oid(), meta.clone());
        }
        Ok(lsn)
    }

    pub fn get(&self, oid: &ObjectId) -> Result<Option<ObjMetaData>> {
        if let Some(meta) = self.cache.get(oid) {
            return Ok(Some(meta));
        }
        let Some(raw) = self.persist.index.get(oid) else {
            return Ok(None);
        };
        let meta = ObjMetaData::unmarshall(&raw)?;
        self.cache.put(*oid, meta.clone());
        Ok(Some(meta))
    }

    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.cache.contains(oid) || self.persist.index.contains(oid)
    }

    pub fn delete(&self, oid: &ObjectId) -> Result<u64> {
        let op = MetaOp::Delete { oid: *oid };
        let _guard = self.persist.write_lock.lock();
        let lsn = self.persist.wal.append(&op)?;
        Persist::apply(&self.persist.index, lsn, op);
        self.cache.remove(oid);
        debug!("meta delete {} lsn={}", oid, lsn);
        Ok(lsn)
    }

    /// Point-in-time copy of every object in one SM token
    pub fn snapshot_token(&self, token: SmTokenId, bits: u32) -> Result<Vec<ObjMetaData>> {
        self.persist
            .index
            .scan_token(token, bits)
            .iter()
            .map(|(_, raw)| ObjMetaData::unmarshall(raw))
            .collect()
    }

    /// Force an index snapshot and WAL truncation
    pub fn snapshot(&self) -> Result<PathBuf> {
        self.persist.snapshot()
    }

    pub fn maybe_compact(&self) -> Result<Option<PathBuf>> {
        if self.persist.needs_compaction() {
            Ok(Some(self.persist.snapshot()?))
        } else {
            Ok(None)
        }
    }

    fn start_background_compaction(&self, interval: Duration) -> Result<()> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let persist = Arc::clone(&self.persist);
        let handle = thread::Builder::new()
            .name("sm-meta-compact".into())
            .spawn(move || {
                debug!("Metadata compaction thread started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if persist.needs_compaction()
                        && let Err(e) = persist.snapshot()
                    {
                        error!("Background metadata snapshot failed: {}", e);
                    }
                }
                debug!("Metadata compaction thread stopped");
            })?;
        *self.compaction_stop.lock() = Some(stop_tx);
        *self.compaction_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop background compaction and sync the WAL
    pub fn shutdown(&self) {
        drop(self.compaction_stop.lock().take());
        if let Some(handle) = self.compaction_handle.lock().take() {
            let _ = handle.join();
        }
        if let Err(e) = self.persist.wal.sync() {
            error!("Failed to sync metadata WAL on shutdown: {}", e);
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.persist.wal.sync()
    }

    pub fn current_lsn(&self) -> u64 {
        self.persist.wal.current_lsn()
    }

    pub fn len(&self) -> usize {
        self.persist.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }
}

impl Drop for ObjectMetadataStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fds_common::VolumeId;
    use tempfile::tempdir;

    fn config(dir: &Path) -> MetaStoreConfig {
        MetaStoreConfig {
            wal: WalConfig {
                sync_on_write: false,
                ..WalConfig::default()
            },
            compaction_interval: None,
            ..MetaStoreConfig::with_data_dir(dir)
        }
    }

    fn meta(n: u32) -> ObjMetaData {
        let mut m = ObjMetaData::new(ObjectId::from_data(&n.to_le_bytes()), n);
        m.add_assoc(VolumeId::new(1));
        m
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = ObjectMetadataStore::open(config(dir.path())).unwrap();
        let m = meta(1);
        store.put(&m).unwrap();
        assert_eq!(store.get(m.oid()).unwrap(), Some(m.clone()));
        store.delete(m.oid()).unwrap();
        assert_eq!(store.get(m.oid()).unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_recovery_from_snapshot_and_wal() {
        let dir = tempdir().unwrap();
        {
            let store = ObjectMetadataStore::open(config(dir.path())).unwrap();
            for n in 0..10 {
                store.put(&meta(n)).unwrap();
            }
            store.snapshot().unwrap();
            store.put_batch(&[meta(10), meta(11)]).unwrap();
            store.delete(meta(0).oid()).unwrap();
        }
        let store = ObjectMetadataStore::open(config(dir.path())).unwrap();
        assert_eq!(store.len(), 11);
        assert!(store.get(meta(0).oid()).unwrap().is_none());
        assert_eq!(store.get(meta(11).oid()).unwrap().unwrap().size(), 11);
    }

    #[test]
    fn test_lsn_continues_after_truncated_wal() {
        let dir = tempdir().unwrap();
        {
            let store = ObjectMetadataStore::open(config(dir.path())).unwrap();
            for n in 0..5 {
                store.put(&meta(n)).unwrap();
            }
            store.snapshot().unwrap();
        }
        {
            let store = ObjectMetadataStore::open(config(dir.path())).unwrap();
            assert_eq!(store.put(&meta(5)).unwrap(), 6);
        }
        let store = ObjectMetadataStore::open(config(dir.path())).unwrap();
        assert!(store.contains(meta(5).oid()));
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn test_snapshot_token() {
        let dir = tempdir().unwrap();
        let store = ObjectMetadataStore::open(config(dir.path())).unwrap();
        let metas: Vec<_> = (0..64).map(meta).collect();
        store.put_batch(&metas).unwrap();
        let total: usize = (0..4)
            .map(|t| {
                let snap = store.snapshot_token(t, 2).unwrap();
                assert!(snap.iter().all(|m| m.oid().token(2) == t));
                snap.len()
            })
            .sum();
        assert_eq!(total, 64);
    }

    #[test]
    fn test_background_compaction_stops() {
        let dir = tempdir().unwrap();
        let store = ObjectMetadataStore::open(MetaStoreConfig {
            snapshot_threshold: 1,
            compaction_interval: Some(Duration::from_millis(10)),
            ..config(dir.path())
        })
        .unwrap();
        store.put(&meta(1)).unwrap();
        thread::sleep(Duration::from_millis(100));
        store.shutdown();
        assert!(dir.path().join("snapshots").read_dir().unwrap().count() >= 1);
    }
}
