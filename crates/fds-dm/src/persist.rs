//! Persistent storage behind a volume catalog
//!
//! Each volume keeps its catalog in its own redb database:
//! `<root>/<volId>/<volId>_vcat.redb`, with snapshots under
//! `<root>/<volId>/snapshot/<snapId>_vcat.redb`.

use fds_common::{Error, Result, VolumeId};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use tracing::info;

/// Catalog keys (see `keys`) to marshalled records
const CATALOG: TableDefinition<&[u8], &[u8]> = TableDefinition::new("catalog");

pub fn vol_dir(root: &Path, vol: VolumeId) -> PathBuf {
    root.join(vol.get().to_string())
}

pub fn catalog_path(root: &Path, vol: VolumeId) -> PathBuf {
    vol_dir(root, vol).join(format!("{}_vcat.redb", vol.get()))
}

pub fn snapshot_dir(root: &Path, vol: VolumeId) -> PathBuf {
    vol_dir(root, vol).join("snapshot")
}

pub fn snapshot_path(root: &Path, vol: VolumeId, snap_id: u64) -> PathBuf {
    snapshot_dir(root, vol).join(format!("{snap_id}_vcat.redb"))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatWriteOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    /// Remove every key starting with the prefix
    DeletePrefix(Vec<u8>),
}

/// Mutations applied in one transaction
#[derive(Clone, Debug, Default)]
pub struct CatWriteBatch {
    ops: Vec<CatWriteOp>,
}

impl CatWriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(CatWriteOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(CatWriteOp::Delete(key));
    }

    pub fn delete_prefix(&mut self, prefix: Vec<u8>) {
        self.ops.push(CatWriteOp::DeletePrefix(prefix));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered key-value store holding one volume's catalog
pub trait DmPersistVolDir: Send + Sync {
    fn vol_id(&self) -> VolumeId;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Every entry whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply all of `batch` or none of it
    fn write_batch(&self, batch: CatWriteBatch) -> Result<()>;

    /// Copy the catalog to the snapshot path for `snap_id`
    fn snapshot(&self, snap_id: u64) -> Result<PathBuf>;
}

/// redb-backed volume directory
pub struct RedbVolDir {
    vol: VolumeId,
    root: PathBuf,
    db: Database,
}

impl RedbVolDir {
    /// Open (or create) the catalog of `vol` under `root`
    pub fn open(root: impl AsRef<Path>, vol: VolumeId) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(vol_dir(&root, vol))?;
        let db = Database::create(catalog_path(&root, vol))?;

        // Create the table up front so read transactions never miss it
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(CATALOG)?;
        }
        write_txn.commit()?;

        Ok(Self { vol, root, db })
    }

    pub fn path(&self) -> PathBuf {
        catalog_path(&self.root, self.vol)
    }
}

impl DmPersistVolDir for RedbVolDir {
    fn vol_id(&self) -> VolumeId {
        self.vol
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CATALOG)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CATALOG)?;
        let mut result = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            result.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(result)
    }

    fn write_batch(&self, batch: CatWriteBatch) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CATALOG)?;
            for op in batch.ops {
                match op {
                    CatWriteOp::Put(key, value) => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    CatWriteOp::Delete(key) => {
                        table.remove(key.as_slice())?;
                    }
                    CatWriteOp::DeletePrefix(prefix) => {
                        let mut doomed = Vec::new();
                        for entry in table.range(prefix.as_slice()..)? {
                            let (key, _) = entry?;
                            if !key.value().starts_with(&prefix) {
                                break;
                            }
                            doomed.push(key.value().to_vec());
                        }
                        for key in doomed {
                            table.remove(key.as_slice())?;
                        }
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn snapshot(&self, snap_id: u64) -> Result<PathBuf> {
        let path = snapshot_path(&self.root, self.vol, snap_id);
        if path.exists() {
            return Err(Error::invalid_argument(format!(
                "snapshot {snap_id} of {} already exists",
                self.vol
            )));
        }
        std::fs::create_dir_all(snapshot_dir(&self.root, self.vol))?;
        let snap = Database::create(&path)?;

        let read_txn = self.db.begin_read()?;
        let source = read_txn.open_table(CATALOG)?;
        let write_txn = snap.begin_write()?;
        let mut copied = 0usize;
        {
            let mut dest = write_txn.open_table(CATALOG)?;
            for entry in source.iter()? {
                let (key, value) = entry?;
                dest.insert(key.value(), value.value())?;
                copied += 1;
            }
        }
        write_txn.commit()?;
        info!("Snapshot {} of {}: {} catalog entries", snap_id, self.vol, copied);
        Ok(path)
    }
}
