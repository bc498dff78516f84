//! Blob transactions of one volume
//!
//! A transaction accumulates object list and metadata changes for one
//! blob while open. Commit journals the accumulated update and then
//! applies it to the catalog in a single batch; abort drops it. Both
//! remove the transaction, so a second commit or abort finds nothing.

use crate::blob::{BlobMetaDesc, BlobObjectList, MetadataPair};
use crate::catalog::DmVolumeCatalog;
use crate::journal::{DmTvcOperationJournal, JournalRecord};
use crate::keys;
use fds_common::{BlobTxId, BlobVersion, Error, Result, VolumeId, now_millis};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a committed transaction combines with the stored blob
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    /// Overlay objects and metadata on the current blob
    Update,
    /// Replace the blob's objects and metadata
    Replace,
    /// Install a blob copied from another DM, keeping its version
    Migrated { version: BlobVersion },
}

/// Changes accumulated by one transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobTxUpdate {
    pub blob: String,
    pub mode: TxMode,
    pub objects: BlobObjectList,
    pub metadata: Vec<MetadataPair>,
    pub delete: bool,
}

impl BlobTxUpdate {
    pub fn new(blob: impl Into<String>, mode: TxMode) -> Self {
        Self {
            blob: blob.into(),
            mode,
            objects: BlobObjectList::new(),
            metadata: Vec::new(),
            delete: false,
        }
    }
}

struct CommitLogTx {
    update: BlobTxUpdate,
    started: Instant,
}

#[derive(Default)]
struct TxTable {
    by_id: HashMap<BlobTxId, CommitLogTx>,
    by_blob: HashMap<String, BlobTxId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitOutcome {
    pub seq: u64,
    pub desc: BlobMetaDesc,
}

pub struct DmCommitLog {
    vol: VolumeId,
    catalog: Arc<DmVolumeCatalog>,
    journal: Mutex<DmTvcOperationJournal>,
    txs: Mutex<TxTable>,
    /// A journaled record failed to apply; replay before the next commit
    replay_pending: AtomicBool,
}

impl DmCommitLog {
    /// Open the journal in `journal_dir` and apply any committed records
    /// the catalog has not seen yet
    pub fn open(
        catalog: Arc<DmVolumeCatalog>,
        journal_dir: impl AsRef<Path>,
        journal_file_size: u64,
    ) -> Result<Self> {
        let vol = catalog.vol();
        let mut journal = DmTvcOperationJournal::open(journal_dir, vol, journal_file_size)?;
        let applied = catalog.last_applied_seq();
        journal.ensure_next_seq_above(applied);

        Self::replay_into(&catalog, &journal)?;

        Ok(Self {
            vol,
            catalog,
            journal: Mutex::new(journal),
            txs: Mutex::new(TxTable::default()),
            replay_pending: AtomicBool::new(false),
        })
    }

    /// Apply journal records above the catalog's last applied sequence
    fn replay_into(catalog: &DmVolumeCatalog, journal: &DmTvcOperationJournal) -> Result<()> {
        let vol = catalog.vol();
        let pending = journal.replay(catalog.last_applied_seq())?;
        if !pending.is_empty() {
            info!("Replaying {} journal records into {}", pending.len(), vol);
        }
        for record in pending {
            match catalog.apply(record.seq, &record.update, record.committed_at) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    warn!("Skipping journal record {} of {}: {}", record.seq, vol, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub const fn vol(&self) -> VolumeId {
        self.vol
    }

    pub const fn catalog(&self) -> &Arc<DmVolumeCatalog> {
        &self.catalog
    }

    pub fn start_tx(&self, tx_id: BlobTxId, blob: &str, mode: TxMode) -> Result<()> {
        keys::validate_blob_name(blob)?;
        let mut txs = self.txs.lock();
        if txs.by_id.contains_key(&tx_id) {
            return Err(Error::TxAlreadyExists(tx_id.to_string()));
        }
        if let Some(open) = txs.by_blob.get(blob) {
            return Err(Error::TxAlreadyExists(format!("{open} is open on blob {blob}")));
        }
        txs.by_blob.insert(blob.to_string(), tx_id);
        txs.by_id.insert(
            tx_id,
            CommitLogTx {
                update: BlobTxUpdate::new(blob, mode),
                started: Instant::now(),
            },
        );
        debug!("{} started {} on {}", self.vol, tx_id, blob);
        Ok(())
    }

    fn with_open_tx<F>(&self, tx_id: BlobTxId, f: F) -> Result<()>
    where
        F: FnOnce(&mut BlobTxUpdate) -> Result<()>,
    {
        let mut txs = self.txs.lock();
        let tx = txs.by_id.get_mut(&tx_id).ok_or(Error::TxNotOpen(tx_id))?;
        f(&mut tx.update)
    }

    /// Stage object list changes
    pub fn update_catalog(&self, tx_id: BlobTxId, objects: &BlobObjectList) -> Result<()> {
        objects.validate(self.catalog.max_object_size())?;
        self.with_open_tx(tx_id, |update| {
            if update.delete {
                return Err(Error::invalid_argument(format!("{tx_id} deletes its blob")));
            }
            update.objects.merge(objects);
            Ok(())
        })
    }

    /// Stage metadata pairs; later pairs win
    pub fn set_blob_metadata(&self, tx_id: BlobTxId, pairs: &[MetadataPair]) -> Result<()> {
        self.with_open_tx(tx_id, |update| {
            if update.delete {
                return Err(Error::invalid_argument(format!("{tx_id} deletes its blob")));
            }
            update.metadata.extend_from_slice(pairs);
            Ok(())
        })
    }

    /// Turn the transaction into a delete of its blob
    pub fn delete_blob(&self, tx_id: BlobTxId) -> Result<()> {
        self.with_open_tx(tx_id, |update| {
            update.delete = true;
            update.objects = BlobObjectList::new();
            update.metadata.clear();
            Ok(())
        })
    }

    fn take_tx(&self, tx_id: BlobTxId) -> Result<CommitLogTx> {
        let mut txs = self.txs.lock();
        let tx = txs
            .by_id
            .remove(&tx_id)
            .ok_or_else(|| Error::not_found(format!("{tx_id} in {}", self.vol)))?;
        txs.by_blob.remove(&tx.update.blob);
        Ok(tx)
    }

    pub fn commit(&self, tx_id: BlobTxId) -> Result<CommitOutcome> {
        let tx = self.take_tx(tx_id)?;

        // Commits are serialized here so journal order is apply order
        let mut journal = self.journal.lock();
        if self.replay_pending.load(Ordering::Acquire) {
            Self::replay_into(&self.catalog, &journal)?;
            self.replay_pending.store(false, Ordering::Release);
        }
        if tx.update.delete && !matches!(tx.update.mode, TxMode::Migrated { .. }) {
            self.catalog.get_blob_meta(&tx.update.blob)?;
        }
        let record = JournalRecord {
            seq: journal.next_seq(),
            tx_id,
            committed_at: now_millis(),
            update: tx.update,
        };
        if journal.log(&record)?.is_none() {
            journal.rotate()?;
            journal
                .log(&record)?
                .ok_or_else(|| Error::internal("journal full right after rotation"))?;
        }
        let desc = match self
            .catalog
            .apply(record.seq, &record.update, record.committed_at)
        {
            Ok(desc) => desc,
            Err(e) => {
                // Later commits must not move the applied sequence past it
                self.replay_pending.store(true, Ordering::Release);
                warn!(
                    "{} journaled {} at seq {} but failed to apply it: {}",
                    self.vol, tx_id, record.seq, e
                );
                return Err(e);
            }
        };
        debug!(
            "{} committed {} on {} at seq {}",
            self.vol, tx_id, record.update.blob, record.seq
        );
        Ok(CommitOutcome {
            seq: record.seq,
            desc,
        })
    }

    pub fn abort(&self, tx_id: BlobTxId) -> Result<()> {
        let tx = self.take_tx(tx_id)?;
        debug!("{} aborted {} on {}", self.vol, tx_id, tx.update.blob);
        Ok(())
    }

    pub fn is_open(&self, tx_id: BlobTxId) -> bool {
        self.txs.lock().by_id.contains_key(&tx_id)
    }

    pub fn open_txs(&self) -> usize {
        self.txs.lock().by_id.len()
    }

    /// Abort transactions open for longer than `timeout`
    pub fn purge_stale(&self, timeout: Duration) -> Vec<BlobTxId> {
        let mut txs = self.txs.lock();
        let stale: Vec<_> = txs
            .by_id
            .iter()
            .filter(|(_, tx)| tx.started.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(tx) = txs.by_id.remove(id) {
                txs.by_blob.remove(&tx.update.blob);
                warn!("{} purged stale {} on {}", self.vol, id, tx.update.blob);
            }
        }
        stale
    }

    /// Delete journal archives the catalog has fully applied
    pub fn prune_journal(&self) -> Result<usize> {
        self.journal.lock().prune(self.catalog.last_applied_seq())
    }
}
