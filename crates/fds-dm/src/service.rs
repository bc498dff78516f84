//! Data Manager service: the volumes of this node, their client
//! operations and the background housekeeping

use crate::blob::{BlobMetaDesc, BlobNode, BlobObjectList, MetadataPair};
use crate::catalog::VolumeStats;
use crate::commit_log::{CommitOutcome, TxMode};
use crate::migration::{DmMigrationMgr, DmMigrationMsg, DmMigrationTransport};
use crate::persist::catalog_path;
use crate::request::{DmCallback, DmIoReq};
use crate::volume::{DmVolume, VolumeTable};
use dashmap::mapref::entry::Entry;
use fds_common::config::DmConfig;
use fds_common::{
    BlobTxId, Config, Error, Lifecycle, NodeUuid, ObjectId, PeriodicTask, Priority, QosDispatcher,
    QueueId, Result, VolumeId,
};
use fds_placement::{Dmt, DmtManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10);

pub struct DataManager {
    node: NodeUuid,
    root: PathBuf,
    config: DmConfig,
    qos: Arc<QosDispatcher>,
    dmt: Arc<DmtManager>,
    volumes: Arc<VolumeTable>,
    migration: Arc<DmMigrationMgr>,
    housekeeping: PeriodicTask,
    default_iops_limit: u64,
}

impl DataManager {
    /// Open the DM under `config.dm_data_dir()`, reopening every volume
    /// found there
    pub fn open(
        config: &Config,
        qos: Arc<QosDispatcher>,
        dmt: Arc<DmtManager>,
        transport: Arc<dyn DmMigrationTransport>,
    ) -> Result<Self> {
        let node = NodeUuid::new(config.node.uuid);
        let root = config.dm_data_dir();
        std::fs::create_dir_all(&root)?;
        let volumes = Arc::new(VolumeTable::new());
        let migration = Arc::new(DmMigrationMgr::new(
            node,
            Arc::clone(&volumes),
            Arc::clone(&dmt),
            transport,
            config.migration.clone(),
        ));
        let dm = Self {
            node,
            root,
            config: config.dm.clone(),
            qos,
            dmt,
            volumes,
            migration,
            housekeeping: PeriodicTask::new("dm-housekeeping"),
            default_iops_limit: config.qos.default_iops_limit,
        };
        for vol in existing_volumes(&dm.root)? {
            dm.add_volume(vol, Priority::Normal)?;
        }
        Ok(dm)
    }

    pub const fn node(&self) -> NodeUuid {
        self.node
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn migration(&self) -> &Arc<DmMigrationMgr> {
        &self.migration
    }

    pub fn volume_ids(&self) -> Vec<VolumeId> {
        let mut vols: Vec<_> = self.volumes.iter().map(|v| *v.key()).collect();
        vols.sort_unstable();
        vols
    }

    /// Open (or create) a volume's catalog and journal and give it a QoS
    /// queue
    pub fn add_volume(&self, vol: VolumeId, priority: Priority) -> Result<()> {
        match self.volumes.entry(vol) {
            Entry::Occupied(_) => Err(Error::DuplicateUuid(format!("{vol} is already open"))),
            Entry::Vacant(slot) => {
                let volume = DmVolume::open(&self.root, vol, &self.config)?;
                self.qos
                    .register_queue(QueueId::Volume(vol), priority, self.default_iops_limit);
                slot.insert(Arc::new(volume));
                info!("Added {} to {}", vol, self.node);
                Ok(())
            }
        }
    }

    /// Close a volume; its files stay on disk
    pub fn remove_volume(&self, vol: VolumeId) -> Result<()> {
        let volume = self.volume(vol)?;
        let open = volume.commit_log().open_txs();
        if open > 0 {
            return Err(Error::invalid_argument(format!(
                "{vol} still has {open} open transactions"
            )));
        }
        self.migration.abort_volume(vol, "volume removed");
        self.volumes.remove(&vol);
        if let Err(e) = self.qos.deregister_queue(QueueId::Volume(vol)) {
            warn!("{} queue not deregistered: {}", vol, e);
        }
        info!("Removed {} from {}", vol, self.node);
        Ok(())
    }

    /// Install a new DMT, starting or aborting volume migrations
    pub fn on_dmt_update(&self, dmt: Dmt) -> Result<()> {
        self.migration.on_dmt_update(dmt)
    }

    pub fn handle_migration_msg(&self, from: NodeUuid, msg: DmMigrationMsg) -> Result<()> {
        self.migration.handle_message(from, msg)
    }

    pub fn volume(&self, vol: VolumeId) -> Result<Arc<DmVolume>> {
        self.volumes
            .get(&vol)
            .map(|v| Arc::clone(v.value()))
            .ok_or(Error::VolumeNotFound(vol))
    }

    /// Writes need the primary, reads any member of the volume's group.
    /// Without a DMT every volume is served locally.
    fn check_owner(&self, vol: VolumeId, write: bool) -> Result<()> {
        let Some(dmt) = self.dmt.current() else {
            return Ok(());
        };
        let serves = if write {
            dmt.is_primary(vol, self.node)
        } else {
            dmt.get_nodes(vol).contains(&self.node)
        };
        if serves {
            Ok(())
        } else {
            let op = if write { "write" } else { "read" };
            debug!("{} rejects {} of {} in DMT {}", self.node, op, vol, dmt.version());
            Err(Error::DmNotPrimary(vol))
        }
    }

    /// Queue a request on its volume; it completes through its callback.
    /// The request holds an I/O slot until it runs, so a migration that
    /// quiesces the volume waits for it.
    pub fn submit(&self, req: DmIoReq) -> Result<()> {
        let vol = req.vol();
        let volume = self.volume(vol)?;
        self.check_owner(vol, req.is_write())?;
        let io = volume.io_tracker().enter_owned();
        debug!("Queueing {:?}", req);
        self.qos.submit(QueueId::Volume(vol), move || {
            let _io = io;
            req.execute(&volume);
        })
    }

    /// Submit and wait for the callback
    fn call<T: Send + 'static>(&self, build: impl FnOnce(DmCallback<T>) -> DmIoReq) -> Result<T> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit(build(Box::new(move |res| {
            let _ = tx.send(res);
        })))?;
        rx.recv()
            .map_err(|_| Error::internal("DM request dropped without completing"))?
    }

    pub fn start_blob_tx(
        &self,
        vol: VolumeId,
        tx: BlobTxId,
        blob: &str,
        mode: TxMode,
    ) -> Result<()> {
        let blob = blob.to_string();
        self.call(|cb| DmIoReq::StartBlobTx {
            vol,
            tx,
            blob,
            mode,
            cb,
        })
    }

    pub fn update_catalog(
        &self,
        vol: VolumeId,
        tx: BlobTxId,
        objects: BlobObjectList,
    ) -> Result<()> {
        self.call(|cb| DmIoReq::UpdateCatalog {
            vol,
            tx,
            objects,
            cb,
        })
    }

    pub fn set_blob_metadata(
        &self,
        vol: VolumeId,
        tx: BlobTxId,
        pairs: Vec<MetadataPair>,
    ) -> Result<()> {
        self.call(|cb| DmIoReq::SetBlobMetadata { vol, tx, pairs, cb })
    }

    pub fn delete_blob(&self, vol: VolumeId, tx: BlobTxId) -> Result<()> {
        self.call(|cb| DmIoReq::DeleteBlob { vol, tx, cb })
    }

    pub fn commit_blob_tx(&self, vol: VolumeId, tx: BlobTxId) -> Result<CommitOutcome> {
        self.call(|cb| DmIoReq::CommitBlobTx { vol, tx, cb })
    }

    pub fn abort_blob_tx(&self, vol: VolumeId, tx: BlobTxId) -> Result<()> {
        self.call(|cb| DmIoReq::AbortBlobTx { vol, tx, cb })
    }

    pub fn get_blob(&self, vol: VolumeId, name: &str) -> Result<BlobNode> {
        let name = name.to_string();
        self.call(|cb| DmIoReq::GetBlob { vol, name, cb })
    }

    pub fn get_blob_meta(&self, vol: VolumeId, name: &str) -> Result<BlobMetaDesc> {
        let name = name.to_string();
        self.call(|cb| DmIoReq::GetBlobMeta { vol, name, cb })
    }

    pub fn list_blobs(&self, vol: VolumeId) -> Result<Vec<BlobMetaDesc>> {
        self.call(|cb| DmIoReq::ListBlobs { vol, cb })
    }

    pub fn stat_volume(&self, vol: VolumeId) -> Result<VolumeStats> {
        self.call(|cb| DmIoReq::StatVolume { vol, cb })
    }

    /// Objects the SM should drop references to
    pub fn expunge_list(&self, vol: VolumeId) -> Result<Vec<(ObjectId, u32)>> {
        self.call(|cb| DmIoReq::ExpungeList { vol, cb })
    }

    pub fn clear_expunged(&self, vol: VolumeId, oids: Vec<ObjectId>) -> Result<()> {
        self.call(|cb| DmIoReq::ClearExpunged { vol, oids, cb })
    }

    pub fn snapshot_volume(&self, vol: VolumeId, snap_id: u64) -> Result<PathBuf> {
        self.call(|cb| DmIoReq::SnapshotVolume { vol, snap_id, cb })
    }
}

/// Volumes with a catalog under `root`
fn existing_volumes(root: &Path) -> Result<Vec<VolumeId>> {
    let mut vols = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) else {
            continue;
        };
        let vol = VolumeId::new(id);
        if catalog_path(root, vol).exists() {
            vols.push(vol);
        }
    }
    vols.sort_unstable();
    Ok(vols)
}

fn housekeeping(volumes: &VolumeTable, migration: &DmMigrationMgr, tx_timeout: Duration) {
    let open: Vec<_> = volumes.iter().map(|v| Arc::clone(v.value())).collect();
    for volume in open {
        let purged = volume.commit_log().purge_stale(tx_timeout);
        if !purged.is_empty() {
            warn!("{} purged {} stale transactions", volume.vol(), purged.len());
        }
        match volume.commit_log().prune_journal() {
            Ok(0) => {}
            Ok(n) => debug!("{} pruned {} journal files", volume.vol(), n),
            Err(e) => warn!("{} journal prune failed: {}", volume.vol(), e),
        }
    }
    migration.check_timeouts();
}

impl Lifecycle for DataManager {
    fn name(&self) -> &str {
        "data-manager"
    }

    fn start(&self) -> Result<()> {
        let volumes = Arc::clone(&self.volumes);
        let migration = Arc::clone(&self.migration);
        let tx_timeout = Duration::from_secs(self.config.tx_timeout_secs);
        self.housekeeping.start(HOUSEKEEPING_INTERVAL, move || {
            housekeeping(&volumes, &migration, tx_timeout);
        })?;
        info!("Data manager up with {} volumes", self.volumes.len());
        Ok(())
    }

    fn stop(&self) {
        self.housekeeping.stop();
        self.migration.abort_all("data manager stopping");
        self.qos.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Sink(Mutex<Vec<DmMigrationMsg>>);

    impl DmMigrationTransport for Sink {
        fn send(&self, _to: NodeUuid, _from: NodeUuid, msg: DmMigrationMsg) -> Result<()> {
            self.0.lock().push(msg);
            Ok(())
        }
    }

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.node.data_dir = dir.to_path_buf();
        config.dm.max_object_size = 64;
        config
    }

    fn open(config: &Config) -> DataManager {
        let qos = QosDispatcher::started(2, 0).unwrap();
        let dmt = Arc::new(DmtManager::for_dmt());
        DataManager::open(config, qos, dmt, Arc::new(Sink::default())).unwrap()
    }

    #[test]
    fn test_volume_registry() {
        let dir = tempdir().unwrap();
        let dm = open(&config(dir.path()));
        let vol = VolumeId::new(3);
        dm.add_volume(vol, Priority::High).unwrap();
        assert!(matches!(dm.add_volume(vol, Priority::High), Err(Error::DuplicateUuid(_))));
        assert_eq!(dm.volume_ids(), vec![vol]);
        assert!(matches!(
            dm.list_blobs(VolumeId::new(9)),
            Err(Error::VolumeNotFound(_))
        ));
        dm.remove_volume(vol).unwrap();
        assert!(dm.volume_ids().is_empty());
    }

    #[test]
    fn test_volumes_reopen_with_their_blobs() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let vol = VolumeId::new(1);
        {
            let dm = open(&config);
            dm.add_volume(vol, Priority::Normal).unwrap();
            let tx = BlobTxId::new(1);
            dm.start_blob_tx(vol, tx, "a", TxMode::Update).unwrap();
            dm.update_catalog(vol, tx, [(0, ObjectId::from_data(b"a"), 10)].into_iter().collect())
                .unwrap();
            dm.commit_blob_tx(vol, tx).unwrap();
        }
        let dm = open(&config);
        assert_eq!(dm.volume_ids(), vec![vol]);
        assert_eq!(dm.get_blob_meta(vol, "a").unwrap().size, 10);
    }

    #[test]
    fn test_requests_complete_through_callbacks() {
        let dir = tempdir().unwrap();
        let dm = open(&config(dir.path()));
        let vol = VolumeId::new(2);
        dm.add_volume(vol, Priority::Normal).unwrap();

        let (done, steps) = crossbeam_channel::unbounded::<(&'static str, Result<()>)>();
        let ack = |step: &'static str| -> DmCallback<()> {
            let done = done.clone();
            Box::new(move |res| done.send((step, res)).unwrap())
        };
        let tx = BlobTxId::new(1);
        dm.submit(DmIoReq::StartBlobTx {
            vol,
            tx,
            blob: "b".into(),
            mode: TxMode::Update,
            cb: ack("start"),
        })
        .unwrap();
        dm.submit(DmIoReq::UpdateCatalog {
            vol,
            tx,
            objects: [(0, ObjectId::from_data(b"b"), 10)].into_iter().collect(),
            cb: ack("update"),
        })
        .unwrap();
        let (commit_done, committed) = crossbeam_channel::bounded(1);
        dm.submit(DmIoReq::CommitBlobTx {
            vol,
            tx,
            cb: Box::new(move |res| commit_done.send(res).unwrap()),
        })
        .unwrap();

        // One queue per volume, so the callbacks fire in submission order
        let outcome = committed.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(outcome.desc.size, 10);
        let order: Vec<_> = steps
            .try_iter()
            .map(|(step, res)| {
                res.unwrap();
                step
            })
            .collect();
        assert_eq!(order, vec!["start", "update"]);

        let (meta_done, meta) = crossbeam_channel::bounded(1);
        dm.submit(DmIoReq::GetBlobMeta {
            vol,
            name: "missing".into(),
            cb: Box::new(move |res| meta_done.send(res).unwrap()),
        })
        .unwrap();
        let err = meta.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
        assert!(err.is_not_found());

        dm.qos.wait_idle();
        assert_eq!(dm.volume(vol).unwrap().io_tracker().outstanding(), 0);
        assert!(matches!(
            dm.submit(DmIoReq::ListBlobs {
                vol: VolumeId::new(9),
                cb: Box::new(|_| panic!("no volume 9")),
            }),
            Err(Error::VolumeNotFound(_))
        ));
    }

    #[test]
    fn test_lifecycle() {
        let dir = tempdir().unwrap();
        let dm = open(&config(dir.path()));
        dm.start().unwrap();
        assert!(dm.start().is_err());
        dm.stop();
        dm.stop();
    }
}
