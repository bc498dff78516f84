//! Storage Manager service: the object store plus its background workers

use crate::migration::{SmMigrationTransport, TokenMigrationMgr};
use crate::object_store::{ObjectStore, ObjectStoreConfig};
use crate::request::SmRequestHandler;
use crate::scavenger::ScavControl;
use crate::tier::{HybridTierCtrlr, VolumeDesc};
use fds_common::{Config, Lifecycle, NodeUuid, Priority, QosDispatcher, QueueId, Result, VolumeId};
use fds_placement::DltManager;
use std::sync::Arc;
use tracing::{info, warn};

pub struct StorageManager {
    store: Arc<ObjectStore>,
    qos: Arc<QosDispatcher>,
    handler: Arc<SmRequestHandler>,
    tier_ctrl: HybridTierCtrlr,
    scavenger: ScavControl,
    migration: TokenMigrationMgr,
    default_iops_limit: u64,
}

impl StorageManager {
    pub fn open(
        config: &Config,
        qos: Arc<QosDispatcher>,
        dlt: Arc<DltManager>,
        transport: Arc<dyn SmMigrationTransport>,
    ) -> Result<Self> {
        let node = NodeUuid::new(config.node.uuid);
        let store = Arc::new(ObjectStore::open(ObjectStoreConfig::new(
            config.sm_data_dir(),
            config.sm.clone(),
            config.tiering.clone(),
        ))?);
        let handler = Arc::new(SmRequestHandler::new(Arc::clone(&store), Arc::clone(&qos)));
        let tier_ctrl = HybridTierCtrlr::new(Arc::clone(&handler), config.tiering.clone());
        let scavenger = ScavControl::new(Arc::clone(&handler), config.scavenger.clone());
        let migration = TokenMigrationMgr::new(
            node,
            Arc::clone(&store),
            dlt,
            transport,
            config.migration.clone(),
        );
        Ok(Self {
            store,
            qos,
            handler,
            tier_ctrl,
            scavenger,
            migration,
            default_iops_limit: config.qos.default_iops_limit,
        })
    }

    pub const fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub const fn handler(&self) -> &Arc<SmRequestHandler> {
        &self.handler
    }

    pub const fn migration(&self) -> &TokenMigrationMgr {
        &self.migration
    }

    pub const fn tier_ctrl(&self) -> &HybridTierCtrlr {
        &self.tier_ctrl
    }

    pub const fn scavenger(&self) -> &ScavControl {
        &self.scavenger
    }

    /// Make a volume known: placement policy plus its QoS queue
    pub fn register_volume(&self, desc: VolumeDesc, priority: Priority) -> Result<()> {
        self.store.register_volume(desc)?;
        self.qos
            .register_queue(QueueId::Volume(desc.vol), priority, self.default_iops_limit);
        Ok(())
    }

    pub fn deregister_volume(&self, vol: VolumeId) -> Result<()> {
        self.store.policies().deregister(vol);
        self.qos.deregister_queue(QueueId::Volume(vol))
    }
}

impl Lifecycle for StorageManager {
    fn name(&self) -> &str {
        "storage-manager"
    }

    fn start(&self) -> Result<()> {
        self.tier_ctrl.start()?;
        if let Err(e) = self.scavenger.start() {
            self.tier_ctrl.stop();
            return Err(e);
        }
        info!("Storage manager up with {} objects", self.store.object_count());
        Ok(())
    }

    fn stop(&self) {
        self.scavenger.stop();
        self.tier_ctrl.stop();
        self.qos.wait_idle();
        if let Err(e) = self.store.sync() {
            warn!("Final metadata sync failed: {}", e);
        }
    }
}
