//! SM I/O requests and their dispatch onto QoS queues
//!
//! Client requests queue per volume; background requests (tier moves and
//! compaction) queue per SM token. Each request carries the callback that
//! receives its result.

use crate::object_store::{ObjectStore, PutOutcome};
use crate::scavenger::{CompactStats, TokenCompactor};
use bytes::Bytes;
use fds_common::{ObjectId, QosDispatcher, QueueId, Result, SmTokenId, Tier, VolumeId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub type SmCallback<T> = Box<dyn FnOnce(Result<T>) + Send>;

pub enum SmIoReq {
    PutObject {
        vol: VolumeId,
        oid: ObjectId,
        data: Bytes,
        cb: SmCallback<PutOutcome>,
    },
    GetObject {
        vol: VolumeId,
        oid: ObjectId,
        cb: SmCallback<Bytes>,
    },
    DeleteObject {
        vol: VolumeId,
        oid: ObjectId,
        cb: SmCallback<u64>,
    },
    MoveObjsToTier {
        token: SmTokenId,
        oids: Vec<ObjectId>,
        from: Tier,
        to: Tier,
        cb: SmCallback<Vec<ObjectId>>,
    },
    CompactToken {
        tier: Tier,
        token: SmTokenId,
        grace: Duration,
        cb: SmCallback<CompactStats>,
    },
}

impl SmIoReq {
    /// Ordering queue the request runs on
    pub const fn queue(&self) -> QueueId {
        match self {
            Self::PutObject { vol, .. }
            | Self::GetObject { vol, .. }
            | Self::DeleteObject { vol, .. } => QueueId::Volume(*vol),
            Self::MoveObjsToTier { token, .. } | Self::CompactToken { token, .. } => {
                QueueId::Token(*token)
            }
        }
    }

    /// Run against `store` and hand the result to the callback
    pub fn execute(self, store: &ObjectStore) {
        match self {
            Self::PutObject { vol, oid, data, cb } => cb(store.put_object(vol, &oid, &data)),
            Self::GetObject { vol, oid, cb } => cb(store.get_object(vol, &oid)),
            Self::DeleteObject { vol, oid, cb } => cb(store.delete_object(vol, &oid)),
            Self::MoveObjsToTier {
                oids, from, to, cb, ..
            } => cb(store.move_objects_to_tier(&oids, from, to)),
            Self::CompactToken {
                tier,
                token,
                grace,
                cb,
            } => cb(TokenCompactor::new(store).compact(tier, token, grace)),
        }
    }
}

impl fmt::Debug for SmIoReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PutObject { vol, oid, data, .. } => {
                write!(f, "PutObject({vol}, {oid}, {}B)", data.len())
            }
            Self::GetObject { vol, oid, .. } => write!(f, "GetObject({vol}, {oid})"),
            Self::DeleteObject { vol, oid, .. } => write!(f, "DeleteObject({vol}, {oid})"),
            Self::MoveObjsToTier {
                token, oids, from, to, ..
            } => write!(f, "MoveObjsToTier(token {token}, {} objs, {from}->{to})", oids.len()),
            Self::CompactToken { tier, token, .. } => write!(f, "CompactToken({tier}, {token})"),
        }
    }
}

/// Queues SM requests on the QoS dispatcher
pub struct SmRequestHandler {
    store: Arc<ObjectStore>,
    qos: Arc<QosDispatcher>,
}

impl SmRequestHandler {
    pub const fn new(store: Arc<ObjectStore>, qos: Arc<QosDispatcher>) -> Self {
        Self { store, qos }
    }

    pub const fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub const fn qos(&self) -> &Arc<QosDispatcher> {
        &self.qos
    }

    /// Queue a request; it completes through its callback
    pub fn submit(&self, req: SmIoReq) -> Result<()> {
        let qid = req.queue();
        debug!("Queueing {:?} on {}", req, qid);
        let store = Arc::clone(&self.store);
        self.qos.submit(qid, move || req.execute(&store))
    }

    pub fn put_object(&self, vol: VolumeId, oid: ObjectId, data: Bytes) -> Result<PutOutcome> {
        self.call(|cb| SmIoReq::PutObject { vol, oid, data, cb })
    }

    pub fn get_object(&self, vol: VolumeId, oid: ObjectId) -> Result<Bytes> {
        self.call(|cb| SmIoReq::GetObject { vol, oid, cb })
    }

    pub fn delete_object(&self, vol: VolumeId, oid: ObjectId) -> Result<u64> {
        self.call(|cb| SmIoReq::DeleteObject { vol, oid, cb })
    }

    /// Submit and wait for the callback
    fn call<T: Send + 'static>(&self, build: impl FnOnce(SmCallback<T>) -> SmIoReq) -> Result<T> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit(build(Box::new(move |res| {
            let _ = tx.send(res);
        })))?;
        rx.recv()
            .map_err(|_| fds_common::Error::internal("SM request dropped without completing"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::ObjectStoreConfig;
    use fds_common::config::{SmConfig, TieringConfig};
    use tempfile::tempdir;

    #[test]
    fn test_requests_round_trip_through_qos() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            ObjectStore::open(ObjectStoreConfig::new(
                dir.path(),
                SmConfig::default(),
                TieringConfig::default(),
            ))
            .unwrap(),
        );
        let qos = QosDispatcher::started(2, 0).unwrap();
        let handler = SmRequestHandler::new(store, qos);

        let vol = VolumeId::new(1);
        let data = Bytes::from_static(b"queued");
        let oid = ObjectId::from_data(&data);
        assert!(!handler.put_object(vol, oid, data.clone()).unwrap().deduped);
        assert_eq!(handler.get_object(vol, oid).unwrap(), data);
        assert_eq!(handler.delete_object(vol, oid).unwrap(), 0);
        assert!(handler.delete_object(vol, oid).unwrap_err().is_not_found());
    }

    #[test]
    fn test_queue_selection() {
        let req = SmIoReq::CompactToken {
            tier: Tier::Hdd,
            token: 3,
            grace: Duration::ZERO,
            cb: Box::new(|_| {}),
        };
        assert_eq!(req.queue(), QueueId::Token(3));
        let req = SmIoReq::GetObject {
            vol: VolumeId::new(4),
            oid: ObjectId::from_data(b"x"),
            cb: Box::new(|_| {}),
        };
        assert_eq!(req.queue(), QueueId::Volume(VolumeId::new(4)));
    }
}
