//! Periodic promotion and demotion between SSD and HDD
//!
//! Every run looks at one SM token, taken round-robin, and queues at most
//! `batch_size` moves on that token's QoS queue. Rank table bookkeeping
//! follows the moves that actually happened, in the move callback.

use super::rank::{ObjRank, RankEngine};
use crate::meta::ObjMetaData;
use crate::request::{SmIoReq, SmRequestHandler};
use fds_common::config::TieringConfig;
use fds_common::{Lifecycle, MediaPolicy, ObjectId, PeriodicTask, Result, SmTokenId, Tier};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What one controller run decided
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TierRunStats {
    pub token: Option<SmTokenId>,
    pub promoted: usize,
    pub demoted: usize,
}

#[derive(Default)]
struct Candidates {
    promote: Vec<ObjectId>,
    demote: Vec<ObjectId>,
    /// Hybrid promotions enter the rank table at this rank
    ranks: HashMap<ObjectId, ObjRank>,
}

impl Candidates {
    fn len(&self) -> usize {
        self.promote.len() + self.demote.len()
    }
}

struct CtrlInner {
    handler: Arc<SmRequestHandler>,
    config: TieringConfig,
    next_token: AtomicU32,
}

impl CtrlInner {
    fn run_once(&self) -> Result<TierRunStats> {
        let store = self.handler.store();
        let data = store.data_io();
        if !data.has_tier(Tier::Ssd) || !data.has_tier(Tier::Hdd) {
            return Ok(TierRunStats::default());
        }
        let num_tokens = 1u32 << store.token_bits();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) % num_tokens;
        let mut stats = TierRunStats {
            token: Some(token),
            ..TierRunStats::default()
        };
        if !store.is_token_available(token) {
            debug!("Tier controller skips migrating token {}", token);
            return Ok(stats);
        }

        let rank = store.rank_engine();
        let mut picked = Candidates::default();
        for meta in store.snapshot_token(token)? {
            if picked.len() >= self.config.batch_size {
                break;
            }
            if meta.is_deleted() {
                continue;
            }
            let vol = store
                .best_volume(&meta)
                .map(|d| (d.policy, d.relative_priority));
            Self::classify(&meta, vol, rank, &mut picked);
        }

        stats.promoted = picked.promote.len();
        stats.demoted = picked.demote.len();
        if !picked.demote.is_empty() {
            let rank = Arc::clone(rank);
            self.handler.submit(SmIoReq::MoveObjsToTier {
                token,
                oids: picked.demote,
                from: Tier::Ssd,
                to: Tier::Hdd,
                cb: Box::new(move |res| {
                    move_objs_to_tier_cb(&rank, Tier::Hdd, &HashMap::new(), res)
                }),
            })?;
        }
        if !picked.promote.is_empty() {
            let rank = Arc::clone(rank);
            let ranks = picked.ranks;
            self.handler.submit(SmIoReq::MoveObjsToTier {
                token,
                oids: picked.promote,
                from: Tier::Hdd,
                to: Tier::Ssd,
                cb: Box::new(move |res| move_objs_to_tier_cb(&rank, Tier::Ssd, &ranks, res)),
            })?;
        }
        if stats.promoted + stats.demoted > 0 {
            info!(
                "Tier controller token {}: {} to promote, {} to demote",
                token, stats.promoted, stats.demoted
            );
        }
        Ok(stats)
    }

    fn classify(
        meta: &ObjMetaData,
        vol: Option<(MediaPolicy, u32)>,
        rank: &RankEngine,
        picked: &mut Candidates,
    ) {
        let oid = *meta.oid();
        if meta.on_tier(Tier::Ssd) {
            let demote = match vol {
                None => true,
                Some((MediaPolicy::AllSsd, _)) => false,
                Some((MediaPolicy::AllHdd | MediaPolicy::HybridPrefcap, _)) => true,
                Some((MediaPolicy::Hybrid, prio)) => {
                    let r = rank.rank(&oid, prio);
                    if rank.is_demotion_candidate(&oid) {
                        true
                    } else if rank.update(&oid, r) {
                        false
                    } else if rank.should_place_on_ssd(r) {
                        // Resident from before a restart
                        rank.insert(oid, r);
                        false
                    } else {
                        true
                    }
                }
            };
            if demote && !meta.on_tier(Tier::Hdd) {
                picked.demote.push(oid);
            }
        } else if meta.on_tier(Tier::Hdd) {
            match vol {
                Some((MediaPolicy::AllSsd, _)) => picked.promote.push(oid),
                Some((MediaPolicy::Hybrid, prio)) => {
                    let r = rank.rank(&oid, prio);
                    if rank.should_place_on_ssd(r) {
                        picked.promote.push(oid);
                        picked.ranks.insert(oid, r);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Bring the rank table in line with the objects a move relocated
fn move_objs_to_tier_cb(
    rank: &RankEngine,
    to: Tier,
    ranks: &HashMap<ObjectId, ObjRank>,
    res: Result<Vec<ObjectId>>,
) {
    let moved = match res {
        Ok(moved) => moved,
        Err(e) => {
            error!("Move to {} failed: {}", to, e);
            return;
        }
    };
    for oid in &moved {
        match to {
            Tier::Ssd => {
                if let Some(r) = ranks.get(oid) {
                    rank.insert(*oid, *r);
                }
            }
            Tier::Hdd => rank.remove(oid),
        }
    }
    debug!("{} objects now on {}", moved.len(), to);
}

/// Hybrid tier controller
pub struct HybridTierCtrlr {
    inner: Arc<CtrlInner>,
    task: PeriodicTask,
}

impl HybridTierCtrlr {
    pub fn new(handler: Arc<SmRequestHandler>, config: TieringConfig) -> Self {
        Self {
            inner: Arc::new(CtrlInner {
                handler,
                config,
                next_token: AtomicU32::new(0),
            }),
            task: PeriodicTask::new("sm-tier-ctrlr"),
        }
    }

    /// Examine the next token and queue its moves
    pub fn run_once(&self) -> Result<TierRunStats> {
        self.inner.run_once()
    }
}

impl Lifecycle for HybridTierCtrlr {
    fn name(&self) -> &str {
        "sm-tier-ctrlr"
    }

    fn start(&self) -> Result<()> {
        if !self.inner.config.enabled {
            info!("Hybrid tier controller disabled");
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        self.task.start(
            Duration::from_secs(self.inner.config.interval_secs.max(1)),
            move || {
                if let Err(e) = inner.run_once() {
                    warn!("Tier controller run failed: {}", e);
                }
            },
        )
    }

    fn stop(&self) {
        self.task.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{ObjectStore, ObjectStoreConfig};
    use crate::tier::VolumeDesc;
    use bytes::Bytes;
    use fds_common::config::SmConfig;
    use fds_common::{QosDispatcher, VolumeId};
    use tempfile::{TempDir, tempdir};

    fn setup(token_bits: u32, ssd: bool) -> (TempDir, Arc<QosDispatcher>, HybridTierCtrlr) {
        let dir = tempdir().unwrap();
        let sm = SmConfig {
            token_bits,
            hdd_disks: vec![0],
            ssd_disks: if ssd { vec![1] } else { Vec::new() },
            ..SmConfig::default()
        };
        let tiering = TieringConfig {
            ssd_rank_table_size: 4,
            ..TieringConfig::default()
        };
        let store = Arc::new(
            ObjectStore::open(ObjectStoreConfig::new(dir.path(), sm, tiering.clone())).unwrap(),
        );
        let qos = QosDispatcher::started(2, 0).unwrap();
        let handler = Arc::new(SmRequestHandler::new(store, Arc::clone(&qos)));
        (dir, qos, HybridTierCtrlr::new(handler, tiering))
    }

    #[test]
    fn test_tokens_visited_round_robin() {
        let (_dir, _qos, ctrl) = setup(2, true);
        let seen: Vec<_> = (0..6).map(|_| ctrl.run_once().unwrap().token).collect();
        assert_eq!(
            seen,
            vec![Some(0), Some(1), Some(2), Some(3), Some(0), Some(1)]
        );
    }

    #[test]
    fn test_no_ssd_does_nothing() {
        let (_dir, _qos, ctrl) = setup(0, false);
        assert_eq!(ctrl.run_once().unwrap(), TierRunStats::default());
    }

    #[test]
    fn test_policy_change_demotes_and_promotes() {
        let (_dir, qos, ctrl) = setup(0, true);
        let store = Arc::clone(ctrl.inner.handler.store());
        let vol = VolumeId::new(1);
        store
            .register_volume(VolumeDesc::new(vol, MediaPolicy::AllSsd, 3))
            .unwrap();
        let data = Bytes::from_static(b"flash resident");
        let oid = ObjectId::from_data(&data);
        assert_eq!(store.put_object(vol, &oid, &data).unwrap().tier, Tier::Ssd);
        assert_eq!(ctrl.run_once().unwrap().demoted, 0);

        store
            .register_volume(VolumeDesc::new(vol, MediaPolicy::AllHdd, 3))
            .unwrap();
        assert_eq!(ctrl.run_once().unwrap().demoted, 1);
        qos.wait_idle();
        let meta = store.get_meta(&oid).unwrap().unwrap();
        assert!(meta.on_tier(Tier::Hdd) && !meta.on_tier(Tier::Ssd));

        store
            .register_volume(VolumeDesc::new(vol, MediaPolicy::AllSsd, 3))
            .unwrap();
        assert_eq!(ctrl.run_once().unwrap().promoted, 1);
        qos.wait_idle();
        assert!(store.get_meta(&oid).unwrap().unwrap().on_tier(Tier::Ssd));
        assert_eq!(store.get_object(vol, &oid).unwrap(), data);
    }

    #[test]
    fn test_unavailable_token_skipped() {
        let (_dir, _qos, ctrl) = setup(0, true);
        let store = ctrl.inner.handler.store();
        let vol = VolumeId::new(1);
        store
            .register_volume(VolumeDesc::new(vol, MediaPolicy::AllSsd, 1))
            .unwrap();
        store
            .register_volume(VolumeDesc::new(VolumeId::new(2), MediaPolicy::AllHdd, 1))
            .unwrap();
        let data = Bytes::from_static(b"cold");
        let oid = ObjectId::from_data(&data);
        store.put_object(VolumeId::new(2), &oid, &data).unwrap();
        store.put_object(vol, &oid, &data).unwrap();
        store.set_token_unavailable(0);
        let stats = ctrl.run_once().unwrap();
        assert_eq!((stats.promoted, stats.demoted), (0, 0));
    }
}
