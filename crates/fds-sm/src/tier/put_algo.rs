//! Tier selection for first writes

use super::policy::{PRIORITY_LOWEST, VolumeDesc};
use super::rank::RankEngine;
use fds_common::{MediaPolicy, ObjectId, Tier};
use rand::Rng;
use std::sync::Arc;
use tracing::warn;

/// Chooses the tier a new object is written to
pub trait TierPutAlgorithm: Send + Sync {
    /// `None` means the volume is unknown; that always lands on HDD
    fn select_tier(&self, oid: &ObjectId, vol: Option<&VolumeDesc>) -> Tier;
}

/// Tier a volume's policy dictates; `None` for hybrid placement
fn fixed_tier(oid: &ObjectId, vol: Option<&VolumeDesc>) -> Option<Tier> {
    let Some(vol) = vol else {
        warn!("No volume descriptor for put of {}, placing on hdd", oid);
        return Some(Tier::Hdd);
    };
    match vol.policy {
        MediaPolicy::AllSsd => Some(Tier::Ssd),
        MediaPolicy::AllHdd | MediaPolicy::HybridPrefcap => Some(Tier::Hdd),
        MediaPolicy::Hybrid => None,
    }
}

/// Rank-table placement; a pure function of policy and table state
pub struct RankTierPutAlgo {
    rank: Arc<RankEngine>,
}

impl RankTierPutAlgo {
    pub const fn new(rank: Arc<RankEngine>) -> Self {
        Self { rank }
    }
}

impl TierPutAlgorithm for RankTierPutAlgo {
    fn select_tier(&self, oid: &ObjectId, vol: Option<&VolumeDesc>) -> Tier {
        if let Some(tier) = fixed_tier(oid, vol) {
            return tier;
        }
        let priority = vol.map_or(PRIORITY_LOWEST, |v| v.relative_priority);
        if self.rank.should_place_on_ssd(self.rank.rank(oid, priority)) {
            Tier::Ssd
        } else {
            Tier::Hdd
        }
    }
}

/// Coin-flip placement for exercising both tiers in tests
pub struct RandomTestAlgo {
    ssd_percent: u32,
}

impl RandomTestAlgo {
    pub const fn new(ssd_percent: u32) -> Self {
        Self { ssd_percent }
    }
}

impl TierPutAlgorithm for RandomTestAlgo {
    fn select_tier(&self, oid: &ObjectId, vol: Option<&VolumeDesc>) -> Tier {
        fixed_tier(oid, vol).unwrap_or_else(|| {
            if rand::thread_rng().gen_range(0..100) < self.ssd_percent {
                Tier::Ssd
            } else {
                Tier::Hdd
            }
        })
    }
}
