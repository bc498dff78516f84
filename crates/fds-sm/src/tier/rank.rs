//! Access ranking and the SSD rank table
//!
//! An object's rank is `relative_priority * RANK_SCALE / (hits + 1)`.
//! Lower numeric rank is hotter. The SSD rank table holds the objects that
//! currently earn flash; its tail is the numerically largest rank in it.
//! A candidate earns flash while the table has room or when its rank is
//! strictly below the tail rank.
//!
//! Entries pushed out of the table are not moved synchronously; they are
//! remembered as demotion candidates for the tier controller.

use fds_common::ObjectId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

pub type ObjRank = u64;

pub const RANK_SCALE: u64 = 1 << 20;

struct RankState {
    hits: HashMap<ObjectId, u32>,
    table: BTreeMap<ObjectId, ObjRank>,
    ordered: BTreeSet<(ObjRank, ObjectId)>,
    demotions: HashSet<ObjectId>,
}

impl RankState {
    fn remove(&mut self, oid: &ObjectId) -> Option<ObjRank> {
        let rank = self.table.remove(oid)?;
        self.ordered.remove(&(rank, *oid));
        Some(rank)
    }

    fn tail(&self) -> Option<(ObjRank, ObjectId)> {
        self.ordered.iter().next_back().copied()
    }
}

pub struct RankEngine {
    state: Mutex<RankState>,
    capacity: usize,
    max_tracked: usize,
}

impl RankEngine {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RankState {
                hits: HashMap::new(),
                table: BTreeMap::new(),
                ordered: BTreeSet::new(),
                demotions: HashSet::new(),
            }),
            capacity,
            max_tracked: capacity.saturating_mul(4).max(1024),
        }
    }

    /// Count one read or write of `oid`
    pub fn record_access(&self, oid: &ObjectId) {
        let mut state = self.state.lock();
        if state.hits.len() >= self.max_tracked && !state.hits.contains_key(oid) {
            // Age every counter so old popularity fades
            state.hits.retain(|_, h| {
                *h /= 2;
                *h > 0
            });
        }
        let h = state.hits.entry(*oid).or_insert(0);
        *h = h.saturating_add(1);
    }

    #[must_use]
    pub fn hits(&self, oid: &ObjectId) -> u32 {
        self.state.lock().hits.get(oid).copied().unwrap_or(0)
    }

    /// Current rank of `oid` for a volume of `relative_priority`
    #[must_use]
    pub fn rank(&self, oid: &ObjectId, relative_priority: u32) -> ObjRank {
        let hits = u64::from(self.hits(oid));
        u64::from(relative_priority.max(1)) * RANK_SCALE / (hits + 1)
    }

    /// Rank of the coldest SSD resident
    #[must_use]
    pub fn tail_rank(&self) -> Option<ObjRank> {
        self.state.lock().tail().map(|(r, _)| r)
    }

    /// Whether an object of `rank` earns a place on flash
    #[must_use]
    pub fn should_place_on_ssd(&self, rank: ObjRank) -> bool {
        let state = self.state.lock();
        state.table.len() < self.capacity || state.tail().is_some_and(|(tail, _)| rank < tail)
    }

    /// Record `oid` as SSD resident; returns the entry it pushed out, if any
    pub fn insert(&self, oid: ObjectId, rank: ObjRank) -> Option<ObjectId> {
        if self.capacity == 0 {
            return None;
        }
        let mut state = self.state.lock();
        state.demotions.remove(&oid);
        state.remove(&oid);
        let mut evicted = None;
        if state.table.len() >= self.capacity
            && let Some((tail_rank, tail)) = state.tail()
        {
            state.remove(&tail);
            state.demotions.insert(tail);
            debug!("{} (rank {}) leaves the SSD rank table", tail, tail_rank);
            evicted = Some(tail);
        }
        state.table.insert(oid, rank);
        state.ordered.insert((rank, oid));
        evicted
    }

    /// Refresh the rank of a resident entry
    pub fn update(&self, oid: &ObjectId, rank: ObjRank) -> bool {
        let mut state = self.state.lock();
        if state.remove(oid).is_none() {
            return false;
        }
        state.table.insert(*oid, rank);
        state.ordered.insert((rank, *oid));
        true
    }

    /// Forget `oid` entirely
    pub fn remove(&self, oid: &ObjectId) {
        let mut state = self.state.lock();
        state.remove(oid);
        state.demotions.remove(oid);
    }

    #[must_use]
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.state.lock().table.contains_key(oid)
    }

    #[must_use]
    pub fn rank_of(&self, oid: &ObjectId) -> Option<ObjRank> {
        self.state.lock().table.get(oid).copied()
    }

    #[must_use]
    pub fn is_demotion_candidate(&self, oid: &ObjectId) -> bool {
        self.state.lock().demotions.contains(oid)
    }

    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u8) -> ObjectId {
        ObjectId::from_data(&[n])
    }

    #[test]
    fn test_hits_lower_rank() {
        let engine = RankEngine::new(4);
        let a = oid(1);
        let cold = engine.rank(&a, 5);
        engine.record_access(&a);
        engine.record_access(&a);
        assert!(engine.rank(&a, 5) < cold);
        assert!(engine.rank(&oid(2), 1) < engine.rank(&oid(2), 10));
    }

    #[test]
    fn test_tail_is_numerically_largest() {
        let engine = RankEngine::new(3);
        engine.insert(oid(1), 100);
        engine.insert(oid(2), 300);
        engine.insert(oid(3), 200);
        assert_eq!(engine.tail_rank(), Some(300));
        assert!(engine.should_place_on_ssd(299));
        assert!(!engine.should_place_on_ssd(300));
    }

    #[test]
    fn test_insert_evicts_tail_into_demotions() {
        let engine = RankEngine::new(2);
        assert!(engine.should_place_on_ssd(u64::MAX));
        engine.insert(oid(1), 10);
        engine.insert(oid(2), 20);
        assert_eq!(engine.insert(oid(3), 5), Some(oid(2)));
        assert!(engine.is_demotion_candidate(&oid(2)));
        assert!(!engine.contains(&oid(2)));
        assert_eq!(engine.len(), 2);

        engine.insert(oid(2), 1);
        assert!(!engine.is_demotion_candidate(&oid(2)));
        engine.remove(&oid(1));
        assert!(!engine.contains(&oid(1)));
    }

    #[test]
    fn test_update_reorders() {
        let engine = RankEngine::new(4);
        engine.insert(oid(1), 10);
        engine.insert(oid(2), 20);
        assert!(engine.update(&oid(1), 30));
        assert_eq!(engine.tail_rank(), Some(30));
        assert!(!engine.update(&oid(9), 1));
    }

    #[test]
    fn test_counters_age() {
        let engine = RankEngine::new(1);
        for _ in 0..4 {
            engine.record_access(&oid(0));
        }
        for n in 1..=1024u32 {
            engine.record_access(&ObjectId::from_data(&n.to_le_bytes()));
        }
        assert!(engine.hits(&oid(0)) < 4);
    }
}
