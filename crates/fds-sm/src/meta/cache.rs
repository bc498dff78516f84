//! Adaptive Replacement Cache for object metadata
//!
//! - T1: entries seen once recently
//! - T2: entries seen at least twice
//! - B1 / B2: ghosts of entries evicted from T1 / T2
//!
//! Hits in the ghost lists move the target size `p` of T1, so the cache
//! leans towards recency or frequency as the workload dictates.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Hit ratio in [0, 1]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 { 0.0 } else { hits / total }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum List {
    T1,
    T2,
    B1,
    B2,
}

struct ArcState<K, V> {
    t1: VecDeque<K>,
    t2: VecDeque<K>,
    b1: VecDeque<K>,
    b2: VecDeque<K>,
    values: HashMap<K, V>,
    p: usize,
    capacity: usize,
}

impl<K: Clone + Eq + Hash, V> ArcState<K, V> {
    fn find(&self, key: &K) -> Option<List> {
        if self.t1.contains(key) {
            Some(List::T1)
        } else if self.t2.contains(key) {
            Some(List::T2)
        } else if self.b1.contains(key) {
            Some(List::B1)
        } else if self.b2.contains(key) {
            Some(List::B2)
        } else {
            None
        }
    }

    fn list_mut(&mut self, list: List) -> &mut VecDeque<K> {
        match list {
            List::T1 => &mut self.t1,
            List::T2 => &mut self.t2,
            List::B1 => &mut self.b1,
            List::B2 => &mut self.b2,
        }
    }

    fn unlink(&mut self, key: &K, list: List) {
        self.list_mut(list).retain(|k| k != key);
    }

    /// Evict one resident entry into its ghost list
    fn replace(&mut self, in_b2: bool) -> bool {
        let t1_len = self.t1.len();
        let from_t1 = t1_len > 0 && (t1_len > self.p || (in_b2 && t1_len == self.p));
        let (from, ghost) = if from_t1 || self.t2.is_empty() {
            (List::T1, List::B1)
        } else {
            (List::T2, List::B2)
        };
        let Some(victim) = self.list_mut(from).pop_front() else {
            return false;
        };
        self.values.remove(&victim);
        self.list_mut(ghost).push_back(victim);
        true
    }
}

/// Bounded ARC cache
pub struct ArcCache<K, V> {
    state: Mutex<ArcState<K, V>>,
    stats: CacheStats,
}

impl<K: Clone + Eq + Hash, V: Clone> ArcCache<K, V> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ArcState {
                t1: VecDeque::new(),
                t2: VecDeque::new(),
                b1: VecDeque::new(),
                b2: VecDeque::new(),
                values: HashMap::with_capacity(capacity),
                p: 0,
                capacity: capacity.max(1),
            }),
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        match state.find(key) {
            Some(list @ (List::T1 | List::T2)) => {
                state.unlink(key, list);
                state.t2.push_back(key.clone());
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                state.values.get(key).cloned()
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: K, value: V) {
        let mut state = self.state.lock();
        let capacity = state.capacity;

        match state.find(&key) {
            Some(list @ (List::T1 | List::T2)) => {
                state.unlink(&key, list);
                state.t2.push_back(key.clone());
                state.values.insert(key, value);
                return;
            }
            Some(List::B1) => {
                let delta = (state.b2.len() / state.b1.len().max(1)).max(1);
                state.p = (state.p + delta).min(capacity);
                state.unlink(&key, List::B1);
                if state.t1.len() + state.t2.len() >= capacity && state.replace(false) {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                state.t2.push_back(key.clone());
                state.values.insert(key, value);
                return;
            }
            Some(List::B2) => {
                let delta = (state.b1.len() / state.b2.len().max(1)).max(1);
                state.p = state.p.saturating_sub(delta);
                state.unlink(&key, List::B2);
                if state.t1.len() + state.t2.len() >= capacity && state.replace(true) {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                state.t2.push_back(key.clone());
                state.values.insert(key, value);
                return;
            }
            None => {}
        }

        let l1 = state.t1.len() + state.b1.len();
        let total = l1 + state.t2.len() + state.b2.len();
        if l1 >= capacity {
            if state.t1.len() < capacity {
                state.b1.pop_front();
                if state.replace(false) {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
            } else if let Some(victim) = state.t1.pop_front() {
                state.values.remove(&victim);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        } else if total >= capacity {
            if total >= 2 * capacity {
                state.b2.pop_front();
            }
            if state.t1.len() + state.t2.len() >= capacity && state.replace(false) {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        state.t1.push_back(key.clone());
        state.values.insert(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        if let Some(list) = state.find(key) {
            state.unlink(key, list);
        }
        state.values.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.t1.clear();
        state.t2.clear();
        state.b1.clear();
        state.b2.clear();
        state.values.clear();
        state.p = 0;
    }

    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let cache = ArcCache::new(10);
        cache.put(1u32, "one");
        cache.put(2u32, "two");
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&3), None);
        assert!(cache.stats().hit_ratio() > 0.0);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = ArcCache::new(3);
        for k in 0u32..20 {
            cache.put(k, k);
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.get(&19), Some(19));
        assert!(cache.get(&0).is_none());
    }

    #[test]
    fn test_frequent_entries_survive_scan() {
        let cache = ArcCache::new(4);
        cache.put(100u32, 100);
        cache.get(&100);
        cache.get(&100);
        for k in 0u32..3 {
            cache.put(k, k);
        }
        cache.put(3, 3);
        assert_eq!(cache.get(&100), Some(100));
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = ArcCache::new(4);
        cache.put(1u32, 1);
        assert_eq!(cache.remove(&1), Some(1));
        assert!(!cache.contains(&1));
        cache.put(2, 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
