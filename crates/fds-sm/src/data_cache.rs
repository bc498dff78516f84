//! Object data cache
//!
//! Read-through LRU over object bytes. Recency is a logical clock stamped
//! on every hit, so lookups only take the read lock.

use bytes::Bytes;
use fds_common::ObjectId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

struct Entry {
    data: Bytes,
    last_access: AtomicU64,
}

pub struct ObjectDataCache {
    entries: RwLock<HashMap<ObjectId, Entry>>,
    capacity: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ObjectDataCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
            capacity,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, oid: &ObjectId) -> Option<Bytes> {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(oid) {
            entry.last_access.store(self.tick(), Ordering::Relaxed);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.data.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn insert(&self, oid: ObjectId, data: Bytes) {
        if self.capacity == 0 {
            return;
        }
        let clock = self.tick();
        let mut entries = self.entries.write();
        if !entries.contains_key(&oid) && entries.len() >= self.capacity {
            let victim = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                .map(|(k, _)| *k);
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }
        entries.insert(
            oid,
            Entry {
                data,
                last_access: AtomicU64::new(clock),
            },
        );
    }

    pub fn invalidate(&self, oid: &ObjectId) -> Option<Bytes> {
        self.entries.write().remove(oid).map(|e| e.data)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
