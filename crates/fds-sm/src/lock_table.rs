//! Hashed per-object lock table
//!
//! A fixed number of mutexes; an object id picks its bucket by hash, so two
//! objects in the same bucket serialize even though they are unrelated.

use fds_common::ObjectId;
use parking_lot::{Mutex, MutexGuard};
use xxhash_rust::xxh64::xxh64;

pub struct ObjectLockTable {
    buckets: Vec<Mutex<()>>,
}

impl ObjectLockTable {
    #[must_use]
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn bucket(&self, oid: &ObjectId) -> usize {
        (xxh64(oid.as_bytes(), 0) % self.buckets.len() as u64) as usize
    }

    /// Serialize with every other holder of `oid`'s bucket
    pub fn lock(&self, oid: &ObjectId) -> MutexGuard<'_, ()> {
        self.buckets[self.bucket(oid)].lock()
    }

    /// Wait for every mutation that started before this call
    pub fn barrier(&self) {
        for bucket in &self.buckets {
            drop(bucket.lock());
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn test_same_object_serializes() {
        let table = Arc::new(ObjectLockTable::new(16));
        let oid = ObjectId::from_data(b"shared");
        let inside = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = table.lock(&oid);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_bucket_is_stable() {
        let table = ObjectLockTable::new(7);
        let oid = ObjectId::from_data(b"x");
        assert_eq!(table.bucket(&oid), table.bucket(&oid));
        assert!(table.bucket(&oid) < 7);
        assert_eq!(ObjectLockTable::new(0).len(), 1);
        table.barrier();
    }
}
