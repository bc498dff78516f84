//! Copy-forward compaction of one token's files on one tier

use crate::data_io::record_len;
use crate::object_store::ObjectStore;
use fds_common::{Result, SmTokenId, Tier, now_millis};
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of compacting one token
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactStats {
    pub files_removed: usize,
    pub objects_copied: usize,
    pub objects_expunged: usize,
    pub bytes_reclaimed: u64,
}

/// Rewrites the live records of a token into a fresh file and drops the
/// old files
///
/// Zero-ref objects older than the grace period are expunged: their tier
/// location is cleared and, once no tier holds them, their metadata goes.
pub struct TokenCompactor<'a> {
    store: &'a ObjectStore,
}

impl<'a> TokenCompactor<'a> {
    pub const fn new(store: &'a ObjectStore) -> Self {
        Self { store }
    }

    pub fn compact(&self, tier: Tier, token: SmTokenId, grace: Duration) -> Result<CompactStats> {
        let data = self.store.data_io();
        let meta_store = self.store.meta_store();
        let locks = self.store.locks();
        let mut stats = CompactStats::default();

        let old = data.rotate_for_compaction(tier, token)?;
        if old.is_empty() {
            return Ok(stats);
        }
        // Writers that picked an old file before the rotation finish first
        locks.barrier();

        let old_bytes: u64 = data
            .token_stats(tier, token)?
            .iter()
            .filter(|s| old.contains(&s.file_id))
            .map(|s| s.size)
            .sum();
        let grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        let now = now_millis();
        let mut copied_bytes = 0;

        for candidate in meta_store.snapshot_token(token, self.store.token_bits())? {
            if !candidate
                .location(tier)
                .is_some_and(|loc| old.contains(&loc.file_id))
            {
                continue;
            }
            let oid = *candidate.oid();
            let _guard = locks.lock(&oid);
            // Re-read under the lock; the snapshot may be stale
            let Some(mut meta) = meta_store.get(&oid)? else {
                continue;
            };
            let Some(loc) = meta.location(tier).filter(|l| old.contains(&l.file_id)) else {
                continue;
            };

            if meta.is_deleted() && now.saturating_sub(meta.delete_time()) >= grace_ms {
                meta.clear_location(tier);
                if meta.read_tier().is_none() {
                    meta_store.delete(&oid)?;
                } else {
                    meta_store.put(&meta)?;
                }
                stats.objects_expunged += 1;
                debug!("Expunged {} from {}", oid, tier);
                continue;
            }

            let bytes = data.read(tier, &oid, loc)?;
            let new_loc = data.write(tier, &oid, &bytes)?;
            meta.set_location(tier, new_loc);
            meta_store.put(&meta)?;
            if meta.is_deleted() {
                data.account_deleted(tier, &oid, new_loc, meta.size());
            }
            copied_bytes += record_len(meta.size());
            stats.objects_copied += 1;
        }

        for file_id in &old {
            data.delete_file(tier, token, *file_id)?;
            stats.files_removed += 1;
        }
        stats.bytes_reclaimed = old_bytes.saturating_sub(copied_bytes);
        info!(
            "Compacted token {} on {}: {} files removed, {} copied, {} expunged, {} reclaimed",
            token,
            tier,
            stats.files_removed,
            stats.objects_copied,
            stats.objects_expunged,
            stats.bytes_reclaimed
        );
        Ok(stats)
    }
}
