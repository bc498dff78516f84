//! Per-disk selection of tokens worth compacting

use crate::data_io::DataIo;
use fds_common::{DiskId, Result, SmTokenId, Tier};
use tracing::debug;

pub struct DiskScavenger {
    tier: Tier,
    disk: DiskId,
}

impl DiskScavenger {
    pub const fn new(tier: Tier, disk: DiskId) -> Self {
        Self { tier, disk }
    }

    pub const fn tier(&self) -> Tier {
        self.tier
    }

    pub const fn disk(&self) -> DiskId {
        self.disk
    }

    /// Tokens on this disk whose reclaimable share reaches `threshold_percent`
    pub fn tokens_to_compact(
        &self,
        data: &DataIo,
        threshold_percent: u8,
    ) -> Result<Vec<SmTokenId>> {
        let mut picked = Vec::new();
        for token in data.olt().tokens_for_disk(self.tier, self.disk) {
            let (size, deleted) = data
                .token_stats(self.tier, token)?
                .iter()
                .fold((0u64, 0u64), |(s, d), f| (s + f.size, d + f.deleted));
            if deleted > 0 && deleted * 100 >= size * u64::from(threshold_percent) {
                debug!(
                    "Token {} on {} disk {}: {}/{} bytes reclaimable",
                    token,
                    self.tier,
                    self.disk.get(),
                    deleted,
                    size
                );
                picked.push(token);
            }
        }
        Ok(picked)
    }
}
