//! Object Location Table
//!
//! Local placement of SM tokens onto disks: for every tier, each token is
//! owned by exactly one disk of that tier.

use fds_common::{DiskId, Error, Result, SmTokenId, Tier};
use serde::{Deserialize, Serialize};

/// (tier, token) -> disk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLocationTable {
    num_tokens: u32,
    /// Indexed by `Tier::as_u8()`, then token; empty for a tier with no disks
    table: [Vec<DiskId>; 2],
}

impl ObjectLocationTable {
    /// Table with no tier populated
    #[must_use]
    pub fn new(num_tokens: u32) -> Self {
        Self {
            num_tokens,
            table: [Vec::new(), Vec::new()],
        }
    }

    #[must_use]
    pub const fn num_tokens(&self) -> u32 {
        self.num_tokens
    }

    /// Whether any disk backs `tier`
    #[must_use]
    pub fn has_tier(&self, tier: Tier) -> bool {
        !self.table[usize::from(tier.as_u8())].is_empty()
    }

    /// Disk holding `token` on `tier`
    #[must_use]
    pub fn get_disk_id(&self, token: SmTokenId, tier: Tier) -> Option<DiskId> {
        self.table[usize::from(tier.as_u8())]
            .get(token as usize)
            .copied()
    }

    /// Reassign a token on a tier
    pub fn set_disk_id(&mut self, token: SmTokenId, tier: Tier, disk: DiskId) -> Result<()> {
        if token >= self.num_tokens {
            return Err(Error::invalid_argument(format!("token {token} out of range")));
        }
        let column = &mut self.table[usize::from(tier.as_u8())];
        if column.is_empty() {
            column.resize(self.num_tokens as usize, disk);
        }
        column[token as usize] = disk;
        Ok(())
    }

    /// Tokens placed on `disk` in `tier`
    #[must_use]
    pub fn tokens_for_disk(&self, tier: Tier, disk: DiskId) -> Vec<SmTokenId> {
        self.table[usize::from(tier.as_u8())]
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == disk)
            .filter_map(|(t, _)| SmTokenId::try_from(t).ok())
            .collect()
    }

    /// Distinct disks of a tier
    #[must_use]
    pub fn disks(&self, tier: Tier) -> Vec<DiskId> {
        let mut disks = self.table[usize::from(tier.as_u8())].clone();
        disks.sort_unstable();
        disks.dedup();
        disks
    }

    pub fn marshall(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn unmarshall(data: &[u8]) -> Result<Self> {
        let olt: Self = bincode::deserialize(data)?;
        for column in &olt.table {
            if !column.is_empty() && column.len() != olt.num_tokens as usize {
                return Err(Error::Serialization("OLT column length mismatch".into()));
            }
        }
        Ok(olt)
    }
}

/// Computes the initial token-to-disk assignment
pub struct SmTokenPlacement;

impl SmTokenPlacement {
    /// Assign tokens to the disks of each tier round-robin
    pub fn compute(
        num_tokens: u32,
        hdd_disks: &[DiskId],
        ssd_disks: &[DiskId],
    ) -> Result<ObjectLocationTable> {
        if hdd_disks.is_empty() && ssd_disks.is_empty() {
            return Err(Error::Configuration("SM has no disks".into()));
        }
        let mut olt = ObjectLocationTable::new(num_tokens);
        for (tier, disks) in [(Tier::Hdd, hdd_disks), (Tier::Ssd, ssd_disks)] {
            if disks.is_empty() {
                continue;
            }
            olt.table[usize::from(tier.as_u8())] = (0..num_tokens as usize)
                .map(|t| disks[t % disks.len()])
                .collect();
        }
        Ok(olt)
    }
}
