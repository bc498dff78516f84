//! Per-volume placement descriptors

use dashmap::DashMap;
use fds_common::{Error, MediaPolicy, Result, VolumeId};
use tracing::info;

/// Highest relative priority (most important volume)
pub const PRIORITY_HIGHEST: u32 = 1;
/// Lowest relative priority
pub const PRIORITY_LOWEST: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeDesc {
    pub vol: VolumeId,
    pub policy: MediaPolicy,
    /// 1 (highest) ..= 10 (lowest)
    pub relative_priority: u32,
}

impl VolumeDesc {
    #[must_use]
    pub const fn new(vol: VolumeId, policy: MediaPolicy, relative_priority: u32) -> Self {
        Self {
            vol,
            policy,
            relative_priority,
        }
    }
}

/// Volumes known to this SM and how their objects are placed
#[derive(Default)]
pub struct VolumePolicyTable {
    vols: DashMap<VolumeId, VolumeDesc>,
}

impl VolumePolicyTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, desc: VolumeDesc) -> Result<()> {
        if !(PRIORITY_HIGHEST..=PRIORITY_LOWEST).contains(&desc.relative_priority) {
            return Err(Error::invalid_argument(format!(
                "relative priority {} of {} outside {PRIORITY_HIGHEST}..={PRIORITY_LOWEST}",
                desc.relative_priority, desc.vol
            )));
        }
        info!(
            "Volume {} placement {:?} priority {}",
            desc.vol, desc.policy, desc.relative_priority
        );
        self.vols.insert(desc.vol, desc);
        Ok(())
    }

    pub fn deregister(&self, vol: VolumeId) -> Option<VolumeDesc> {
        self.vols.remove(&vol).map(|(_, d)| d)
    }

    pub fn get(&self, vol: VolumeId) -> Option<VolumeDesc> {
        self.vols.get(&vol).map(|d| *d)
    }

    pub fn len(&self) -> usize {
        self.vols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_validates_priority() {
        let table = VolumePolicyTable::new();
        let vol = VolumeId::new(3);
        assert!(table.register(VolumeDesc::new(vol, MediaPolicy::Hybrid, 0)).is_err());
        table
            .register(VolumeDesc::new(vol, MediaPolicy::AllSsd, 2))
            .unwrap();
        assert_eq!(table.get(vol).unwrap().policy, MediaPolicy::AllSsd);
        assert!(table.deregister(vol).is_some());
        assert!(table.get(vol).is_none());
    }
}
