//! Data Manager Table
//!
//! Maps volumes to DM node groups. A volume lives in column
//! `volume_id % columns`; the first node of the column is its primary.

use crate::table::{TableHolder, Versioned};
use fds_common::{Error, NodeUuid, Result, VolumeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable DMT snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dmt {
    version: u64,
    columns: Vec<Vec<NodeUuid>>,
}

impl Dmt {
    pub fn new(version: u64, columns: Vec<Vec<NodeUuid>>) -> Result<Self> {
        if columns.is_empty() || columns.iter().any(Vec::is_empty) {
            return Err(Error::invalid_argument("DMT columns must be non-empty"));
        }
        Ok(Self { version, columns })
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    fn column(&self, vol: VolumeId) -> &[NodeUuid] {
        let idx = usize::try_from(vol.get() % self.columns.len() as u64).unwrap_or(0);
        &self.columns[idx]
    }

    /// DM group for a volume
    #[must_use]
    pub fn get_nodes(&self, vol: VolumeId) -> &[NodeUuid] {
        self.column(vol)
    }

    #[must_use]
    pub fn get_primary(&self, vol: VolumeId) -> Option<NodeUuid> {
        self.column(vol).first().copied()
    }

    #[must_use]
    pub fn is_primary(&self, vol: VolumeId, node: NodeUuid) -> bool {
        self.get_primary(vol) == Some(node)
    }

    /// Of `volumes`, those `node` serves in `self` but did not in `old`,
    /// with the old primary to migrate each from
    #[must_use]
    pub fn volumes_gained(
        &self,
        old: &Self,
        node: NodeUuid,
        volumes: &[VolumeId],
    ) -> BTreeMap<VolumeId, NodeUuid> {
        volumes
            .iter()
            .filter(|&&v| self.get_nodes(v).contains(&node) && !old.get_nodes(v).contains(&node))
            .filter_map(|&v| old.get_primary(v).map(|src| (v, src)))
            .collect()
    }

    /// Of `volumes`, those `node` served in `old` but no longer does
    #[must_use]
    pub fn volumes_lost(&self, old: &Self, node: NodeUuid, volumes: &[VolumeId]) -> Vec<VolumeId> {
        volumes
            .iter()
            .copied()
            .filter(|&v| old.get_nodes(v).contains(&node) && !self.get_nodes(v).contains(&node))
            .collect()
    }
}

impl Versioned for Dmt {
    fn version(&self) -> u64 {
        Self::version(self)
    }
}

/// Current DMT of this node
pub type DmtManager = TableHolder<Dmt>;

impl DmtManager {
    #[must_use]
    pub fn for_dmt() -> Self {
        Self::new("DMT")
    }
}
