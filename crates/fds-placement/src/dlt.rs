//! Data Location Table
//!
//! Maps each SM token to the group of SM nodes holding it; the first node
//! of a column is the token's primary.

use crate::table::{TableHolder, Versioned};
use fds_common::{Error, NodeUuid, ObjectId, Result, SmTokenId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable DLT snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dlt {
    version: u64,
    num_bits: u32,
    /// One node group per token
    columns: Vec<Vec<NodeUuid>>,
}

impl Dlt {
    /// Build a DLT; there must be exactly `2^num_bits` non-empty columns
    pub fn new(version: u64, num_bits: u32, columns: Vec<Vec<NodeUuid>>) -> Result<Self> {
        if num_bits == 0 || num_bits > 16 {
            return Err(Error::invalid_argument(format!(
                "DLT token width {num_bits} out of range"
            )));
        }
        let expected = 1usize << num_bits;
        if columns.len() != expected {
            return Err(Error::invalid_argument(format!(
                "DLT has {} columns, expected {expected}",
                columns.len()
            )));
        }
        if let Some(t) = columns.iter().position(Vec::is_empty) {
            return Err(Error::invalid_argument(format!("DLT token {t} has no nodes")));
        }
        Ok(Self {
            version,
            num_bits,
            columns,
        })
    }

    /// Spread tokens over `nodes` round-robin with `depth` replicas each
    pub fn round_robin(
        version: u64,
        num_bits: u32,
        nodes: &[NodeUuid],
        depth: usize,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::invalid_argument("DLT needs at least one node"));
        }
        let depth = depth.clamp(1, nodes.len());
        let columns = (0..1usize << num_bits.min(16))
            .map(|t| (0..depth).map(|i| nodes[(t + i) % nodes.len()]).collect())
            .collect();
        Self::new(version, num_bits, columns)
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Width of a token in bits
    #[must_use]
    pub const fn num_bits_for_token(&self) -> u32 {
        self.num_bits
    }

    #[must_use]
    pub fn num_tokens(&self) -> usize {
        self.columns.len()
    }

    /// Token an object hashes to
    #[must_use]
    pub fn get_token(&self, oid: &ObjectId) -> SmTokenId {
        oid.token(self.num_bits)
    }

    /// Node group for a token
    #[must_use]
    pub fn get_nodes(&self, token: SmTokenId) -> &[NodeUuid] {
        self.columns
            .get(token as usize)
            .map_or(&[], Vec::as_slice)
    }

    /// Primary node for a token
    #[must_use]
    pub fn get_primary(&self, token: SmTokenId) -> Option<NodeUuid> {
        self.get_nodes(token).first().copied()
    }

    /// Primary node for an object
    #[must_use]
    pub fn primary_for(&self, oid: &ObjectId) -> Option<NodeUuid> {
        self.get_primary(self.get_token(oid))
    }

    /// Tokens whose group contains `node`
    #[must_use]
    pub fn tokens_owned_by(&self, node: NodeUuid) -> Vec<SmTokenId> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, col)| col.contains(&node))
            .filter_map(|(t, _)| SmTokenId::try_from(t).ok())
            .collect()
    }

    fn check_compatible(&self, other: &Self) -> Result<()> {
        if self.num_bits != other.num_bits {
            return Err(Error::invalid_argument(format!(
                "DLT token width changed from {} to {}",
                self.num_bits, other.num_bits
            )));
        }
        Ok(())
    }

    /// Tokens `node` holds in `self` but not in `old`, with the old
    /// primary to migrate each from
    pub fn tokens_gained(
        &self,
        old: &Self,
        node: NodeUuid,
    ) -> Result<BTreeMap<SmTokenId, NodeUuid>> {
        self.check_compatible(old)?;
        let mut gained = BTreeMap::new();
        for token in self.tokens_owned_by(node) {
            if old.get_nodes(token).contains(&node) {
                continue;
            }
            if let Some(source) = old.get_primary(token) {
                gained.insert(token, source);
            }
        }
        Ok(gained)
    }

    /// Tokens `node` held in `old` but not in `self`, with the new primary
    pub fn tokens_lost(&self, old: &Self, node: NodeUuid) -> Result<BTreeMap<SmTokenId, NodeUuid>> {
        self.check_compatible(old)?;
        let mut lost = BTreeMap::new();
        for token in old.tokens_owned_by(node) {
            if self.get_nodes(token).contains(&node) {
                continue;
            }
            if let Some(dest) = self.get_primary(token) {
                lost.insert(token, dest);
            }
        }
        Ok(lost)
    }

    /// Serialize for the wire
    pub fn marshall(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn unmarshall(data: &[u8]) -> Result<Self> {
        let dlt: Self = bincode::deserialize(data)?;
        Self::new(dlt.version, dlt.num_bits, dlt.columns)
    }
}

impl Versioned for Dlt {
    fn version(&self) -> u64 {
        Self::version(self)
    }
}

/// Current DLT of this node
pub type DltManager = TableHolder<Dlt>;

impl DltManager {
    #[must_use]
    pub fn for_dlt() -> Self {
        Self::new("DLT")
    }
}
