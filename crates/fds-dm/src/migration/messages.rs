//! Messages exchanged between DM migration peers
//!
//! Every message that carries a `msg_id` is answered with an `Ack` for
//! that id; peers count unanswered messages to know when a phase has
//! really finished.

use crate::blob::{BlobMetaDesc, BlobObjectList};
use fds_common::{BlobVersion, NodeUuid, Result, VolumeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Object list of one blob being migrated
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaBlob {
    pub name: String,
    pub objects: BlobObjectList,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmMigrationMsg {
    /// Destination tells the source which blob versions it already holds
    InitialBlobFilterSet {
        vol: VolumeId,
        dmt_version: u64,
        msg_id: u64,
        filter: BTreeMap<String, BlobVersion>,
    },
    /// Object lists of blobs the destination is missing or has stale;
    /// `seq` runs contiguously from 0
    DeltaBlobs {
        vol: VolumeId,
        dmt_version: u64,
        msg_id: u64,
        seq: u64,
        last: bool,
        blobs: Vec<DeltaBlob>,
    },
    /// Descriptors of the same blobs; a deleted version removes the blob
    DeltaBlobDescs {
        vol: VolumeId,
        dmt_version: u64,
        msg_id: u64,
        seq: u64,
        last: bool,
        descs: Vec<BlobMetaDesc>,
    },
    /// Source has sent, and had acknowledged, every delta
    FinishStaticMigration {
        vol: VolumeId,
        dmt_version: u64,
        msg_id: u64,
    },
    Ack {
        vol: VolumeId,
        dmt_version: u64,
        msg_id: u64,
        error: Option<String>,
    },
    Abort {
        vol: VolumeId,
        dmt_version: u64,
        reason: String,
    },
}

impl DmMigrationMsg {
    pub const fn vol(&self) -> VolumeId {
        match self {
            Self::InitialBlobFilterSet { vol, .. }
            | Self::DeltaBlobs { vol, .. }
            | Self::DeltaBlobDescs { vol, .. }
            | Self::FinishStaticMigration { vol, .. }
            | Self::Ack { vol, .. }
            | Self::Abort { vol, .. } => *vol,
        }
    }

    pub const fn dmt_version(&self) -> u64 {
        match self {
            Self::InitialBlobFilterSet { dmt_version, .. }
            | Self::DeltaBlobs { dmt_version, .. }
            | Self::DeltaBlobDescs { dmt_version, .. }
            | Self::FinishStaticMigration { dmt_version, .. }
            | Self::Ack { dmt_version, .. }
            | Self::Abort { dmt_version, .. } => *dmt_version,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InitialBlobFilterSet { .. } => "InitialBlobFilterSet",
            Self::DeltaBlobs { .. } => "DeltaBlobs",
            Self::DeltaBlobDescs { .. } => "DeltaBlobDescs",
            Self::FinishStaticMigration { .. } => "FinishStaticMigration",
            Self::Ack { .. } => "Ack",
            Self::Abort { .. } => "Abort",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

/// Delivers migration messages to a peer DM
pub trait DmMigrationTransport: Send + Sync {
    fn send(&self, to: NodeUuid, from: NodeUuid, msg: DmMigrationMsg) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fds_common::ObjectId;

    #[test]
    fn test_wire_form() {
        let msg = DmMigrationMsg::DeltaBlobs {
            vol: VolumeId::new(3),
            dmt_version: 7,
            msg_id: 2,
            seq: 0,
            last: true,
            blobs: vec![DeltaBlob {
                name: "a".into(),
                objects: [(0, ObjectId::from_data(b"a"), 1)].into_iter().collect(),
            }],
        };
        let back = DmMigrationMsg::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.vol(), VolumeId::new(3));
        assert_eq!(back.dmt_version(), 7);
        assert_eq!(back.kind(), "DeltaBlobs");
        assert!(DmMigrationMsg::decode(&[0xff; 3]).is_err());
    }
}
