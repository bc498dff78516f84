//! Messages exchanged between SM token-migration peers

use bytes::Bytes;
use fds_common::{NodeUuid, ObjectId, Result, SmTokenId};
use serde::{Deserialize, Serialize};

/// Which part of the copy a metadata batch belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Snapshot of the token as of the sync start
    Static,
    /// Changes made while the static copy ran
    Delta,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmMigrationMsg {
    /// Receiver asks the old owner to copy a token; objects modified in
    /// `[start_time, end_time]` (ms) form the static window
    SyncStart {
        token: SmTokenId,
        dlt_version: u64,
        start_time: u64,
        end_time: u64,
    },
    /// Marshalled object metadata; `seq` runs contiguously from 0 per phase
    MetadataBatch {
        token: SmTokenId,
        dlt_version: u64,
        phase: SyncPhase,
        seq: u64,
        last: bool,
        entries: Vec<Vec<u8>>,
    },
    /// Objects the receiver has metadata for but no bytes
    PullRequest {
        token: SmTokenId,
        dlt_version: u64,
        oids: Vec<ObjectId>,
        last: bool,
    },
    /// Bytes answering a pull request
    PushObjects {
        token: SmTokenId,
        dlt_version: u64,
        objects: Vec<(ObjectId, Bytes)>,
        /// Requested objects the sender no longer holds
        not_found: Vec<ObjectId>,
    },
    /// Receiver has every object it asked for
    PullComplete { token: SmTokenId, dlt_version: u64 },
    /// Receiver owns and serves the token
    SyncComplete { token: SmTokenId, dlt_version: u64 },
    Abort {
        token: SmTokenId,
        dlt_version: u64,
        reason: String,
    },
}

impl SmMigrationMsg {
    pub const fn token(&self) -> SmTokenId {
        match self {
            Self::SyncStart { token, .. }
            | Self::MetadataBatch { token, .. }
            | Self::PullRequest { token, .. }
            | Self::PushObjects { token, .. }
            | Self::PullComplete { token, .. }
            | Self::SyncComplete { token, .. }
            | Self::Abort { token, .. } => *token,
        }
    }

    pub const fn dlt_version(&self) -> u64 {
        match self {
            Self::SyncStart { dlt_version, .. }
            | Self::MetadataBatch { dlt_version, .. }
            | Self::PullRequest { dlt_version, .. }
            | Self::PushObjects { dlt_version, .. }
            | Self::PullComplete { dlt_version, .. }
            | Self::SyncComplete { dlt_version, .. }
            | Self::Abort { dlt_version, .. } => *dlt_version,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SyncStart { .. } => "SyncStart",
            Self::MetadataBatch { .. } => "MetadataBatch",
            Self::PullRequest { .. } => "PullRequest",
            Self::PushObjects { .. } => "PushObjects",
            Self::PullComplete { .. } => "PullComplete",
            Self::SyncComplete { .. } => "SyncComplete",
            Self::Abort { .. } => "Abort",
        }
    }

    /// Wire encoding for transports that carry bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| fds_common::Error::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| fds_common::Error::Serialization(e.to_string()))
    }
}

/// Delivers migration messages to a peer SM
pub trait SmMigrationTransport: Send + Sync {
    fn send(&self, to: NodeUuid, from: NodeUuid, msg: SmMigrationMsg) -> Result<()>;
}
