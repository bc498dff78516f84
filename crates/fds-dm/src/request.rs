//! DM client requests
//!
//! Every request runs on its volume's QoS queue and hands its result to
//! the callback it carries. Transaction requests need the volume's
//! primary; reads are served by any member of its DMT group.

use crate::blob::{BlobMetaDesc, BlobNode, BlobObjectList, MetadataPair};
use crate::catalog::VolumeStats;
use crate::commit_log::{CommitOutcome, TxMode};
use crate::volume::DmVolume;
use fds_common::{BlobTxId, ObjectId, Result, VolumeId};
use std::fmt;
use std::path::PathBuf;

pub type DmCallback<T> = Box<dyn FnOnce(Result<T>) + Send>;

pub enum DmIoReq {
    StartBlobTx {
        vol: VolumeId,
        tx: BlobTxId,
        blob: String,
        mode: TxMode,
        cb: DmCallback<()>,
    },
    UpdateCatalog {
        vol: VolumeId,
        tx: BlobTxId,
        objects: BlobObjectList,
        cb: DmCallback<()>,
    },
    SetBlobMetadata {
        vol: VolumeId,
        tx: BlobTxId,
        pairs: Vec<MetadataPair>,
        cb: DmCallback<()>,
    },
    DeleteBlob {
        vol: VolumeId,
        tx: BlobTxId,
        cb: DmCallback<()>,
    },
    CommitBlobTx {
        vol: VolumeId,
        tx: BlobTxId,
        cb: DmCallback<CommitOutcome>,
    },
    AbortBlobTx {
        vol: VolumeId,
        tx: BlobTxId,
        cb: DmCallback<()>,
    },
    GetBlob {
        vol: VolumeId,
        name: String,
        cb: DmCallback<BlobNode>,
    },
    GetBlobMeta {
        vol: VolumeId,
        name: String,
        cb: DmCallback<BlobMetaDesc>,
    },
    ListBlobs {
        vol: VolumeId,
        cb: DmCallback<Vec<BlobMetaDesc>>,
    },
    StatVolume {
        vol: VolumeId,
        cb: DmCallback<VolumeStats>,
    },
    ExpungeList {
        vol: VolumeId,
        cb: DmCallback<Vec<(ObjectId, u32)>>,
    },
    ClearExpunged {
        vol: VolumeId,
        oids: Vec<ObjectId>,
        cb: DmCallback<()>,
    },
    SnapshotVolume {
        vol: VolumeId,
        snap_id: u64,
        cb: DmCallback<PathBuf>,
    },
}

impl DmIoReq {
    pub const fn vol(&self) -> VolumeId {
        match self {
            Self::StartBlobTx { vol, .. }
            | Self::UpdateCatalog { vol, .. }
            | Self::SetBlobMetadata { vol, .. }
            | Self::DeleteBlob { vol, .. }
            | Self::CommitBlobTx { vol, .. }
            | Self::AbortBlobTx { vol, .. }
            | Self::GetBlob { vol, .. }
            | Self::GetBlobMeta { vol, .. }
            | Self::ListBlobs { vol, .. }
            | Self::StatVolume { vol, .. }
            | Self::ExpungeList { vol, .. }
            | Self::ClearExpunged { vol, .. }
            | Self::SnapshotVolume { vol, .. } => *vol,
        }
    }

    /// Whether only the volume's primary may serve it
    pub const fn is_write(&self) -> bool {
        matches!(
            self,
            Self::StartBlobTx { .. }
                | Self::UpdateCatalog { .. }
                | Self::SetBlobMetadata { .. }
                | Self::DeleteBlob { .. }
                | Self::CommitBlobTx { .. }
                | Self::AbortBlobTx { .. }
        )
    }

    /// Run against `volume` and hand the result to the callback
    pub fn execute(self, volume: &DmVolume) {
        let log = volume.commit_log();
        let catalog = volume.catalog();
        match self {
            Self::StartBlobTx {
                tx, blob, mode, cb, ..
            } => cb(log.start_tx(tx, &blob, mode)),
            Self::UpdateCatalog {
                tx, objects, cb, ..
            } => cb(log.update_catalog(tx, &objects)),
            Self::SetBlobMetadata { tx, pairs, cb, .. } => cb(log.set_blob_metadata(tx, &pairs)),
            Self::DeleteBlob { tx, cb, .. } => cb(log.delete_blob(tx)),
            Self::CommitBlobTx { tx, cb, .. } => cb(log.commit(tx)),
            Self::AbortBlobTx { tx, cb, .. } => cb(log.abort(tx)),
            Self::GetBlob { name, cb, .. } => cb(catalog.get_blob(&name)),
            Self::GetBlobMeta { name, cb, .. } => cb(catalog.get_blob_meta(&name)),
            Self::ListBlobs { cb, .. } => cb(catalog.list_blobs()),
            Self::StatVolume { cb, .. } => cb(catalog.stat()),
            Self::ExpungeList { cb, .. } => cb(catalog.expunge_list()),
            Self::ClearExpunged { oids, cb, .. } => cb(catalog.clear_expunged(&oids)),
            Self::SnapshotVolume { snap_id, cb, .. } => cb(catalog.snapshot(snap_id)),
        }
    }
}

impl fmt::Debug for DmIoReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vol = self.vol();
        match self {
            Self::StartBlobTx { tx, blob, mode, .. } => {
                write!(f, "StartBlobTx({vol}, {tx}, {blob}, {mode:?})")
            }
            Self::UpdateCatalog { tx, objects, .. } => {
                write!(f, "UpdateCatalog({vol}, {tx}, {} objs)", objects.len())
            }
            Self::SetBlobMetadata { tx, pairs, .. } => {
                write!(f, "SetBlobMetadata({vol}, {tx}, {} pairs)", pairs.len())
            }
            Self::DeleteBlob { tx, .. } => write!(f, "DeleteBlob({vol}, {tx})"),
            Self::CommitBlobTx { tx, .. } => write!(f, "CommitBlobTx({vol}, {tx})"),
            Self::AbortBlobTx { tx, .. } => write!(f, "AbortBlobTx({vol}, {tx})"),
            Self::GetBlob { name, .. } => write!(f, "GetBlob({vol}, {name})"),
            Self::GetBlobMeta { name, .. } => write!(f, "GetBlobMeta({vol}, {name})"),
            Self::ListBlobs { .. } => write!(f, "ListBlobs({vol})"),
            Self::StatVolume { .. } => write!(f, "StatVolume({vol})"),
            Self::ExpungeList { .. } => write!(f, "ExpungeList({vol})"),
            Self::ClearExpunged { oids, .. } => {
                write!(f, "ClearExpunged({vol}, {} objs)", oids.len())
            }
            Self::SnapshotVolume { snap_id, .. } => write!(f, "SnapshotVolume({vol}, {snap_id})"),
        }
    }
}
