//! Source-side volume migration
//!
//! The old primary answers a destination's blob filter set by streaming
//! the object lists and descriptors of every blob the destination lacks or
//! holds at a different version, then finishes the static pass once every
//! delta has been acknowledged.

use super::base::DmMigrationBase;
use super::messages::DeltaBlob;
use crate::blob::BlobMetaDesc;
use crate::catalog::DmVolumeCatalog;
use fds_common::{BlobVersion, Error, NodeUuid, Result, VolumeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SrcState {
    Idle,
    Streaming,
    AwaitFinishAck,
    Complete,
    Aborted,
}

impl SrcState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }
}

impl fmt::Display for SrcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "IDLE",
            Self::Streaming => "STREAMING",
            Self::AwaitFinishAck => "AWAIT_FINISH_ACK",
            Self::Complete => "COMPLETE",
            Self::Aborted => "ABORTED",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SrcEvent {
    FilterSet,
    /// Every delta message has been acknowledged
    DeltasAcked,
    FinishAcked,
    Abort { notify_peer: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SrcEffect {
    BlockIo,
    SendDeltas,
    SendFinish,
    UnblockIo,
    NotifyPeerAbort,
}

pub fn transition(state: &SrcState, event: SrcEvent) -> Result<(SrcState, Vec<SrcEffect>)> {
    use SrcEffect as E;
    use SrcEvent as Ev;
    use SrcState as S;

    let next = match (*state, event) {
        (S::Complete | S::Aborted, Ev::Abort { .. }) => (*state, Vec::new()),
        (S::Idle, Ev::Abort { notify_peer }) => {
            (S::Aborted, if notify_peer { vec![E::NotifyPeerAbort] } else { Vec::new() })
        }
        (_, Ev::Abort { notify_peer }) => {
            let mut effects = Vec::with_capacity(2);
            if notify_peer {
                effects.push(E::NotifyPeerAbort);
            }
            effects.push(E::UnblockIo);
            (S::Aborted, effects)
        }
        (S::Idle, Ev::FilterSet) => (S::Streaming, vec![E::BlockIo, E::SendDeltas]),
        (S::Streaming, Ev::DeltasAcked) => (S::AwaitFinishAck, vec![E::SendFinish]),
        (S::AwaitFinishAck, Ev::FinishAcked) => (S::Complete, vec![E::UnblockIo]),
        (state, event) => {
            return Err(Error::InvalidTransition(format!(
                "DM migration source cannot take {event:?} in {state}"
            )));
        }
    };
    Ok(next)
}

/// Per-volume context of a migration out of this DM
pub struct DmMigrationSrc {
    pub vol: VolumeId,
    pub dest: NodeUuid,
    pub dmt_version: u64,
    pub state: SrcState,
    pub base: Arc<DmMigrationBase>,
    /// Blob versions the destination already holds
    pub filter: BTreeMap<String, BlobVersion>,
    pub abort_reason: String,
}

impl DmMigrationSrc {
    pub fn new(
        vol: VolumeId,
        dest: NodeUuid,
        dmt_version: u64,
        filter: BTreeMap<String, BlobVersion>,
    ) -> Self {
        Self {
            vol,
            dest,
            dmt_version,
            state: SrcState::Idle,
            base: Arc::new(DmMigrationBase::new(vol)),
            filter,
            abort_reason: String::new(),
        }
    }
}

/// Delta streams for one volume, already split into message-sized batches
#[derive(Debug, Default)]
pub struct DeltaSet {
    pub blobs: Vec<Vec<DeltaBlob>>,
    pub descs: Vec<Vec<BlobMetaDesc>>,
}

impl DeltaSet {
    pub fn blob_count(&self) -> usize {
        self.descs.iter().map(Vec::len).sum()
    }
}

/// Compare the local catalog with the destination's filter set
///
/// Every blob whose version differs from the filter gets its object list
/// and descriptor sent; filter entries unknown here get a deleted
/// descriptor so the destination drops them. Both streams carry at least
/// one (possibly empty) batch.
pub fn build_deltas(
    catalog: &DmVolumeCatalog,
    filter: &BTreeMap<String, BlobVersion>,
    max_blobs: usize,
    max_descs: usize,
) -> Result<DeltaSet> {
    let mut blobs = Vec::new();
    let mut descs = Vec::new();
    let local = catalog.list_blobs()?;
    for desc in &local {
        if filter.get(&desc.name) == Some(&desc.version) {
            continue;
        }
        blobs.push(DeltaBlob {
            name: desc.name.clone(),
            objects: catalog.get_blob_objects(&desc.name)?,
        });
        descs.push(desc.clone());
    }
    for name in filter.keys() {
        if local.binary_search_by(|d| d.name.as_str().cmp(name)).is_err() {
            descs.push(BlobMetaDesc::new(name.clone()));
        }
    }
    Ok(DeltaSet {
        blobs: batches(blobs, max_blobs),
        descs: batches(descs, max_descs),
    })
}

fn batches<T>(items: Vec<T>, per_batch: usize) -> Vec<Vec<T>> {
    let per_batch = per_batch.max(1);
    let mut out = Vec::with_capacity(items.len().div_ceil(per_batch).max(1));
    let mut batch = Vec::with_capacity(per_batch);
    for item in items {
        batch.push(item);
        if batch.len() == per_batch {
            out.push(std::mem::replace(&mut batch, Vec::with_capacity(per_batch)));
        }
    }
    if !batch.is_empty() || out.is_empty() {
        out.push(batch);
    }
    out
}
