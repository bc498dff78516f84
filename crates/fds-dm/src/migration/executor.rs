//! Destination-side volume migration state machine
//!
//! `Init -> FilterSetSent -> ApplyingDeltas -> Complete`, with `Aborted`
//! reachable from every non-terminal state. An executor sits in `Init`
//! while the migration throttle keeps it queued.

use super::base::DmMigrationBase;
use super::dest::DmMigrationDest;
use fds_common::{Error, MigrationSeqNumReceiver, NodeUuid, Result, VolumeId};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorState {
    Init,
    FilterSetSent,
    ApplyingDeltas,
    Complete,
    Aborted,
}

impl ExecutorState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }

    /// Started and holding a throttle slot
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::FilterSetSent | Self::ApplyingDeltas)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::FilterSetSent => "FILTER_SET_SENT",
            Self::ApplyingDeltas => "APPLYING_DELTAS",
            Self::Complete => "COMPLETE",
            Self::Aborted => "ABORTED",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorEvent {
    Start,
    /// A delta message was applied or staged
    DeltaApplied,
    /// Source finished the static pass; `complete` if every delta arrived
    /// and was applied
    StaticFinished { complete: bool },
    Abort { notify_peer: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorEffect {
    /// Quiesce client I/O on the volume
    BlockIo,
    SendFilterSet,
    AckFinish,
    UnblockIo,
    NotifyPeerAbort,
}

pub fn transition(
    state: &ExecutorState,
    event: ExecutorEvent,
) -> Result<(ExecutorState, Vec<ExecutorEffect>)> {
    use ExecutorEffect as E;
    use ExecutorEvent as Ev;
    use ExecutorState as S;

    let next = match (*state, event) {
        (S::Complete | S::Aborted, Ev::Abort { .. }) => (*state, Vec::new()),
        (S::Init, Ev::Abort { .. }) => (S::Aborted, Vec::new()),
        (_, Ev::Abort { notify_peer }) => {
            let mut effects = Vec::with_capacity(2);
            if notify_peer {
                effects.push(E::NotifyPeerAbort);
            }
            effects.push(E::UnblockIo);
            (S::Aborted, effects)
        }
        (S::Init, Ev::Start) => (S::FilterSetSent, vec![E::BlockIo, E::SendFilterSet]),
        (S::FilterSetSent | S::ApplyingDeltas, Ev::DeltaApplied) => (S::ApplyingDeltas, Vec::new()),
        (S::FilterSetSent | S::ApplyingDeltas, Ev::StaticFinished { complete: true }) => {
            (S::Complete, vec![E::AckFinish, E::UnblockIo])
        }
        (S::FilterSetSent | S::ApplyingDeltas, Ev::StaticFinished { complete: false }) => {
            (S::Aborted, vec![E::NotifyPeerAbort, E::UnblockIo])
        }
        (state, event) => {
            return Err(Error::InvalidTransition(format!(
                "DM migration executor cannot take {event:?} in {state}"
            )));
        }
    };
    Ok(next)
}

/// Per-volume context of a migration into this DM
pub struct DmMigrationExecutor {
    pub vol: VolumeId,
    pub source: NodeUuid,
    pub dmt_version: u64,
    pub state: ExecutorState,
    pub base: Arc<DmMigrationBase>,
    pub dest: DmMigrationDest,
    pub blob_seq: MigrationSeqNumReceiver,
    pub desc_seq: MigrationSeqNumReceiver,
    /// Id of the source's finish message, acknowledged on completion
    pub finish_msg_id: Option<u64>,
    pub abort_reason: String,
}

impl DmMigrationExecutor {
    pub fn new(vol: VolumeId, source: NodeUuid, dmt_version: u64) -> Self {
        Self {
            vol,
            source,
            dmt_version,
            state: ExecutorState::Init,
            base: Arc::new(DmMigrationBase::new(vol)),
            dest: DmMigrationDest::new(vol),
            blob_seq: MigrationSeqNumReceiver::new(),
            desc_seq: MigrationSeqNumReceiver::new(),
            finish_msg_id: None,
            abort_reason: String::new(),
        }
    }

    /// Every delta stream is whole and nothing is left to apply
    pub fn deltas_complete(&self) -> bool {
        self.blob_seq.is_complete() && self.desc_seq.is_complete() && !self.dest.has_deferred()
    }
}
