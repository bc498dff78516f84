//! Token receiver state machine
//!
//! `Init -> SyncRequested -> StaticCopy -> DeltaSync -> [PullPhase] -> Complete`,
//! with `Aborted` reachable from every non-terminal state. The transition
//! function is pure; the migration manager carries out the effects.

use fds_common::{Error, Result};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    Init,
    SyncRequested,
    StaticCopy,
    DeltaSync,
    PullPhase { outstanding: usize },
    Complete,
    Aborted,
}

impl ReceiverState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("INIT"),
            Self::SyncRequested => f.write_str("SYNC_REQUESTED"),
            Self::StaticCopy => f.write_str("STATIC_COPY"),
            Self::DeltaSync => f.write_str("DELTA_SYNC"),
            Self::PullPhase { outstanding } => write!(f, "PULL_PHASE({outstanding})"),
            Self::Complete => f.write_str("COMPLETE"),
            Self::Aborted => f.write_str("ABORTED"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverEvent {
    Start,
    /// A static metadata batch was applied; `complete` once the stream is whole
    StaticBatch { complete: bool },
    /// A delta batch was applied; `missing` objects still lack bytes
    DeltaBatch { complete: bool, missing: usize },
    /// Pushed objects were stored (or reported gone by the sender)
    ObjectsPushed { count: usize },
    Abort { notify_peer: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverEffect {
    SendSyncStart,
    SendPullRequests,
    NotifyPullComplete,
    NotifySyncComplete,
    /// Open the token for reads on this node
    ActivateToken,
    NotifyPeerAbort,
    /// Tear down the migration's hold on the token
    ReleaseToken,
}

/// Next state and the effects to carry out
pub fn transition(
    state: &ReceiverState,
    event: ReceiverEvent,
) -> Result<(ReceiverState, Vec<ReceiverEffect>)> {
    use ReceiverEffect as E;
    use ReceiverEvent as Ev;
    use ReceiverState as S;

    let next = match (*state, event) {
        (S::Complete | S::Aborted, Ev::Abort { .. }) => (*state, Vec::new()),
        (_, Ev::Abort { notify_peer }) => {
            let mut effects = Vec::with_capacity(2);
            if notify_peer {
                effects.push(E::NotifyPeerAbort);
            }
            effects.push(E::ReleaseToken);
            (S::Aborted, effects)
        }
        (S::Init, Ev::Start) => (S::SyncRequested, vec![E::SendSyncStart]),
        (S::SyncRequested | S::StaticCopy, Ev::StaticBatch { complete }) => {
            let next = if complete { S::DeltaSync } else { S::StaticCopy };
            (next, Vec::new())
        }
        (S::DeltaSync, Ev::DeltaBatch { complete: false, .. }) => (S::DeltaSync, Vec::new()),
        (S::DeltaSync, Ev::DeltaBatch { complete: true, missing: 0 }) => {
            (S::Complete, vec![E::NotifySyncComplete, E::ActivateToken])
        }
        (S::DeltaSync, Ev::DeltaBatch { complete: true, missing }) => (
            S::PullPhase {
                outstanding: missing,
            },
            vec![E::SendPullRequests],
        ),
        (S::PullPhase { outstanding }, Ev::ObjectsPushed { count }) => {
            let outstanding = outstanding.saturating_sub(count);
            if outstanding == 0 {
                (
                    S::Complete,
                    vec![E::NotifyPullComplete, E::NotifySyncComplete, E::ActivateToken],
                )
            } else {
                (S::PullPhase { outstanding }, Vec::new())
            }
        }
        (state, event) => {
            return Err(Error::InvalidTransition(format!(
                "token receiver cannot take {event:?} in {state}"
            )));
        }
    };
    Ok(next)
}
