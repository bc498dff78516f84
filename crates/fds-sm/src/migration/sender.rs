//! Token sender state machine
//!
//! The old owner of a token answers a receiver's sync start with the static
//! snapshot, then the delta, then serves pull requests until the receiver
//! reports completion.

use fds_common::{Error, Result};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    StaticCopy,
    DeltaSync,
    AwaitPull,
    Complete,
    Aborted,
}

impl SenderState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "IDLE",
            Self::StaticCopy => "STATIC_COPY",
            Self::DeltaSync => "DELTA_SYNC",
            Self::AwaitPull => "AWAIT_PULL",
            Self::Complete => "COMPLETE",
            Self::Aborted => "ABORTED",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderEvent {
    SyncStart,
    StaticSent,
    DeltaSent,
    PullRequest,
    PullComplete,
    SyncComplete,
    Abort { notify_peer: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderEffect {
    SendStaticBatches,
    SendDeltaBatches,
    ServePull,
    NotifyPeerAbort,
    /// Drop the sender's bookkeeping for the token
    Finish,
}

pub fn transition(
    state: &SenderState,
    event: SenderEvent,
) -> Result<(SenderState, Vec<SenderEffect>)> {
    use SenderEffect as E;
    use SenderEvent as Ev;
    use SenderState as S;

    let next = match (*state, event) {
        (S::Complete | S::Aborted, Ev::Abort { .. }) => (*state, Vec::new()),
        (_, Ev::Abort { notify_peer }) => {
            let mut effects = Vec::with_capacity(2);
            if notify_peer {
                effects.push(E::NotifyPeerAbort);
            }
            effects.push(E::Finish);
            (S::Aborted, effects)
        }
        (S::Idle, Ev::SyncStart) => (S::StaticCopy, vec![E::SendStaticBatches]),
        (S::StaticCopy, Ev::StaticSent) => (S::DeltaSync, vec![E::SendDeltaBatches]),
        (S::DeltaSync, Ev::DeltaSent) => (S::AwaitPull, Vec::new()),
        (S::AwaitPull, Ev::PullRequest) => (S::AwaitPull, vec![E::ServePull]),
        (S::AwaitPull, Ev::PullComplete) => (S::AwaitPull, Vec::new()),
        (S::AwaitPull, Ev::SyncComplete) => (S::Complete, vec![E::Finish]),
        (state, event) => {
            return Err(Error::InvalidTransition(format!(
                "token sender cannot take {event:?} in {state}"
            )));
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_sequence() {
        let mut state = SenderState::Idle;
        let mut effects = Vec::new();
        for event in [
            SenderEvent::SyncStart,
            SenderEvent::StaticSent,
            SenderEvent::DeltaSent,
            SenderEvent::PullRequest,
            SenderEvent::PullRequest,
            SenderEvent::PullComplete,
            SenderEvent::SyncComplete,
        ] {
            let (next, e) = transition(&state, event).unwrap();
            state = next;
            effects.extend(e);
        }
        assert_eq!(state, SenderState::Complete);
        assert_eq!(
            effects,
            vec![
                SenderEffect::SendStaticBatches,
                SenderEffect::SendDeltaBatches,
                SenderEffect::ServePull,
                SenderEffect::ServePull,
                SenderEffect::Finish,
            ]
        );
    }

    #[test]
    fn test_abort_is_idempotent() {
        let (s, e) = transition(
            &SenderState::DeltaSync,
            SenderEvent::Abort { notify_peer: false },
        )
        .unwrap();
        assert_eq!(s, SenderState::Aborted);
        assert_eq!(e, vec![SenderEffect::Finish]);
        let (s, e) = transition(&s, SenderEvent::Abort { notify_peer: true }).unwrap();
        assert_eq!(s, SenderState::Aborted);
        assert!(e.is_empty());
    }

    #[test]
    fn test_pull_before_delta_rejected() {
        assert!(transition(&SenderState::StaticCopy, SenderEvent::PullRequest).is_err());
        assert!(transition(&SenderState::Idle, SenderEvent::SyncComplete).is_err());
    }
}
