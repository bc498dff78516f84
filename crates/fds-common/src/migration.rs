//! Migration concurrency primitives
//!
//! - `MigrationSeqNumReceiver` reassembles the sequence numbers of a
//!   batched stream delivered out of order
//! - `MigrationTrackIoReqs` is a counting barrier that quiesces client I/O
//!   around migration phase transitions

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SeqState {
    /// Next sequence number expected to extend the contiguous prefix
    next: u64,
    /// Received numbers beyond the contiguous prefix
    pending: BTreeSet<u64>,
    last: Option<u64>,
    complete: bool,
}

/// Tracks delivery of sequence numbers `0..=last`
///
/// `set_seq_num` returns `true` exactly once: on the call after which every
/// number from 0 up to the announced last one has been seen.
#[derive(Debug, Default)]
pub struct MigrationSeqNumReceiver {
    state: Mutex<SeqState>,
}

impl MigrationSeqNumReceiver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq`; `is_last` marks the final number of the stream
    pub fn set_seq_num(&self, seq: u64, is_last: bool) -> bool {
        let mut state = self.state.lock();
        if state.complete {
            return false;
        }
        if is_last {
            state.last = Some(seq);
        }
        if seq == state.next {
            state.next += 1;
            loop {
                let next = state.next;
                if !state.pending.remove(&next) {
                    break;
                }
                state.next += 1;
            }
        } else if seq > state.next {
            state.pending.insert(seq);
        }

        if let Some(last) = state.last
            && state.next > last
        {
            state.complete = true;
            return true;
        }
        false
    }

    /// Whether the whole stream has been received
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// Length of the contiguous prefix received so far
    #[must_use]
    pub fn contiguous(&self) -> u64 {
        self.state.lock().next
    }

    /// Forget all state for a new stream
    pub fn reset(&self) {
        *self.state.lock() = SeqState::default();
    }
}

#[derive(Debug, Default)]
struct TrackState {
    outstanding: usize,
    blocked: bool,
}

/// Counting barrier over in-flight I/O
#[derive(Debug, Default)]
pub struct MigrationTrackIoReqs {
    state: Mutex<TrackState>,
    changed: Condvar,
}

/// Marks one in-flight request; released on drop
#[must_use = "the request is untracked once the guard is dropped"]
pub struct IoReqGuard<'a> {
    tracker: &'a MigrationTrackIoReqs,
}

impl Drop for IoReqGuard<'_> {
    fn drop(&mut self) {
        self.tracker.exit();
    }
}

/// In-flight request that keeps its tracker alive, so it can travel with
/// a queued request
#[must_use = "the request is untracked once the guard is dropped"]
pub struct OwnedIoReqGuard {
    tracker: Arc<MigrationTrackIoReqs>,
}

impl Drop for OwnedIoReqGuard {
    fn drop(&mut self) {
        self.tracker.exit();
    }
}

impl MigrationTrackIoReqs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request, waiting while new I/O is blocked
    pub fn enter(&self) -> IoReqGuard<'_> {
        self.admit();
        IoReqGuard { tracker: self }
    }

    /// As [`Self::enter`], for a request that outlives the caller
    pub fn enter_owned(self: &Arc<Self>) -> OwnedIoReqGuard {
        self.admit();
        OwnedIoReqGuard {
            tracker: Arc::clone(self),
        }
    }

    fn admit(&self) {
        let mut state = self.state.lock();
        while state.blocked {
            self.changed.wait(&mut state);
        }
        state.outstanding += 1;
    }

    fn exit(&self) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.changed.notify_all();
        }
    }

    /// Start a request unless new I/O is blocked
    pub fn try_enter(&self) -> Option<IoReqGuard<'_>> {
        let mut state = self.state.lock();
        if state.blocked {
            return None;
        }
        state.outstanding += 1;
        Some(IoReqGuard { tracker: self })
    }

    /// Block new requests and wait for outstanding ones to finish
    pub fn block_and_wait(&self) {
        let mut state = self.state.lock();
        state.blocked = true;
        while state.outstanding > 0 {
            self.changed.wait(&mut state);
        }
    }

    /// Like `block_and_wait` with a deadline; on timeout new I/O stays
    /// blocked and `false` is returned
    pub fn block_and_wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.blocked = true;
        while state.outstanding > 0 {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.outstanding == 0;
            }
        }
        true
    }

    /// Let blocked requests proceed
    pub fn unblock(&self) {
        let mut state = self.state.lock();
        state.blocked = false;
        self.changed.notify_all();
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_seq_in_order() {
        let rx = MigrationSeqNumReceiver::new();
        assert!(!rx.set_seq_num(0, false));
        assert!(!rx.set_seq_num(1, false));
        assert!(rx.set_seq_num(2, true));
        assert!(rx.is_complete());
    }

    #[test]
    fn test_seq_gap_closure() {
        let rx = MigrationSeqNumReceiver::new();
        assert!(!rx.set_seq_num(0, false));
        assert!(!rx.set_seq_num(2, false));
        assert!(!rx.set_seq_num(1, false));
        assert!(!rx.set_seq_num(4, true));
        assert!(rx.set_seq_num(3, false));
        assert!(!rx.set_seq_num(3, false));
    }

    #[test]
    fn test_seq_last_arrives_first() {
        let rx = MigrationSeqNumReceiver::new();
        assert!(!rx.set_seq_num(3, true));
        assert!(!rx.set_seq_num(1, false));
        assert!(!rx.set_seq_num(0, false));
        assert_eq!(rx.contiguous(), 2);
        assert!(rx.set_seq_num(2, false));
    }

    #[test]
    fn test_seq_single_message() {
        let rx = MigrationSeqNumReceiver::new();
        assert!(rx.set_seq_num(0, true));
    }

    #[test]
    fn test_seq_random_order_completes_once() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut seqs: Vec<u64> = (0..32).collect();
            seqs.shuffle(&mut rng);
            let rx = MigrationSeqNumReceiver::new();
            let completions = seqs
                .iter()
                .filter(|&&s| rx.set_seq_num(s, s == 31))
                .count();
            assert_eq!(completions, 1);
        }
    }

    #[test]
    fn test_track_io_blocks_new_requests() {
        let tracker = MigrationTrackIoReqs::new();
        let guard = tracker.enter();
        assert_eq!(tracker.outstanding(), 1);
        assert!(!tracker.block_and_wait_for(Duration::from_millis(10)));
        assert!(tracker.try_enter().is_none());
        drop(guard);
        tracker.block_and_wait();
        tracker.unblock();
        assert!(tracker.try_enter().is_some());
    }

    #[test]
    fn test_track_io_waits_for_outstanding() {
        let tracker = Arc::new(MigrationTrackIoReqs::new());
        let finished = Arc::new(AtomicBool::new(false));

        let worker = {
            let tracker = Arc::clone(&tracker);
            let finished = Arc::clone(&finished);
            let (tx, rx) = crossbeam_channel::bounded(1);
            let handle = std::thread::spawn(move || {
                let _guard = tracker.enter();
                tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(20));
                finished.store(true, Ordering::SeqCst);
            });
            rx.recv().unwrap();
            handle
        };

        tracker.block_and_wait();
        assert!(finished.load(Ordering::SeqCst));
        tracker.unblock();
        worker.join().unwrap();
    }

    #[test]
    fn test_owned_guard_counts_until_dropped() {
        let tracker = Arc::new(MigrationTrackIoReqs::new());
        let guard = tracker.enter_owned();
        assert_eq!(tracker.outstanding(), 1);
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(guard);
        });
        assert!(tracker.block_and_wait_for(Duration::from_secs(5)));
        assert_eq!(tracker.outstanding(), 0);
        tracker.unblock();
        worker.join().unwrap();
    }

    #[test]
    fn test_unblock_releases_waiters() {
        let tracker = Arc::new(MigrationTrackIoReqs::new());
        tracker.block_and_wait();

        let waiter = {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                let _guard = tracker.enter();
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        tracker.unblock();
        waiter.join().unwrap();
        assert_eq!(tracker.outstanding(), 0);
    }
}
