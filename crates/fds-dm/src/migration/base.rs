//! Outstanding-message bookkeeping shared by both sides of a DM migration
//!
//! Each message sent with a `msg_id` is issued here and later passed or
//! failed when the peer's `Ack` arrives. A phase may only end once nothing
//! is outstanding, and a single failed message fails the migration.

use fds_common::{Error, Result, VolumeId};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct AsyncState {
    next_id: u64,
    outstanding: BTreeMap<u64, Instant>,
    issued: u64,
    passed: u64,
    failed: Option<String>,
}

#[derive(Debug)]
pub struct DmMigrationBase {
    vol: VolumeId,
    state: Mutex<AsyncState>,
    settled: Condvar,
}

impl DmMigrationBase {
    pub fn new(vol: VolumeId) -> Self {
        Self {
            vol,
            state: Mutex::new(AsyncState::default()),
            settled: Condvar::new(),
        }
    }

    pub const fn vol(&self) -> VolumeId {
        self.vol
    }

    /// Register a message about to be sent and return its id
    pub fn async_msg_issued(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.issued += 1;
        state.outstanding.insert(id, Instant::now());
        id
    }

    /// Whether `msg_id` was issued here and is still unanswered
    pub fn is_outstanding(&self, msg_id: u64) -> bool {
        self.state.lock().outstanding.contains_key(&msg_id)
    }

    pub fn async_msg_passed(&self, msg_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.outstanding.remove(&msg_id).is_none() {
            return Err(Error::invalid_argument(format!(
                "{} has no outstanding message {msg_id}",
                self.vol
            )));
        }
        state.passed += 1;
        if state.outstanding.is_empty() {
            self.settled.notify_all();
        }
        Ok(())
    }

    pub fn async_msg_failed(&self, msg_id: u64, reason: &str) {
        let mut state = self.state.lock();
        state.outstanding.remove(&msg_id);
        state
            .failed
            .get_or_insert_with(|| format!("message {msg_id} failed: {reason}"));
        self.settled.notify_all();
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Every issued message has been answered successfully
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.outstanding.is_empty() && state.failed.is_none()
    }

    pub fn failure(&self) -> Option<String> {
        self.state.lock().failed.clone()
    }

    /// (issued, passed) counters
    pub fn counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.issued, state.passed)
    }

    /// Ids unanswered for longer than `timeout`
    pub fn expired(&self, timeout: Duration) -> Vec<u64> {
        self.state
            .lock()
            .outstanding
            .iter()
            .filter(|(_, sent)| sent.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Wait until nothing is outstanding; fails if any message failed or
    /// the wait outlasts `timeout`
    pub fn wait_for_async_msgs(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.outstanding.is_empty() && state.failed.is_none() {
            if self.settled.wait_until(&mut state, deadline).timed_out() {
                return Err(Error::MigrationAborted(format!(
                    "{}: {} messages still unanswered",
                    self.vol,
                    state.outstanding.len()
                )));
            }
        }
        match &state.failed {
            Some(reason) => Err(Error::DmRsyncFailed(format!("{}: {reason}", self.vol))),
            None => Ok(()),
        }
    }
}
