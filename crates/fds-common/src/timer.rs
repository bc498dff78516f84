//! Named background thread that runs a closure on a fixed period

use crate::error::{Error, Result};
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

pub struct PeriodicTask {
    name: String,
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stop: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Run `f` every `interval` until `stop`
    pub fn start<F>(&self, interval: Duration, f: F) -> Result<()>
    where
        F: Fn() + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(Error::internal(format!("{} already running", self.name)));
        }
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let name = self.name.clone();
        *handle = Some(thread::Builder::new().name(self.name.clone()).spawn(move || {
            debug!("{} started, period {:?}", name, interval);
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => f(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("{} stopped", name);
        })?);
        *self.stop.lock() = Some(stop_tx);
        Ok(())
    }

    pub fn stop(&self) {
        drop(self.stop.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_runs_until_stopped() {
        let task = PeriodicTask::new("test-timer");
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        task.start(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(task.start(Duration::from_millis(5), || {}).is_err());
        thread::sleep(Duration::from_millis(60));
        task.stop();
        assert!(!task.is_running());
        let after = runs.load(Ordering::SeqCst);
        assert!(after > 0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), after);
    }
}
