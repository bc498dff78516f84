//! QoS request dispatcher
//!
//! Every SM / DM request runs on a bounded worker pool after being queued
//! on its ordering queue: one FIFO per volume, one per SM token (background
//! work such as scavenging and tier moves) and one for system work.
//!
//! # Scheduling
//!
//! - At most one request of a queue is in flight, so requests of the same
//!   queue execute in submission order
//! - Queues with pending work are served round-robin; a queue may run
//!   `Priority::weight()` requests back to back before yielding its turn
//! - A queue may carry a `TokenBucket`; a throttled queue is skipped until
//!   its bucket refills
//!
//! Completion is delivered by the submitted closure itself; callers that
//! want the result synchronously wait on a channel the closure feeds.

use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::types::{SmTokenId, VolumeId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Scheduling priority of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// Requests a queue may run consecutively before yielding
    #[must_use]
    pub const fn weight(self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 4,
            Self::Critical => 8,
        }
    }
}

/// Ordering boundary for dispatched requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// Client I/O for a volume
    Volume(VolumeId),
    /// Background work scoped to an SM token
    Token(SmTokenId),
    /// Node-wide control work
    System,
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Volume(v) => write!(f, "{v}"),
            Self::Token(t) => write!(f, "token:{t}"),
            Self::System => f.write_str("system"),
        }
    }
}

/// Token bucket rate limiter
///
/// Tokens refill at `rate` per second up to `burst`; each request
/// consumes one.
#[derive(Debug)]
pub struct TokenBucket {
    /// Current token count (scaled by 1000 for sub-token precision)
    tokens: AtomicU64,
    max_tokens: u64,
    refill_rate: u64,
    last_refill: Mutex<Instant>,
    scale: u64,
}

impl TokenBucket {
    #[must_use]
    pub fn new(rate: u64, burst: u64) -> Self {
        let scale = 1000;
        Self {
            tokens: AtomicU64::new(burst * scale),
            max_tokens: burst * scale,
            refill_rate: rate * scale,
            last_refill: Mutex::new(Instant::now()),
            scale,
        }
    }

    /// Try to take `count` tokens without blocking
    pub fn try_acquire(&self, count: u64) -> bool {
        self.refill();

        let needed = count * self.scale;
        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            if current < needed {
                return false;
            }
            if self
                .tokens
                .compare_exchange_weak(
                    current,
                    current - needed,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Whole tokens currently available
    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens.load(Ordering::Relaxed) / self.scale
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let now = Instant::now();
        let elapsed_us = u64::try_from(now.duration_since(*last).as_micros()).unwrap_or(u64::MAX);
        let new_tokens = elapsed_us.saturating_mul(self.refill_rate) / 1_000_000;

        if new_tokens > 0 {
            let current = self.tokens.load(Ordering::Relaxed);
            let new_value = current.saturating_add(new_tokens).min(self.max_tokens);
            self.tokens.store(new_value, Ordering::Relaxed);
            *last = now;
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    fifo: VecDeque<Job>,
    priority: Priority,
    bucket: Option<TokenBucket>,
    busy: bool,
    /// Consecutive turns left before the queue yields
    credits: u32,
}

impl Queue {
    fn new(priority: Priority, iops_limit: u64) -> Self {
        Self {
            fifo: VecDeque::new(),
            priority,
            bucket: (iops_limit > 0).then(|| TokenBucket::new(iops_limit, iops_limit)),
            busy: false,
            credits: priority.weight(),
        }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<QueueId, Queue>,
    /// Queues that are idle and have pending work, in service order
    ready: VecDeque<QueueId>,
    outstanding: usize,
    running: bool,
    shutdown: bool,
}

impl State {
    /// Pick the next runnable job; the flag reports whether a queue was
    /// skipped for rate limiting
    fn next_job(&mut self) -> (Option<(QueueId, Job)>, bool) {
        let mut throttled = false;
        for _ in 0..self.ready.len() {
            let Some(qid) = self.ready.pop_front() else {
                break;
            };
            let Some(queue) = self.queues.get_mut(&qid) else {
                continue;
            };
            if let Some(bucket) = &queue.bucket
                && !bucket.try_acquire(1)
            {
                throttled = true;
                self.ready.push_back(qid);
                continue;
            }
            if let Some(job) = queue.fifo.pop_front() {
                queue.busy = true;
                return (Some((qid, job)), throttled);
            }
        }
        (None, throttled)
    }

    fn complete(&mut self, qid: QueueId) {
        self.outstanding -= 1;
        let Some(queue) = self.queues.get_mut(&qid) else {
            return;
        };
        queue.busy = false;
        if queue.fifo.is_empty() {
            queue.credits = queue.priority.weight();
            return;
        }
        queue.credits = queue.credits.saturating_sub(1);
        if queue.credits > 0 {
            self.ready.push_front(qid);
        } else {
            queue.credits = queue.priority.weight();
            self.ready.push_back(qid);
        }
    }
}

struct Shared {
    state: Mutex<State>,
    work: Condvar,
    idle: Condvar,
}

/// Bounded worker pool with per-queue FIFO ordering
pub struct QosDispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_threads: usize,
    default_iops_limit: u64,
}

impl QosDispatcher {
    /// Create a stopped dispatcher
    #[must_use]
    pub fn new(max_threads: usize, default_iops_limit: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                work: Condvar::new(),
                idle: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
            max_threads: max_threads.max(1),
            default_iops_limit,
        }
    }

    /// Create and start a dispatcher
    pub fn started(max_threads: usize, default_iops_limit: u64) -> Result<Arc<Self>> {
        let dispatcher = Arc::new(Self::new(max_threads, default_iops_limit));
        dispatcher.start()?;
        Ok(dispatcher)
    }

    /// Register or reconfigure a queue
    pub fn register_queue(&self, qid: QueueId, priority: Priority, iops_limit: u64) {
        let mut state = self.shared.state.lock();
        if let Some(queue) = state.queues.get_mut(&qid) {
            queue.priority = priority;
            queue.credits = priority.weight();
            queue.bucket = (iops_limit > 0).then(|| TokenBucket::new(iops_limit, iops_limit));
        } else {
            state.queues.insert(qid, Queue::new(priority, iops_limit));
        }
        debug!("Registered queue {} priority {:?} iops {}", qid, priority, iops_limit);
    }

    /// Remove a queue once it has drained
    pub fn deregister_queue(&self, qid: QueueId) -> Result<()> {
        let mut state = self.shared.state.lock();
        match state.queues.get(&qid) {
            Some(queue) if queue.busy || !queue.fifo.is_empty() => Err(Error::invalid_argument(
                format!("queue {qid} still has outstanding requests"),
            )),
            Some(_) => {
                state.queues.remove(&qid);
                Ok(())
            }
            None => Err(Error::not_found(format!("queue {qid}"))),
        }
    }

    /// Enqueue a request; unknown queues are created with default settings
    pub fn submit<F>(&self, qid: QueueId, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown || !state.running {
            return Err(Error::internal("QoS dispatcher is not running"));
        }
        let default_iops = self.default_iops_limit;
        let queue = state
            .queues
            .entry(qid)
            .or_insert_with(|| Queue::new(Priority::Normal, default_iops));
        let was_idle = !queue.busy && queue.fifo.is_empty();
        queue.fifo.push_back(Box::new(f));
        state.outstanding += 1;
        if was_idle {
            state.ready.push_back(qid);
            self.shared.work.notify_one();
        }
        Ok(())
    }

    /// Requests queued or running
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().outstanding
    }

    /// Block until no request is queued or running
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.outstanding > 0 {
            self.shared.idle.wait(&mut state);
        }
    }

    fn worker_loop(shared: &Shared) {
        loop {
            let (qid, job) = {
                let mut state = shared.state.lock();
                loop {
                    let (next, throttled) = state.next_job();
                    if let Some(next) = next {
                        break next;
                    }
                    if state.shutdown {
                        return;
                    }
                    if throttled {
                        shared.work.wait_for(&mut state, Duration::from_millis(1));
                    } else {
                        shared.work.wait(&mut state);
                    }
                }
            };

            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                error!("Request on {} panicked", qid);
            }

            let mut state = shared.state.lock();
            state.complete(qid);
            if !state.ready.is_empty() {
                shared.work.notify_one();
            }
            if state.outstanding == 0 {
                shared.idle.notify_all();
            }
        }
    }
}

impl Lifecycle for QosDispatcher {
    fn name(&self) -> &str {
        "qos-dispatcher"
    }

    fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.shutdown = false;
        }

        let mut workers = self.workers.lock();
        for i in 0..self.max_threads {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("qos-{i}"))
                .spawn(move || Self::worker_loop(&shared))?;
            workers.push(handle);
        }
        info!("QoS dispatcher started with {} threads", self.max_threads);
        Ok(())
    }

    /// Drain queued requests, then join the workers
    fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.shutdown = true;
            self.shared.work.notify_all();
        }
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        self.shared.state.lock().running = false;
        info!("QoS dispatcher stopped");
    }
}

impl Drop for QosDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
