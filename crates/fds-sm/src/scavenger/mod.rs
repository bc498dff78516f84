//! Background reclaim of space held by unreferenced objects
//!
//! Each run walks every disk of every tier, picks the tokens whose files
//! are mostly reclaimable and queues a `CompactToken` request for each on
//! the token's QoS queue.

mod compactor;
mod disk;

pub use compactor::{CompactStats, TokenCompactor};
pub use disk::DiskScavenger;

use crate::request::{SmIoReq, SmRequestHandler};
use fds_common::config::ScavengerConfig;
use fds_common::{Lifecycle, PeriodicTask, Result, Tier};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

struct ScavInner {
    handler: Arc<SmRequestHandler>,
    config: ScavengerConfig,
    enabled: AtomicBool,
    bytes_reclaimed: Arc<AtomicU64>,
}

impl ScavInner {
    fn run_once(&self) -> Result<usize> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let data = self.handler.store().data_io();
        let grace = Duration::from_secs(self.config.expunge_grace_secs);
        let mut queued = 0;
        for tier in Tier::ALL {
            for disk in data.olt().disks(tier) {
                let scav = DiskScavenger::new(tier, disk);
                for token in scav.tokens_to_compact(data, self.config.reclaim_threshold_percent)? {
                    let reclaimed = Arc::clone(&self.bytes_reclaimed);
                    self.handler.submit(SmIoReq::CompactToken {
                        tier,
                        token,
                        grace,
                        cb: Box::new(move |res| match res {
                            Ok(stats) => {
                                reclaimed.fetch_add(stats.bytes_reclaimed, Ordering::Relaxed);
                            }
                            Err(e) => {
                                error!("Compaction of token {} on {} failed: {}", token, tier, e);
                            }
                        }),
                    })?;
                    queued += 1;
                }
            }
        }
        if queued > 0 {
            info!("Scavenger queued {} token compactions", queued);
        }
        Ok(queued)
    }
}

/// Scavenger controller
pub struct ScavControl {
    inner: Arc<ScavInner>,
    task: PeriodicTask,
}

impl ScavControl {
    pub fn new(handler: Arc<SmRequestHandler>, config: ScavengerConfig) -> Self {
        let enabled = AtomicBool::new(config.enabled);
        Self {
            inner: Arc::new(ScavInner {
                handler,
                config,
                enabled,
                bytes_reclaimed: Arc::new(AtomicU64::new(0)),
            }),
            task: PeriodicTask::new("sm-scavenger"),
        }
    }

    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
        info!("Scavenger enabled");
    }

    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        info!("Scavenger disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Queue compaction for every token over the threshold; returns how many
    pub fn run_once(&self) -> Result<usize> {
        self.inner.run_once()
    }

    /// Bytes reclaimed by completed compactions
    pub fn bytes_reclaimed(&self) -> u64 {
        self.inner.bytes_reclaimed.load(Ordering::Relaxed)
    }
}

impl Lifecycle for ScavControl {
    fn name(&self) -> &str {
        "sm-scavenger"
    }

    fn start(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.task.start(
            Duration::from_secs(self.inner.config.interval_secs.max(1)),
            move || {
                if let Err(e) = inner.run_once() {
                    warn!("Scavenger run failed: {}", e);
                }
            },
        )
    }

    fn stop(&self) {
        self.task.stop();
    }
}
