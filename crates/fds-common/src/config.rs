//! Configuration types for FDS
//!
//! The whole tree deserializes from TOML; every section falls back to its
//! defaults when absent.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity
    pub node: NodeConfig,
    /// Storage Manager
    pub sm: SmConfig,
    /// Tier placement and background tiering
    pub tiering: TieringConfig,
    /// Garbage collection
    pub scavenger: ScavengerConfig,
    /// Data Manager
    pub dm: DmConfig,
    /// SM / DM migration
    pub migration: MigrationConfig,
    /// Request dispatch
    pub qos: QosConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.sm.token_bits == 0 || self.sm.token_bits > 16 {
            return Err(Error::Configuration(format!(
                "sm.token_bits must be in 1..=16, got {}",
                self.sm.token_bits
            )));
        }
        if self.sm.hdd_disks.is_empty() {
            return Err(Error::Configuration("sm.hdd_disks must not be empty".into()));
        }
        if self.sm.lock_buckets == 0 {
            return Err(Error::Configuration("sm.lock_buckets must be positive".into()));
        }
        if self.qos.max_threads == 0 {
            return Err(Error::Configuration("qos.max_threads must be positive".into()));
        }
        if self.migration.max_delta_blobs == 0 || self.migration.max_delta_blob_desc == 0 {
            return Err(Error::Configuration(
                "migration batch sizes must be positive".into(),
            ));
        }
        if self.tiering.random_ssd_percent > 100 {
            return Err(Error::Configuration(
                "tiering.random_ssd_percent must be at most 100".into(),
            ));
        }
        Ok(())
    }

    /// Root of SM object data files
    #[must_use]
    pub fn sm_data_dir(&self) -> PathBuf {
        self.node.data_dir.join("sm")
    }

    /// Root of DM catalogs and journals
    #[must_use]
    pub fn dm_data_dir(&self) -> PathBuf {
        self.node.data_dir.join("dm")
    }
}

/// Node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node uuid as published in the DLT / DMT
    pub uuid: u64,
    /// Root data directory
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            uuid: 1,
            data_dir: PathBuf::from("/var/lib/fds"),
        }
    }
}

/// Storage Manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SmConfig {
    /// Width of an SM token in bits (2^bits tokens)
    pub token_bits: u32,
    /// Disks forming the HDD tier
    pub hdd_disks: Vec<u16>,
    /// Disks forming the SSD tier
    pub ssd_disks: Vec<u16>,
    /// Object metadata cache entries
    pub meta_cache_entries: usize,
    /// Object data cache entries
    pub data_cache_entries: usize,
    /// Buckets in the per-object lock table
    pub lock_buckets: usize,
    /// Recompute the digest of deduplicated writes
    pub verify_dedup_content: bool,
    /// Attempts per disk read before failing
    pub disk_read_retries: u32,
    /// Size at which a token file stops accepting appends
    pub max_token_file_size: u64,
    /// Sync data files after every append
    pub sync_writes: bool,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            token_bits: 8,
            hdd_disks: vec![0],
            ssd_disks: Vec::new(),
            meta_cache_entries: 10_000,
            data_cache_entries: 1_024,
            lock_buckets: 1_024,
            verify_dedup_content: false,
            disk_read_retries: 3,
            max_token_file_size: 1024 * 1024 * 1024, // 1 GB
            sync_writes: false,
        }
    }
}

/// Tier placement algorithm
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TierAlgorithm {
    /// Rank-table driven placement
    #[default]
    Rank,
    /// Random placement, test only
    RandomTest,
}

/// Tiering configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    /// Run the hybrid tier controller
    pub enabled: bool,
    /// Seconds between controller runs
    pub interval_secs: u64,
    /// Objects moved per run
    pub batch_size: usize,
    /// Objects tracked in the SSD rank table
    pub ssd_rank_table_size: usize,
    /// Put-path algorithm
    pub algorithm: TierAlgorithm,
    /// SSD share for the random test algorithm
    pub random_ssd_percent: u8,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            batch_size: 1_024,
            ssd_rank_table_size: 100_000,
            algorithm: TierAlgorithm::Rank,
            random_ssd_percent: 50,
        }
    }
}

/// Scavenger configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScavengerConfig {
    /// Run the scavenger in the background
    pub enabled: bool,
    /// Seconds between scavenger runs
    pub interval_secs: u64,
    /// Reclaimable share of a token file that triggers compaction
    pub reclaim_threshold_percent: u8,
    /// Minimum age of a zero-ref object before it is expunged
    pub expunge_grace_secs: u64,
}

impl Default for ScavengerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
            reclaim_threshold_percent: 50,
            expunge_grace_secs: 0,
        }
    }
}

/// Data Manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DmConfig {
    /// Size at which the operation journal rotates
    pub journal_file_size: u64,
    /// Maximum object size; blob offsets map to object indexes by it
    pub max_object_size: u64,
    /// Open transactions older than this are purged
    pub tx_timeout_secs: u64,
}

impl Default for DmConfig {
    fn default() -> Self {
        Self {
            journal_file_size: 16 * 1024 * 1024, // 16 MB
            max_object_size: 2 * 1024 * 1024,    // 2 MB
            tx_timeout_secs: 300,
        }
    }
}

/// Migration configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Metadata entries per SM static-copy message
    pub sm_batch_entries: usize,
    /// Payload bytes per SM push message
    pub sm_push_batch_bytes: usize,
    /// Object ids per SM pull request
    pub sm_pull_batch_objects: usize,
    /// Blobs per DM delta-blobs message
    pub max_delta_blobs: usize,
    /// Blob descriptors per DM delta-desc message
    pub max_delta_blob_desc: usize,
    /// DM volume migrations running at once
    pub max_concurrent_dm_migrations: usize,
    /// Seconds to wait for outstanding migration messages
    pub async_msg_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            sm_batch_entries: 512,
            sm_push_batch_bytes: 8 * 1024 * 1024, // 8 MB
            sm_pull_batch_objects: 256,
            max_delta_blobs: 64,
            max_delta_blob_desc: 128,
            max_concurrent_dm_migrations: 4,
            async_msg_timeout_secs: 120,
        }
    }
}

/// Request dispatch configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Dispatcher worker threads
    pub max_threads: usize,
    /// Default per-queue IOPS limit (0 = unlimited)
    pub default_iops_limit: u64,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            max_threads: 8,
            default_iops_limit: 0,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive
    pub level: String,
    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
