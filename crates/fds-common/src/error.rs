//! Error types for FDS
//!
//! One taxonomy shared by the SM and DM layers: not-found, consistency,
//! disk I/O, migration and internal failures.

use crate::types::{BlobTxId, ObjectId, VolumeId};
use thiserror::Error;

/// Common result type for FDS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for FDS
#[derive(Debug, Error)]
pub enum Error {
    // Not-found class
    #[error("not found: {0}")]
    NotFound(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(VolumeId),

    #[error("this DM is not primary for {0}")]
    DmNotPrimary(VolumeId),

    // Duplicate / consistency class
    #[error("duplicate uuid: {0}")]
    DuplicateUuid(String),

    #[error("transaction already exists: {0}")]
    TxAlreadyExists(String),

    #[error("transaction {0} is not open")]
    TxNotOpen(BlobTxId),

    // Disk I/O class
    #[error("disk read failed: {0}")]
    DiskReadFailed(String),

    #[error("disk write failed: {0}")]
    DiskWriteFailed(String),

    #[error("disk is full")]
    DiskFull,

    #[error("checksum mismatch reading {0}")]
    ChecksumMismatch(String),

    #[error("content of {0} does not match its id")]
    HashMismatch(ObjectId),

    // Migration class
    #[error("DM catalog sync failed: {0}")]
    DmRsyncFailed(String),

    #[error("sync in progress: {0}")]
    SyncInProgress(String),

    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    #[error("migration aborted: {0}")]
    MigrationAborted(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("transport error: {0}")]
    Transport(String),

    // General
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::VolumeNotFound(_) | Self::DmNotPrimary(_)
        )
    }

    /// Check if this is a disk I/O error
    #[must_use]
    pub const fn is_disk_io(&self) -> bool {
        matches!(
            self,
            Self::DiskReadFailed(_)
                | Self::DiskWriteFailed(_)
                | Self::DiskFull
                | Self::ChecksumMismatch(_)
                | Self::Io(_)
        )
    }

    /// Check if this error terminates a migration
    #[must_use]
    pub const fn is_migration(&self) -> bool {
        matches!(
            self,
            Self::DmRsyncFailed(_)
                | Self::SyncInProgress(_)
                | Self::VersionMismatch { .. }
                | Self::MigrationAborted(_)
                | Self::InvalidTransition(_)
                | Self::Transport(_)
        )
    }

    /// Check if a local retry may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DiskReadFailed(_) | Self::Io(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

macro_rules! catalog_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Self::Catalog(e.to_string())
                }
            }
        )*
    };
}

catalog_error_from!(
    redb::Error,
    redb::DatabaseError,
    redb::StorageError,
    redb::TableError,
    redb::TransactionError,
    redb::CommitError,
);
