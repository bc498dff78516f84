//! Core type definitions for FDS
//!
//! Identifiers, storage tiers and volume media policies shared by the
//! Storage Manager and Data Manager.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Length of an object digest in bytes
pub const OBJECT_ID_LEN: usize = 20;

/// Content digest identifying an object
///
/// The id is the SHA-1 of the object's bytes. Two objects with the same id
/// are assumed to carry the same content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Compute the id of the given content
    #[must_use]
    pub fn from_data(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; OBJECT_ID_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Create from raw digest bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice; `None` if the length is wrong
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; OBJECT_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    /// High 64 bits of the digest, big-endian
    #[must_use]
    pub fn high64(&self) -> u64 {
        let mut hi = [0u8; 8];
        hi.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(hi)
    }

    /// SM token this object hashes to, given the DLT token width
    #[must_use]
    pub fn token(&self, bits_per_token: u32) -> SmTokenId {
        if bits_per_token == 0 {
            return 0;
        }
        let bits = bits_per_token.min(32);
        (self.high64() >> (64 - bits)) as SmTokenId
    }

    /// Smallest object id hashing to `token`
    #[must_use]
    pub fn token_lower_bound(token: SmTokenId, bits_per_token: u32) -> Self {
        let mut bytes = [0u8; OBJECT_ID_LEN];
        if bits_per_token > 0 {
            let bits = bits_per_token.min(32);
            let hi = u64::from(token) << (64 - bits);
            bytes[..8].copy_from_slice(&hi.to_be_bytes());
        }
        Self(bytes)
    }

    /// Largest object id hashing to `token`
    #[must_use]
    pub fn token_upper_bound(token: SmTokenId, bits_per_token: u32) -> Self {
        let mut bytes = [0xffu8; OBJECT_ID_LEN];
        if bits_per_token > 0 {
            let bits = bits_per_token.min(32);
            let shift = 64 - bits;
            let hi = (u64::from(token) << shift) | ((1u64 << shift) - 1);
            bytes[..8].copy_from_slice(&hi.to_be_bytes());
        }
        Self(bytes)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Shard of the object-id space owned by SM nodes
pub type SmTokenId = u32;

/// Volume identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[derive(Serialize, Deserialize, Display, From, Into)]
#[display("vol:{_0}")]
pub struct VolumeId(u64);

impl VolumeId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Service node identifier as published in the DLT / DMT
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[derive(Serialize, Deserialize, Display, From, Into)]
#[display("node:{_0:x}")]
pub struct NodeUuid(u64);

impl NodeUuid {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Local disk identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[derive(Serialize, Deserialize, Display, From, Into)]
#[display("disk:{_0}")]
pub struct DiskId(u16);

impl DiskId {
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

/// Storage medium class an object's bytes reside on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tier {
    /// Flash tier
    Ssd = 0,
    /// Spinning disk tier
    Hdd = 1,
}

impl Tier {
    pub const ALL: [Self; 2] = [Self::Ssd, Self::Hdd];

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ssd),
            1 => Some(Self::Hdd),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ssd => "ssd",
            Self::Hdd => "hdd",
        }
    }

    /// The other tier
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Ssd => Self::Hdd,
            Self::Hdd => Self::Ssd,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-volume media placement policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MediaPolicy {
    /// Flash only
    AllSsd,
    /// Disk only
    AllHdd,
    /// Flash for hot objects, disk otherwise
    #[default]
    Hybrid,
    /// Hybrid volume that prefers capacity: writes land on disk
    HybridPrefcap,
}

/// Blob version number; `0` means the blob does not exist
pub type BlobVersion = u64;

/// Version of a blob that has been deleted
pub const BLOB_VERSION_DELETED: BlobVersion = 0;

/// First version assigned to a blob
pub const BLOB_VERSION_INITIAL: BlobVersion = 1;

/// Transaction identifier for blob mutations
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[derive(Serialize, Deserialize, Display, From, Into)]
#[display("tx:{_0}")]
pub struct BlobTxId(u64);

impl BlobTxId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Milliseconds since the unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
