//! Catalog key scheme
//!
//! ```text
//! +------+----------+------------------------------------------+
//! | Type | Reserved | Body                                     |
//! | 1B   | 4B       | var                                      |
//! +------+----------+------------------------------------------+
//! BlobMetadata:   name
//! BlobObjects:    name | 0x00 | extent index (u64 BE)
//! ObjectExpunge:  volume id (u64 BE) | object id (20B)
//! VolumeMetadata: (empty)
//! ```
//! Keys of one type sort together and, within a blob, extents sort by
//! index because the index is fixed-width big-endian.

use fds_common::{Error, OBJECT_ID_LEN, ObjectId, Result, VolumeId};

const RESERVED_LEN: usize = 4;
const HEADER_LEN: usize = 1 + RESERVED_LEN;
const NAME_TERMINATOR: u8 = 0x00;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CatalogKeyType {
    BlobMetadata = 1,
    BlobObjects = 2,
    ObjectExpunge = 3,
    VolumeMetadata = 4,
}

impl CatalogKeyType {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::BlobMetadata),
            2 => Some(Self::BlobObjects),
            3 => Some(Self::ObjectExpunge),
            4 => Some(Self::VolumeMetadata),
            _ => None,
        }
    }
}

/// Common prefix of every key of `kind`
pub fn type_prefix(kind: CatalogKeyType) -> Vec<u8> {
    let mut key = Vec::with_capacity(HEADER_LEN);
    key.push(kind as u8);
    key.extend_from_slice(&[0u8; RESERVED_LEN]);
    key
}

/// Blob names end at the terminator byte, so it may not appear in one
pub fn validate_blob_name(name: &str) -> Result<()> {
    if name.is_empty() || name.as_bytes().contains(&NAME_TERMINATOR) {
        return Err(Error::invalid_argument(format!("invalid blob name {name:?}")));
    }
    Ok(())
}

pub fn blob_metadata_key(name: &str) -> Vec<u8> {
    let mut key = type_prefix(CatalogKeyType::BlobMetadata);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Prefix shared by every extent of a blob
pub fn blob_objects_prefix(name: &str) -> Vec<u8> {
    let mut key = type_prefix(CatalogKeyType::BlobObjects);
    key.extend_from_slice(name.as_bytes());
    key.push(NAME_TERMINATOR);
    key
}

pub fn blob_objects_key(name: &str, extent: u64) -> Vec<u8> {
    let mut key = blob_objects_prefix(name);
    key.extend_from_slice(&extent.to_be_bytes());
    key
}

pub fn object_expunge_key(vol: VolumeId, oid: &ObjectId) -> Vec<u8> {
    let mut key = type_prefix(CatalogKeyType::ObjectExpunge);
    key.extend_from_slice(&vol.get().to_be_bytes());
    key.extend_from_slice(oid.as_bytes());
    key
}

pub fn volume_metadata_key() -> Vec<u8> {
    type_prefix(CatalogKeyType::VolumeMetadata)
}

pub fn key_type(key: &[u8]) -> Option<CatalogKeyType> {
    CatalogKeyType::from_u8(*key.first()?)
}

/// Blob name of a `BlobMetadata` key
pub fn parse_blob_metadata_key(key: &[u8]) -> Option<&str> {
    if key_type(key)? != CatalogKeyType::BlobMetadata {
        return None;
    }
    std::str::from_utf8(key.get(HEADER_LEN..)?).ok()
}

/// Blob name and extent index of a `BlobObjects` key
pub fn parse_blob_objects_key(key: &[u8]) -> Option<(&str, u64)> {
    if key_type(key)? != CatalogKeyType::BlobObjects || key.len() < HEADER_LEN + 1 + 8 {
        return None;
    }
    let (name, rest) = key[HEADER_LEN..].split_at(key.len() - HEADER_LEN - 9);
    if rest[0] != NAME_TERMINATOR {
        return None;
    }
    let extent = u64::from_be_bytes(rest[1..].try_into().ok()?);
    Some((std::str::from_utf8(name).ok()?, extent))
}

pub fn parse_object_expunge_key(key: &[u8]) -> Option<(VolumeId, ObjectId)> {
    if key_type(key)? != CatalogKeyType::ObjectExpunge
        || key.len() != HEADER_LEN + 8 + OBJECT_ID_LEN
    {
        return None;
    }
    let vol = u64::from_be_bytes(key[HEADER_LEN..HEADER_LEN + 8].try_into().ok()?);
    let oid = ObjectId::from_slice(&key[HEADER_LEN + 8..])?;
    Some((VolumeId::new(vol), oid))
}
