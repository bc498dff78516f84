//! Blob catalog records
//!
//! A blob is a descriptor (version, size, metadata pairs) plus an
//! offset -> object map. The map is stored split into extents of
//! `OBJECTS_PER_EXTENT` consecutive object slots.

use fds_common::{BLOB_VERSION_DELETED, BlobVersion, Error, ObjectId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Object slots per stored extent
pub const OBJECTS_PER_EXTENT: u64 = 1024;

/// Extent holding the object at `offset`
pub const fn extent_of(offset: u64, max_object_size: u64) -> u64 {
    offset / max_object_size / OBJECTS_PER_EXTENT
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobObjectInfo {
    pub oid: ObjectId,
    pub size: u64,
}

/// Offset -> object mapping of (part of) a blob
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobObjectList {
    objects: BTreeMap<u64, BlobObjectInfo>,
}

impl BlobObjectList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `offset` to `oid`, returning the object it replaces
    pub fn insert(&mut self, offset: u64, oid: ObjectId, size: u64) -> Option<BlobObjectInfo> {
        self.objects.insert(offset, BlobObjectInfo { oid, size })
    }

    pub fn get(&self, offset: u64) -> Option<&BlobObjectInfo> {
        self.objects.get(&offset)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &BlobObjectInfo)> {
        self.objects.iter().map(|(off, info)| (*off, info))
    }

    /// Overlay `other`; its entries win
    pub fn merge(&mut self, other: &Self) {
        self.objects.extend(other.objects.iter().map(|(k, v)| (*k, *v)));
    }

    /// Byte length of the blob described by this list
    pub fn end_offset(&self) -> u64 {
        self.objects
            .last_key_value()
            .map_or(0, |(off, info)| off + info.size)
    }

    /// Every offset must start an object slot and no object may exceed one
    pub fn validate(&self, max_object_size: u64) -> Result<()> {
        for (off, info) in &self.objects {
            if off % max_object_size != 0 {
                return Err(Error::invalid_argument(format!(
                    "offset {off} is not a multiple of {max_object_size}"
                )));
            }
            if info.size == 0 || info.size > max_object_size {
                return Err(Error::invalid_argument(format!(
                    "object at {off} has size {}",
                    info.size
                )));
            }
        }
        Ok(())
    }

    /// Split into per-extent lists
    pub fn extents(&self, max_object_size: u64) -> BTreeMap<u64, Self> {
        let mut out: BTreeMap<u64, Self> = BTreeMap::new();
        for (off, info) in &self.objects {
            out.entry(extent_of(*off, max_object_size))
                .or_default()
                .objects
                .insert(*off, *info);
        }
        out
    }

    pub fn marshall(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn unmarshall(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

impl FromIterator<(u64, ObjectId, u64)> for BlobObjectList {
    fn from_iter<I: IntoIterator<Item = (u64, ObjectId, u64)>>(iter: I) -> Self {
        let mut list = Self::new();
        for (off, oid, size) in iter {
            list.insert(off, oid, size);
        }
        list
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPair {
    pub key: String,
    pub value: String,
}

impl MetadataPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Descriptor stored under a blob's metadata key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetaDesc {
    pub name: String,
    pub version: BlobVersion,
    pub size: u64,
    pub mod_time: u64,
    pub metadata: BTreeMap<String, String>,
}

impl BlobMetaDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: BLOB_VERSION_DELETED,
            size: 0,
            mod_time: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub const fn is_deleted(&self) -> bool {
        self.version == BLOB_VERSION_DELETED
    }

    pub fn apply_pairs(&mut self, pairs: &[MetadataPair]) {
        for pair in pairs {
            self.metadata.insert(pair.key.clone(), pair.value.clone());
        }
    }

    pub fn marshall(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn unmarshall(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

/// A whole blob: descriptor plus its complete object list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobNode {
    pub desc: BlobMetaDesc,
    pub objects: BlobObjectList,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u64 = 4096;

    fn oid(n: u8) -> ObjectId {
        ObjectId::from_data(&[n])
    }

    #[test]
    fn test_merge_overlays() {
        let mut base: BlobObjectList = [(0, oid(1), MAX), (MAX, oid(2), 10)].into_iter().collect();
        let update: BlobObjectList = [(MAX, oid(3), MAX), (2 * MAX, oid(4), 7)]
            .into_iter()
            .collect();
        base.merge(&update);
        assert_eq!(base.len(), 3);
        assert_eq!(base.get(MAX).unwrap().oid, oid(3));
        assert_eq!(base.end_offset(), 2 * MAX + 7);
    }

    #[test]
    fn test_extents_split_on_slot_count() {
        let last_in_first = (OBJECTS_PER_EXTENT - 1) * MAX;
        let list: BlobObjectList = [
            (0, oid(1), MAX),
            (last_in_first, oid(2), MAX),
            (last_in_first + MAX, oid(3), 1),
        ]
        .into_iter()
        .collect();
        let extents = list.extents(MAX);
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[&0].len(), 2);
        assert_eq!(extents[&1].get(OBJECTS_PER_EXTENT * MAX).unwrap().oid, oid(3));
    }

    #[test]
    fn test_validate_alignment_and_size() {
        let ok: BlobObjectList = [(MAX, oid(1), MAX)].into_iter().collect();
        assert!(ok.validate(MAX).is_ok());
        let unaligned: BlobObjectList = [(5, oid(1), 1)].into_iter().collect();
        assert!(unaligned.validate(MAX).is_err());
        let oversize: BlobObjectList = [(0, oid(1), MAX + 1)].into_iter().collect();
        assert!(oversize.validate(MAX).is_err());
    }

    #[test]
    fn test_desc_marshall() {
        let mut desc = BlobMetaDesc::new("a/b");
        desc.version = 3;
        desc.apply_pairs(&[MetadataPair::new("content-type", "text/plain")]);
        let back = BlobMetaDesc::unmarshall(&desc.marshall().unwrap()).unwrap();
        assert_eq!(back, desc);
        assert!(!back.is_deleted());
    }
}
