//! Per-object metadata record
//!
//! On-disk layout (little-endian):
//! ```text
//! +-------+-----+-----+------+---------+----------+-------------+------+-------+-------------+
//! | magic | ver | oid | size | ref_cnt | mod_time | delete_time | locs | loc*  | assoc_cnt   |
//! | 2B    | 1B  | 20B | 4B   | 8B      | 8B       | 8B          | 1B   | 12B*n | 2B + 12B*m  |
//! +-------+-----+-----+------+---------+----------+-------------+------+-------+-------------+
//! ```
//! `locs` is a bitmask indexed by `Tier::as_u8()`; each set bit is followed
//! by one location record (disk u16, file u16, offset u64). Each volume
//! association is (volume u64, refs u32).

use fds_common::{DiskId, Error, OBJECT_ID_LEN, ObjectId, Result, Tier, VolumeId, now_millis};

const META_MAGIC: u16 = 0x4D4F; // "OM"
const META_VERSION: u8 = 1;
const FIXED_SIZE: usize = 2 + 1 + OBJECT_ID_LEN + 4 + 8 + 8 + 8 + 1;
const LOC_SIZE: usize = 12;
const ASSOC_SIZE: usize = 12;

/// Physical location of an object's bytes on one tier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjPhyLoc {
    pub disk: DiskId,
    pub file_id: u16,
    pub offset: u64,
}

/// References held by one volume
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolAssoc {
    pub vol: VolumeId,
    pub refs: u32,
}

/// Object metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjMetaData {
    oid: ObjectId,
    size: u32,
    ref_cnt: u64,
    mod_time: u64,
    /// When the reference count dropped to zero; 0 while referenced
    delete_time: u64,
    locs: [Option<ObjPhyLoc>; 2],
    assoc: Vec<VolAssoc>,
}

impl ObjMetaData {
    /// Fresh, unreferenced metadata for an object of `size` bytes
    #[must_use]
    pub fn new(oid: ObjectId, size: u32) -> Self {
        Self {
            oid,
            size,
            ref_cnt: 0,
            mod_time: now_millis(),
            delete_time: 0,
            locs: [None, None],
            assoc: Vec::new(),
        }
    }

    #[must_use]
    pub const fn oid(&self) -> &ObjectId {
        &self.oid
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub const fn ref_cnt(&self) -> u64 {
        self.ref_cnt
    }

    #[must_use]
    pub const fn mod_time(&self) -> u64 {
        self.mod_time
    }

    #[must_use]
    pub const fn delete_time(&self) -> u64 {
        self.delete_time
    }

    /// No volume references the object any more
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.ref_cnt == 0
    }

    #[must_use]
    pub fn associations(&self) -> &[VolAssoc] {
        &self.assoc
    }

    /// References held by `vol`
    #[must_use]
    pub fn refs_for(&self, vol: VolumeId) -> u32 {
        self.assoc
            .iter()
            .find(|a| a.vol == vol)
            .map_or(0, |a| a.refs)
    }

    /// Add one reference from `vol`
    pub fn add_assoc(&mut self, vol: VolumeId) {
        match self.assoc.iter_mut().find(|a| a.vol == vol) {
            Some(a) => a.refs += 1,
            None => self.assoc.push(VolAssoc { vol, refs: 1 }),
        }
        self.ref_cnt += 1;
        self.delete_time = 0;
        self.touch();
    }

    /// Drop one reference from `vol`; `false` if `vol` held none
    pub fn remove_assoc(&mut self, vol: VolumeId) -> bool {
        let Some(idx) = self.assoc.iter().position(|a| a.vol == vol) else {
            return false;
        };
        self.assoc[idx].refs -= 1;
        if self.assoc[idx].refs == 0 {
            self.assoc.swap_remove(idx);
        }
        self.ref_cnt -= 1;
        self.touch();
        if self.ref_cnt == 0 {
            self.delete_time = self.mod_time.max(1);
        }
        true
    }

    /// Fold another node's view of this object into ours
    ///
    /// Per-volume reference counts take the larger of the two.
    pub fn merge_assoc(&mut self, other: &Self) {
        for theirs in &other.assoc {
            match self.assoc.iter_mut().find(|a| a.vol == theirs.vol) {
                Some(a) => a.refs = a.refs.max(theirs.refs),
                None => self.assoc.push(*theirs),
            }
        }
        self.ref_cnt = self.assoc.iter().map(|a| u64::from(a.refs)).sum();
        self.mod_time = self.mod_time.max(other.mod_time);
        self.delete_time = if self.ref_cnt == 0 {
            self.delete_time.max(other.delete_time).max(1)
        } else {
            0
        };
    }

    pub fn touch(&mut self) {
        self.mod_time = now_millis().max(self.mod_time);
    }

    #[must_use]
    pub const fn location(&self, tier: Tier) -> Option<ObjPhyLoc> {
        self.locs[tier.as_u8() as usize]
    }

    pub fn set_location(&mut self, tier: Tier, loc: ObjPhyLoc) {
        self.locs[tier.as_u8() as usize] = Some(loc);
    }

    pub fn clear_location(&mut self, tier: Tier) -> Option<ObjPhyLoc> {
        self.locs[tier.as_u8() as usize].take()
    }

    #[must_use]
    pub const fn on_tier(&self, tier: Tier) -> bool {
        self.location(tier).is_some()
    }

    /// Tier reads are served from: flash when present
    #[must_use]
    pub const fn read_tier(&self) -> Option<Tier> {
        if self.on_tier(Tier::Ssd) {
            Some(Tier::Ssd)
        } else if self.on_tier(Tier::Hdd) {
            Some(Tier::Hdd)
        } else {
            None
        }
    }

    /// Serialize into the fixed on-disk layout
    #[must_use]
    pub fn marshall(&self) -> Vec<u8> {
        let nlocs = self.locs.iter().flatten().count();
        let mut buf =
            Vec::with_capacity(FIXED_SIZE + nlocs * LOC_SIZE + 2 + self.assoc.len() * ASSOC_SIZE);

        buf.extend_from_slice(&META_MAGIC.to_le_bytes());
        buf.push(META_VERSION);
        buf.extend_from_slice(self.oid.as_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.ref_cnt.to_le_bytes());
        buf.extend_from_slice(&self.mod_time.to_le_bytes());
        buf.extend_from_slice(&self.delete_time.to_le_bytes());

        let mask = Tier::ALL
            .iter()
            .filter(|t| self.on_tier(**t))
            .fold(0u8, |m, t| m | (1 << t.as_u8()));
        buf.push(mask);
        for tier in Tier::ALL {
            if let Some(loc) = self.location(tier) {
                buf.extend_from_slice(&loc.disk.get().to_le_bytes());
                buf.extend_from_slice(&loc.file_id.to_le_bytes());
                buf.extend_from_slice(&loc.offset.to_le_bytes());
            }
        }

        let count = u16::try_from(self.assoc.len()).unwrap_or(u16::MAX);
        buf.extend_from_slice(&count.to_le_bytes());
        for a in self.assoc.iter().take(usize::from(count)) {
            buf.extend_from_slice(&a.vol.get().to_le_bytes());
            buf.extend_from_slice(&a.refs.to_le_bytes());
        }
        buf
    }

    /// Parse the on-disk layout
    pub fn unmarshall(data: &[u8]) -> Result<Self> {
        let mut r = Reader { data, pos: 0 };
        if r.u16()? != META_MAGIC {
            return Err(Error::Serialization("bad object metadata magic".into()));
        }
        let version = r.u8()?;
        if version != META_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported object metadata version {version}"
            )));
        }
        let oid = ObjectId::from_slice(r.take(OBJECT_ID_LEN)?)
            .ok_or_else(|| Error::Serialization("bad object id".into()))?;
        let size = r.u32()?;
        let ref_cnt = r.u64()?;
        let mod_time = r.u64()?;
        let delete_time = r.u64()?;

        let mask = r.u8()?;
        let mut locs = [None, None];
        for tier in Tier::ALL {
            if mask & (1 << tier.as_u8()) != 0 {
                locs[tier.as_u8() as usize] = Some(ObjPhyLoc {
                    disk: DiskId::new(r.u16()?),
                    file_id: r.u16()?,
                    offset: r.u64()?,
                });
            }
        }

        let count = r.u16()?;
        let mut assoc = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            assoc.push(VolAssoc {
                vol: VolumeId::new(r.u64()?),
                refs: r.u32()?,
            });
        }
        if r.pos != data.len() {
            return Err(Error::Serialization("trailing bytes in object metadata".into()));
        }

        Ok(Self {
            oid,
            size,
            ref_cnt,
            mod_time,
            delete_time,
            locs,
            assoc,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| Error::Serialization("object metadata truncated".into()))?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjMetaData {
        let mut meta = ObjMetaData::new(ObjectId::from_data(b"payload"), 7);
        meta.add_assoc(VolumeId::new(1));
        meta.add_assoc(VolumeId::new(1));
        meta.add_assoc(VolumeId::new(9));
        meta.set_location(
            Tier::Hdd,
            ObjPhyLoc {
                disk: DiskId::new(2),
                file_id: 3,
                offset: 4096,
            },
        );
        meta
    }

    #[test]
    fn test_marshall_is_byte_exact() {
        let meta = sample();
        let bytes = meta.marshall();
        let back = ObjMetaData::unmarshall(&bytes).unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.marshall(), bytes);
    }

    #[test]
    fn test_unmarshall_rejects_garbage() {
        let bytes = sample().marshall();
        assert!(ObjMetaData::unmarshall(&bytes[..bytes.len() - 1]).is_err());
        let mut bad = bytes.clone();
        bad[0] ^= 0xff;
        assert!(ObjMetaData::unmarshall(&bad).is_err());
        let mut long = bytes;
        long.push(0);
        assert!(ObjMetaData::unmarshall(&long).is_err());
    }

    #[test]
    fn test_ref_count_lifecycle() {
        let mut meta = sample();
        assert_eq!(meta.ref_cnt(), 3);
        assert_eq!(meta.refs_for(VolumeId::new(1)), 2);
        assert!(!meta.remove_assoc(VolumeId::new(5)));
        assert!(meta.remove_assoc(VolumeId::new(1)));
        assert!(meta.remove_assoc(VolumeId::new(1)));
        assert!(!meta.is_deleted());
        assert!(meta.remove_assoc(VolumeId::new(9)));
        assert!(meta.is_deleted());
        assert!(meta.delete_time() > 0);
        assert!(meta.associations().is_empty());

        meta.add_assoc(VolumeId::new(4));
        assert!(!meta.is_deleted());
        assert_eq!(meta.delete_time(), 0);
    }

    #[test]
    fn test_read_tier_prefers_flash() {
        let mut meta = sample();
        assert_eq!(meta.read_tier(), Some(Tier::Hdd));
        meta.set_location(
            Tier::Ssd,
            ObjPhyLoc {
                disk: DiskId::new(10),
                file_id: 0,
                offset: 0,
            },
        );
        assert_eq!(meta.read_tier(), Some(Tier::Ssd));
        meta.clear_location(Tier::Ssd);
        meta.clear_location(Tier::Hdd);
        assert_eq!(meta.read_tier(), None);
    }

    #[test]
    fn test_merge_assoc_takes_max() {
        let mut ours = sample();
        let mut theirs = ObjMetaData::new(*ours.oid(), 7);
        theirs.add_assoc(VolumeId::new(1));
        theirs.add_assoc(VolumeId::new(1));
        theirs.add_assoc(VolumeId::new(1));
        theirs.add_assoc(VolumeId::new(3));
        ours.merge_assoc(&theirs);
        assert_eq!(ours.refs_for(VolumeId::new(1)), 3);
        assert_eq!(ours.refs_for(VolumeId::new(3)), 1);
        assert_eq!(ours.refs_for(VolumeId::new(9)), 1);
        assert_eq!(ours.ref_cnt(), 5);
    }
}
