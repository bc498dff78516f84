//! Persistent layer: object bytes in per-(tier, token) append-only files
//!
//! Layout: `<root>/<tier>/disk_<id>/token_<token>_<file>.dat`. Each token
//! appends to one active file at a time; the scavenger rotates a token to a
//! fresh file, copies live records forward and deletes the old files.
//!
//! Record format:
//! ```text
//! +--------+-----------+--------+--------+------+
//! | Magic  | Object id | Length | CRC32C | Data |
//! | 4B     | 20B       | 4B     | 4B     | var  |
//! +--------+-----------+--------+--------+------+
//! ```

use crate::meta::ObjPhyLoc;
use bytes::Bytes;
use dashmap::DashMap;
use fds_common::{DiskId, Error, OBJECT_ID_LEN, ObjectId, Result, SmTokenId, Tier};
use fds_placement::ObjectLocationTable;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const RECORD_MAGIC: u32 = 0x4644_534F; // "FDSO"

/// magic + oid + length + crc
pub const RECORD_HEADER_SIZE: usize = 4 + OBJECT_ID_LEN + 4 + 4;

/// Bytes a record of `size` data bytes occupies on disk
#[must_use]
pub const fn record_len(size: u32) -> u64 {
    RECORD_HEADER_SIZE as u64 + size as u64
}

#[derive(Clone, Debug)]
pub struct DataIoConfig {
    pub root: PathBuf,
    pub token_bits: u32,
    /// Size at which a token file stops accepting appends
    pub max_file_size: u64,
    /// Attempts per read before `DiskReadFailed`
    pub read_retries: u32,
    pub sync_writes: bool,
    /// Per-tier byte budget, indexed by `Tier::as_u8`; `None` is unlimited
    pub tier_capacity: [Option<u64>; 2],
}

impl DataIoConfig {
    pub fn new(root: impl Into<PathBuf>, token_bits: u32) -> Self {
        Self {
            root: root.into(),
            token_bits,
            max_file_size: 1024 * 1024 * 1024,
            read_retries: 3,
            sync_writes: false,
            tier_capacity: [None, None],
        }
    }
}

/// Space accounting for one token file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenFileStats {
    pub file_id: u16,
    pub size: u64,
    pub live: u64,
    pub deleted: u64,
}

struct TokenState {
    disk: DiskId,
    active: u16,
    files: BTreeMap<u16, TokenFileStats>,
}

impl TokenState {
    fn active_mut(&mut self) -> &mut TokenFileStats {
        let active = self.active;
        self.files.entry(active).or_insert(TokenFileStats {
            file_id: active,
            ..TokenFileStats::default()
        })
    }
}

/// Reads and writes object records on the disks named by the OLT
pub struct DataIo {
    config: DataIoConfig,
    olt: Arc<ObjectLocationTable>,
    tokens: DashMap<(Tier, SmTokenId), Arc<Mutex<TokenState>>>,
    used: [AtomicU64; 2],
}

impl DataIo {
    pub fn open(config: DataIoConfig, olt: Arc<ObjectLocationTable>) -> Result<Self> {
        for tier in Tier::ALL {
            for disk in olt.disks(tier) {
                std::fs::create_dir_all(Self::disk_dir(&config, tier, disk))?;
            }
        }
        info!(
            "Opened SM data layer at {:?} (hdd disks {:?}, ssd disks {:?})",
            config.root,
            olt.disks(Tier::Hdd),
            olt.disks(Tier::Ssd)
        );
        Ok(Self {
            config,
            olt,
            tokens: DashMap::new(),
            used: [AtomicU64::new(0), AtomicU64::new(0)],
        })
    }

    pub fn olt(&self) -> &ObjectLocationTable {
        &self.olt
    }

    pub const fn token_bits(&self) -> u32 {
        self.config.token_bits
    }

    pub fn has_tier(&self, tier: Tier) -> bool {
        self.olt.has_tier(tier)
    }

    fn disk_dir(config: &DataIoConfig, tier: Tier, disk: DiskId) -> PathBuf {
        config
            .root
            .join(tier.name())
            .join(format!("disk_{}", disk.get()))
    }

    fn file_path(&self, tier: Tier, disk: DiskId, token: SmTokenId, file_id: u16) -> PathBuf {
        Self::disk_dir(&self.config, tier, disk).join(format!("token_{token}_{file_id}.dat"))
    }

    /// Token state, rescanning existing files on first touch
    fn token_state(&self, tier: Tier, token: SmTokenId) -> Result<Arc<Mutex<TokenState>>> {
        if let Some(state) = self.tokens.get(&(tier, token)) {
            return Ok(Arc::clone(&state));
        }
        let entry = self
            .tokens
            .entry((tier, token))
            .or_try_insert_with(|| self.scan_token(tier, token).map(|s| Arc::new(Mutex::new(s))))?;
        Ok(Arc::clone(entry.value()))
    }

    fn scan_token(&self, tier: Tier, token: SmTokenId) -> Result<TokenState> {
        let disk = self.olt.get_disk_id(token, tier).ok_or_else(|| {
            Error::DiskWriteFailed(format!("no {tier} disk holds token {token}"))
        })?;

        let mut files = BTreeMap::new();
        let dir = Self::disk_dir(&self.config, tier, disk);
        let prefix = format!("token_{token}_");
        if dir.exists() {
            for entry in std::fs::read_dir(&dir)?.filter_map(std::result::Result::ok) {
                let name = entry.file_name();
                let Some(file_id) = name
                    .to_str()
                    .and_then(|n| n.strip_prefix(&prefix))
                    .and_then(|n| n.strip_suffix(".dat"))
                    .and_then(|n| n.parse::<u16>().ok())
                else {
                    continue;
                };
                let size = entry.metadata()?.len();
                // Deleted bytes are not known until metadata is walked again
                files.insert(
                    file_id,
                    TokenFileStats {
                        file_id,
                        size,
                        live: size,
                        deleted: 0,
                    },
                );
                self.used[tier.as_u8() as usize].fetch_add(size, Ordering::Relaxed);
            }
        }
        let active = files.keys().next_back().copied().unwrap_or(0);
        Ok(TokenState {
            disk,
            active,
            files,
        })
    }

    /// Append an object's bytes to its token's active file on `tier`
    pub fn write(&self, tier: Tier, oid: &ObjectId, data: &[u8]) -> Result<ObjPhyLoc> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::invalid_argument("object larger than 4GB"))?;
        let rec_len = record_len(len);
        if let Some(capacity) = self.config.tier_capacity[tier.as_u8() as usize]
            && self.used[tier.as_u8() as usize].load(Ordering::Relaxed) + rec_len > capacity
        {
            return Err(Error::DiskFull);
        }

        let token = oid.token(self.config.token_bits);
        let state = self.token_state(tier, token)?;
        let mut state = state.lock();
        let disk = state.disk;
        if state.active_mut().size > 0
            && state.active_mut().size + rec_len > self.config.max_file_size
        {
            state.active = state
                .active
                .checked_add(1)
                .ok_or_else(|| Error::internal(format!("token {token} ran out of file ids")))?;
            debug!("Token {} on {} rolled to file {}", token, tier, state.active);
        }
        let file_id = state.active;
        let offset = state.active_mut().size;

        let mut record = Vec::with_capacity(rec_len as usize);
        record.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        record.extend_from_slice(oid.as_bytes());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&crc32c::crc32c(data).to_le_bytes());
        record.extend_from_slice(data);

        let path = self.file_path(tier, disk, token, file_id);
        let map_err = |e: std::io::Error| {
            if e.kind() == ErrorKind::StorageFull {
                Error::DiskFull
            } else {
                Error::DiskWriteFailed(format!("{}: {e}", path.display()))
            }
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(map_err)?;
        file.write_all(&record).map_err(map_err)?;
        if self.config.sync_writes {
            file.sync_data().map_err(map_err)?;
        }

        let stats = state.active_mut();
        stats.size += rec_len;
        stats.live += rec_len;
        self.used[tier.as_u8() as usize].fetch_add(rec_len, Ordering::Relaxed);
        Ok(ObjPhyLoc {
            disk,
            file_id,
            offset,
        })
    }

    /// Read an object's bytes, retrying transient I/O failures
    pub fn read(&self, tier: Tier, oid: &ObjectId, loc: ObjPhyLoc) -> Result<Bytes> {
        let token = oid.token(self.config.token_bits);
        let path = self.file_path(tier, loc.disk, token, loc.file_id);
        let attempts = self.config.read_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match Self::read_record(&path, oid, loc.offset) {
                Ok(data) => return Ok(data),
                Err(e @ Error::ChecksumMismatch(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        "Read of {} from {:?} failed (attempt {}/{}): {}",
                        oid, path, attempt, attempts, e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(Error::DiskReadFailed(format!(
            "{oid} at {}:{}: {}",
            path.display(),
            loc.offset,
            last_err.map_or_else(String::new, |e| e.to_string())
        )))
    }

    fn read_record(path: &Path, oid: &ObjectId, offset: u64) -> Result<Bytes> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        file.read_exact(&mut header)?;

        let corrupt = || Error::ChecksumMismatch(format!("{oid} at {}:{offset}", path.display()));
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != RECORD_MAGIC || &header[4..4 + OBJECT_ID_LEN] != oid.as_bytes() {
            return Err(corrupt());
        }
        let at = 4 + OBJECT_ID_LEN;
        let len = u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
        let crc = u32::from_le_bytes([
            header[at + 4],
            header[at + 5],
            header[at + 6],
            header[at + 7],
        ]);

        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data)?;
        if crc32c::crc32c(&data) != crc {
            return Err(corrupt());
        }
        Ok(Bytes::from(data))
    }

    /// Move a record's bytes from live to reclaimable
    pub fn account_deleted(&self, tier: Tier, oid: &ObjectId, loc: ObjPhyLoc, size: u32) {
        self.adjust(tier, oid, loc, |stats| {
            let n = record_len(size).min(stats.live);
            stats.live -= n;
            stats.deleted += n;
        });
    }

    /// Undo `account_deleted` for a record referenced again
    pub fn account_revived(&self, tier: Tier, oid: &ObjectId, loc: ObjPhyLoc, size: u32) {
        self.adjust(tier, oid, loc, |stats| {
            let n = record_len(size).min(stats.deleted);
            stats.deleted -= n;
            stats.live += n;
        });
    }

    fn adjust(
        &self,
        tier: Tier,
        oid: &ObjectId,
        loc: ObjPhyLoc,
        f: impl FnOnce(&mut TokenFileStats),
    ) {
        let token = oid.token(self.config.token_bits);
        match self.token_state(tier, token) {
            Ok(state) => {
                if let Some(stats) = state.lock().files.get_mut(&loc.file_id) {
                    f(stats);
                }
            }
            Err(e) => warn!("No space accounting for token {} on {}: {}", token, tier, e),
        }
    }

    /// Per-file accounting of one token on `tier`
    pub fn token_stats(&self, tier: Tier, token: SmTokenId) -> Result<Vec<TokenFileStats>> {
        let state = self.token_state(tier, token)?;
        let stats = state.lock().files.values().copied().collect();
        Ok(stats)
    }

    /// Start a new active file for `token`; returns the ids it replaced
    pub fn rotate_for_compaction(&self, tier: Tier, token: SmTokenId) -> Result<Vec<u16>> {
        let state = self.token_state(tier, token)?;
        let mut state = state.lock();
        let old: Vec<u16> = state.files.keys().copied().collect();
        if old.is_empty() {
            return Ok(old);
        }
        state.active = state
            .active
            .checked_add(1)
            .ok_or_else(|| Error::internal(format!("token {token} ran out of file ids")))?;
        state.active_mut();
        info!(
            "Rotated token {} on {} to file {} for compaction",
            token, tier, state.active
        );
        Ok(old)
    }

    /// Remove a token file once nothing references it
    pub fn delete_file(&self, tier: Tier, token: SmTokenId, file_id: u16) -> Result<()> {
        let state = self.token_state(tier, token)?;
        let mut state = state.lock();
        if file_id == state.active {
            return Err(Error::invalid_argument(format!(
                "file {file_id} of token {token} is still active"
            )));
        }
        let Some(stats) = state.files.remove(&file_id) else {
            return Ok(());
        };
        let path = self.file_path(tier, state.disk, token, file_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::DiskWriteFailed(format!("{}: {e}", path.display()))),
        }
        self.used[tier.as_u8() as usize].fetch_sub(
            stats.size.min(self.used[tier.as_u8() as usize].load(Ordering::Relaxed)),
            Ordering::Relaxed,
        );
        debug!("Deleted {:?}", path);
        Ok(())
    }

    /// Bytes stored on `tier`
    pub fn used_bytes(&self, tier: Tier) -> u64 {
        self.used[tier.as_u8() as usize].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fds_placement::SmTokenPlacement;
    use tempfile::tempdir;

    fn data_io(root: &std::path::Path, max_file_size: u64) -> DataIo {
        let olt = SmTokenPlacement::compute(4, &[DiskId::new(0)], &[DiskId::new(1)]).unwrap();
        DataIo::open(
            DataIoConfig {
                max_file_size,
                ..DataIoConfig::new(root, 2)
            },
            Arc::new(olt),
        )
        .unwrap()
    }

    #[test]
    fn test_write_read() {
        let dir = tempdir().unwrap();
        let io = data_io(dir.path(), 1 << 20);
        let oid = ObjectId::from_data(b"hello");
        let loc = io.write(Tier::Hdd, &oid, b"hello").unwrap();
        assert_eq!(loc.offset, 0);
        assert_eq!(io.read(Tier::Hdd, &oid, loc).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(io.used_bytes(Tier::Hdd), record_len(5));
    }

    #[test]
    fn test_read_detects_wrong_object() {
        let dir = tempdir().unwrap();
        let io = data_io(dir.path(), 1 << 20);
        let oid = ObjectId::from_data(b"a");
        let loc = io.write(Tier::Hdd, &oid, b"a").unwrap();
        let mut other = *oid.as_bytes();
        other[19] ^= 1;
        let other = ObjectId::from_bytes(other);
        assert!(matches!(
            io.read(Tier::Hdd, &other, loc),
            Err(Error::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_missing_file_fails_after_retries() {
        let dir = tempdir().unwrap();
        let io = data_io(dir.path(), 1 << 20);
        let oid = ObjectId::from_data(b"x");
        let loc = ObjPhyLoc {
            disk: DiskId::new(0),
            file_id: 7,
            offset: 0,
        };
        assert!(matches!(
            io.read(Tier::Hdd, &oid, loc),
            Err(Error::DiskReadFailed(_))
        ));
    }

    #[test]
    fn test_rollover_and_stats() {
        let dir = tempdir().unwrap();
        let io = data_io(dir.path(), 64);
        let oid = ObjectId::from_data(b"obj");
        let token = oid.token(2);
        let a = io.write(Tier::Hdd, &oid, &[1u8; 40]).unwrap();
        let b = io.write(Tier::Hdd, &oid, &[2u8; 40]).unwrap();
        assert_ne!(a.file_id, b.file_id);

        io.account_deleted(Tier::Hdd, &oid, a, 40);
        let stats = io.token_stats(Tier::Hdd, token).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].deleted, record_len(40));
        assert_eq!(stats[0].live, 0);
        io.account_revived(Tier::Hdd, &oid, a, 40);
        assert_eq!(io.token_stats(Tier::Hdd, token).unwrap()[0].live, record_len(40));
    }

    #[test]
    fn test_rotate_and_delete() {
        let dir = tempdir().unwrap();
        let io = data_io(dir.path(), 1 << 20);
        let oid = ObjectId::from_data(b"obj");
        let token = oid.token(2);
        io.write(Tier::Ssd, &oid, b"v1").unwrap();
        let old = io.rotate_for_compaction(Tier::Ssd, token).unwrap();
        assert_eq!(old, vec![0]);
        let loc = io.write(Tier::Ssd, &oid, b"v1").unwrap();
        assert_eq!(loc.file_id, 1);
        io.delete_file(Tier::Ssd, token, 0).unwrap();
        assert!(io.delete_file(Tier::Ssd, token, 1).is_err());
        assert_eq!(io.used_bytes(Tier::Ssd), record_len(2));
    }

    #[test]
    fn test_capacity_limit() {
        let dir = tempdir().unwrap();
        let olt = SmTokenPlacement::compute(4, &[DiskId::new(0)], &[DiskId::new(1)]).unwrap();
        let io = DataIo::open(
            DataIoConfig {
                tier_capacity: [Some(record_len(8)), None],
                ..DataIoConfig::new(dir.path(), 2)
            },
            Arc::new(olt),
        )
        .unwrap();
        let oid = ObjectId::from_data(b"o");
        io.write(Tier::Ssd, &oid, &[0; 8]).unwrap();
        assert!(matches!(io.write(Tier::Ssd, &oid, &[0; 1]), Err(Error::DiskFull)));
        io.write(Tier::Hdd, &oid, &[0; 100]).unwrap();
    }

    #[test]
    fn test_rescan_existing_files() {
        let dir = tempdir().unwrap();
        let oid = ObjectId::from_data(b"persist");
        let loc = {
            let io = data_io(dir.path(), 1 << 20);
            io.write(Tier::Hdd, &oid, b"persist").unwrap()
        };
        let io = data_io(dir.path(), 1 << 20);
        let second = io.write(Tier::Hdd, &oid, b"persist").unwrap();
        assert_eq!(second.offset, record_len(7));
        assert_eq!(io.read(Tier::Hdd, &oid, loc).unwrap().as_ref(), b"persist");
    }
}
