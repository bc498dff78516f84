//! Object metadata write-ahead log
//!
//! Record format:
//! ```text
//! +--------+------+--------+------+--------+
//! | Magic  | LSN  | Length | Data | CRC32C |
//! | 4B     | 8B   | 4B     | var  | 4B     |
//! +--------+------+--------+------+--------+
//! ```
//! A torn or corrupt record ends the log; everything before it replays.

use fds_common::{Error, ObjectId, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const WAL_MAGIC: u32 = 0x4F57_414C; // "OWAL"

/// magic + lsn + length
const RECORD_HEADER_SIZE: usize = 16;

/// A logged metadata mutation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaOp {
    /// Store a marshalled `ObjMetaData`
    Put { oid: ObjectId, value: Vec<u8> },
    /// Remove an object's metadata
    Delete { oid: ObjectId },
    /// Operations applied together
    Batch { ops: Vec<MetaOp> },
}

#[derive(Clone, Debug)]
pub struct WalConfig {
    /// Sync after every append
    pub sync_on_write: bool,
    /// Size past which the store should snapshot and truncate
    pub max_size_bytes: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_size_bytes: 64 * 1024 * 1024, // 64MB
        }
    }
}

fn encode_record(lsn: u64, data: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(data.len())
        .map_err(|_| Error::invalid_argument("metadata record too large"))?;
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + data.len() + 4);
    buf.extend_from_slice(&WAL_MAGIC.to_le_bytes());
    buf.extend_from_slice(&lsn.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(data);
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Parse one record; `None` on a torn or corrupt tail
fn decode_record(buf: &[u8]) -> Option<(u64, &[u8], usize)> {
    let header = buf.get(..RECORD_HEADER_SIZE)?;
    if u32::from_le_bytes(header[0..4].try_into().ok()?) != WAL_MAGIC {
        return None;
    }
    let lsn = u64::from_le_bytes(header[4..12].try_into().ok()?);
    let len = u32::from_le_bytes(header[12..16].try_into().ok()?) as usize;
    let total = RECORD_HEADER_SIZE + len + 4;
    let record = buf.get(..total)?;
    let stored = u32::from_le_bytes(record[total - 4..].try_into().ok()?);
    if crc32c::crc32c(&record[..total - 4]) != stored {
        return None;
    }
    Some((lsn, &record[RECORD_HEADER_SIZE..total - 4], total))
}

/// Append-only log of `MetaOp`s
pub struct MetaWal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    size: AtomicU64,
    next_lsn: AtomicU64,
    config: WalConfig,
}

impl MetaWal {
    /// Open the log at `path`, creating it if missing
    pub fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (last_lsn, valid_len) = Self::scan(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        // Drop a torn tail so new records follow the last good one
        file.set_len(valid_len)?;
        let mut writer = BufWriter::new(file);
        std::io::Seek::seek(&mut writer, std::io::SeekFrom::End(0))?;

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            size: AtomicU64::new(valid_len),
            next_lsn: AtomicU64::new(last_lsn + 1),
            config,
        })
    }

    fn scan(path: &Path) -> Result<(u64, u64)> {
        let buf = match std::fs::read(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };
        let mut last_lsn = 0;
        let mut pos = 0;
        while let Some((lsn, _, size)) = decode_record(&buf[pos..]) {
            last_lsn = lsn;
            pos += size;
        }
        Ok((last_lsn, pos as u64))
    }

    /// Append an operation, returning its LSN
    pub fn append(&self, op: &MetaOp) -> Result<u64> {
        let data = bincode::serialize(op)?;

        let mut writer = self.writer.lock();
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let bytes = encode_record(lsn, &data)?;
        writer
            .write_all(&bytes)
            .map_err(|e| Error::DiskWriteFailed(format!("metadata WAL write: {e}")))?;
        if self.config.sync_on_write {
            writer
                .flush()
                .and_then(|()| writer.get_ref().sync_data())
                .map_err(|e| Error::DiskWriteFailed(format!("metadata WAL sync: {e}")))?;
        }
        self.size.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(lsn)
    }

    /// Append several operations as one record
    pub fn append_batch(&self, ops: Vec<MetaOp>) -> Result<u64> {
        if ops.is_empty() {
            return Ok(self.current_lsn());
        }
        self.append(&MetaOp::Batch { ops })
    }

    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replay records with LSN >= `from_lsn`; returns the last LSN seen
    pub fn replay<F>(&self, from_lsn: u64, mut callback: F) -> Result<u64>
    where
        F: FnMut(u64, MetaOp) -> Result<()>,
    {
        self.writer.lock().flush()?;
        let buf = std::fs::read(&self.path)?;
        let mut pos = 0;
        let mut last_lsn = from_lsn.saturating_sub(1);
        while let Some((lsn, data, size)) = decode_record(&buf[pos..]) {
            if lsn >= from_lsn {
                callback(lsn, bincode::deserialize(data)?)?;
            }
            last_lsn = lsn;
            pos += size;
        }
        Ok(last_lsn)
    }

    /// Rewrite the log keeping only records with LSN >= `lsn`
    pub fn truncate_before(&self, lsn: u64) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let buf = std::fs::read(&self.path)?;
        let mut kept = Vec::new();
        let mut pos = 0;
        while let Some((record_lsn, _, size)) = decode_record(&buf[pos..]) {
            if record_lsn >= lsn {
                kept.extend_from_slice(&buf[pos..pos + size]);
            }
            pos += size;
        }

        let tmp_path = self.path.with_extension("wal.new");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&kept)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        *writer = BufWriter::new(file);
        self.size.store(kept.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Make sure new records are numbered after `lsn`
    pub fn advance_to(&self, lsn: u64) {
        self.next_lsn.fetch_max(lsn + 1, Ordering::SeqCst);
    }

    /// Last LSN assigned
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst).saturating_sub(1)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn needs_compaction(&self) -> bool {
        self.size() > self.config.max_size_bytes
    }
}
