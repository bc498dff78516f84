//! Operation journal of committed blob transactions
//!
//! Record format:
//! ```text
//! +--------+------+--------+------+--------+
//! | Magic  | Seq  | Length | Data | CRC32C |
//! | 4B     | 8B   | 4B     | var  | 4B     |
//! +--------+------+--------+------+--------+
//! ```
//! The active file is `<volId>_journal.log`. When it is full, `log`
//! returns `None` and the caller rotates: the active file is renamed to
//! the next numeric suffix (`.1`, `.2`, ...) and a fresh one is opened, so
//! the newest records are always in the file without a suffix.

use crate::commit_log::BlobTxUpdate;
use fds_common::{BlobTxId, Error, Result, VolumeId};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const JOURNAL_MAGIC: u32 = 0x444D_4A4C; // "DMJL"

/// magic + seq + length
const RECORD_HEADER_SIZE: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub seq: u64,
    pub tx_id: BlobTxId,
    pub committed_at: u64,
    pub update: BlobTxUpdate,
}

fn encode_record(record: &JournalRecord) -> Result<Vec<u8>> {
    let data = bincode::serialize(record)?;
    let len = u32::try_from(data.len())
        .map_err(|_| Error::invalid_argument("journal record too large"))?;
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + data.len() + 4);
    buf.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
    buf.extend_from_slice(&record.seq.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&data);
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Parse one record; `None` on a torn or corrupt tail
fn decode_record(buf: &[u8]) -> Option<(JournalRecord, usize)> {
    let header = buf.get(..RECORD_HEADER_SIZE)?;
    if u32::from_le_bytes(header[0..4].try_into().ok()?) != JOURNAL_MAGIC {
        return None;
    }
    let len = u32::from_le_bytes(header[12..16].try_into().ok()?) as usize;
    let total = RECORD_HEADER_SIZE + len + 4;
    let record = buf.get(..total)?;
    let stored = u32::from_le_bytes(record[total - 4..].try_into().ok()?);
    if crc32c::crc32c(&record[..total - 4]) != stored {
        return None;
    }
    let decoded = bincode::deserialize(&record[RECORD_HEADER_SIZE..total - 4]).ok()?;
    Some((decoded, total))
}

fn read_records(path: &Path) -> Result<(Vec<JournalRecord>, u64)> {
    let buf = match std::fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    let mut pos = 0;
    while let Some((record, size)) = decode_record(&buf[pos..]) {
        records.push(record);
        pos += size;
    }
    Ok((records, pos as u64))
}

pub struct DmTvcOperationJournal {
    dir: PathBuf,
    base: String,
    writer: BufWriter<File>,
    size: u64,
    file_size: u64,
    next_seq: u64,
    /// Highest archive suffix in use
    last_archive: u32,
    /// A failed append may have left bytes past `size`
    needs_reset: bool,
    #[cfg(test)]
    fail_next_write: bool,
}

impl DmTvcOperationJournal {
    /// Open the journal of `vol` in `dir`, dropping a torn tail from the
    /// active file
    pub fn open(dir: impl AsRef<Path>, vol: VolumeId, file_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let base = format!("{}_journal.log", vol.get());

        let mut last_archive = 0;
        let mut next_seq = 1;
        for (suffix, path) in Self::archives_in(&dir, &base)? {
            last_archive = last_archive.max(suffix);
            let (records, _) = read_records(&path)?;
            if let Some(r) = records.last() {
                next_seq = next_seq.max(r.seq + 1);
            }
        }
        let active = dir.join(&base);
        let (records, valid_len) = read_records(&active)?;
        if let Some(r) = records.last() {
            next_seq = next_seq.max(r.seq + 1);
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&active)?;
        if file.metadata()?.len() != valid_len {
            warn!("Truncating torn journal tail of {} at {}", vol, valid_len);
            file.set_len(valid_len)?;
        }
        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::End(0))?;

        info!(
            "Opened journal {:?} ({} archives, next seq {})",
            active, last_archive, next_seq
        );
        Ok(Self {
            dir,
            base,
            writer,
            size: valid_len,
            file_size,
            next_seq,
            last_archive,
            needs_reset: false,
            #[cfg(test)]
            fail_next_write: false,
        })
    }

    /// Archived files in suffix order
    fn archives_in(dir: &Path, base: &str) -> Result<Vec<(u32, PathBuf)>> {
        let prefix = format!("{base}.");
        let mut archives = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(suffix) = name
                .to_str()
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            archives.push((suffix, entry.path()));
        }
        archives.sort_unstable_by_key(|(suffix, _)| *suffix);
        Ok(archives)
    }

    pub fn active_path(&self) -> PathBuf {
        self.dir.join(&self.base)
    }

    /// Sequence the next record must carry
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Never hand out a sequence at or below `seq`
    pub fn ensure_next_seq_above(&mut self, seq: u64) {
        self.next_seq = self.next_seq.max(seq + 1);
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Append `record`, returning its offset in the active file, or `None`
    /// if the file is full and must be rotated first
    pub fn log(&mut self, record: &JournalRecord) -> Result<Option<u64>> {
        if record.seq != self.next_seq {
            return Err(Error::invalid_argument(format!(
                "journal expects seq {}, got {}",
                self.next_seq, record.seq
            )));
        }
        let bytes = encode_record(record)?;
        if self.size > 0 && self.size + bytes.len() as u64 > self.file_size {
            return Ok(None);
        }
        if self.needs_reset {
            self.reset_writer()?;
        }
        if let Err(e) = self.append(&bytes) {
            self.needs_reset = true;
            if let Err(reset) = self.reset_writer() {
                warn!("Journal {} not reset after failed write: {}", self.base, reset);
            }
            return Err(Error::DiskWriteFailed(format!("journal write: {e}")));
        }
        let offset = self.size;
        self.size += bytes.len() as u64;
        self.next_seq += 1;
        Ok(Some(offset))
    }

    fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_write) {
            // Half the record reaches the file, the rest stays buffered
            let (head, tail) = bytes.split_at(bytes.len() / 2);
            self.writer.write_all(head)?;
            self.writer.flush()?;
            self.writer.write_all(tail)?;
            return Err(std::io::Error::other("write failed"));
        }
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    /// Drop buffered bytes and cut the active file back to the last
    /// record that was fully written
    fn reset_writer(&mut self) -> Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it
        drop(stale.into_parts());
        self.writer.get_ref().set_len(self.size)?;
        self.writer.seek(SeekFrom::Start(self.size))?;
        self.needs_reset = false;
        warn!("Journal {} reset to {} bytes", self.base, self.size);
        Ok(())
    }

    /// Archive the active file under the next suffix and start a new one
    pub fn rotate(&mut self) -> Result<PathBuf> {
        if self.needs_reset {
            self.reset_writer()?;
        }
        self.writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_all())
            .map_err(|e| Error::DiskWriteFailed(format!("journal sync: {e}")))?;
        let suffix = self.last_archive + 1;
        let archived = self.dir.join(format!("{}.{suffix}", self.base));
        let active = self.active_path();
        std::fs::rename(&active, &archived)?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&active)?;
        self.writer = BufWriter::new(file);
        self.size = 0;
        self.last_archive = suffix;
        info!("Rotated journal to {:?}", archived);
        Ok(archived)
    }

    /// Records with a sequence above `after_seq`, oldest first
    pub fn replay(&self, after_seq: u64) -> Result<Vec<JournalRecord>> {
        let mut out = Vec::new();
        let mut files: Vec<PathBuf> = Self::archives_in(&self.dir, &self.base)?
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        files.push(self.active_path());
        for path in files {
            let (records, _) = read_records(&path)?;
            out.extend(records.into_iter().filter(|r| r.seq > after_seq));
        }
        Ok(out)
    }

    /// Delete archives whose records are all at or below `applied_seq`
    pub fn prune(&mut self, applied_seq: u64) -> Result<usize> {
        let mut removed = 0;
        for (_, path) in Self::archives_in(&self.dir, &self.base)? {
            let (records, _) = read_records(&path)?;
            if records.last().is_some_and(|r| r.seq > applied_seq) {
                break;
            }
            std::fs::remove_file(&path)?;
            removed += 1;
        }
        if removed > 0 {
            info!("Pruned {} journal archives of {}", removed, self.base);
        }
        Ok(removed)
    }

    pub fn archive_count(&self) -> Result<usize> {
        Ok(Self::archives_in(&self.dir, &self.base)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobObjectList;
    use crate::commit_log::TxMode;
    use fds_common::ObjectId;
    use tempfile::tempdir;

    const VOL: VolumeId = VolumeId::new(5);

    fn record(journal: &DmTvcOperationJournal, blob: &str) -> JournalRecord {
        JournalRecord {
            seq: journal.next_seq(),
            tx_id: BlobTxId::new(journal.next_seq()),
            committed_at: 0,
            update: BlobTxUpdate {
                blob: blob.to_string(),
                mode: TxMode::Update,
                objects: [(0, ObjectId::from_data(blob.as_bytes()), 10)]
                    .into_iter()
                    .collect::<BlobObjectList>(),
                metadata: Vec::new(),
                delete: false,
            },
        }
    }

    fn one_record_len() -> u64 {
        let dir = tempdir().unwrap();
        let mut journal = DmTvcOperationJournal::open(dir.path(), VOL, u64::MAX).unwrap();
        let r = record(&journal, "blob-00");
        journal.log(&r).unwrap();
        journal.size()
    }

    #[test]
    fn test_full_file_rotates_once_then_retry_succeeds() {
        let dir = tempdir().unwrap();
        let len = one_record_len();
        let mut journal = DmTvcOperationJournal::open(dir.path(), VOL, len * 3).unwrap();

        let mut rotations = 0;
        for i in 0..4 {
            let r = record(&journal, &format!("blob-{i:02}"));
            if journal.log(&r).unwrap().is_none() {
                journal.rotate().unwrap();
                rotations += 1;
                assert_eq!(journal.log(&r).unwrap(), Some(0));
            }
        }
        assert_eq!(rotations, 1);
        assert!(dir.path().join("5_journal.log.1").exists());
        assert!(!dir.path().join("5_journal.log.2").exists());
        assert_eq!(journal.size(), len);

        let seqs: Vec<_> = journal.replay(0).unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(journal.replay(2).unwrap().len(), 2);
    }

    #[test]
    fn test_archives_take_increasing_suffixes() {
        let dir = tempdir().unwrap();
        let mut journal = DmTvcOperationJournal::open(dir.path(), VOL, 1).unwrap();
        for i in 0..3 {
            let r = record(&journal, &format!("b{i}"));
            if journal.log(&r).unwrap().is_none() {
                journal.rotate().unwrap();
                journal.log(&r).unwrap().unwrap();
            }
        }
        // Oldest record in .1, newest in the unsuffixed file
        let (first, _) = read_records(&dir.path().join("5_journal.log.1")).unwrap();
        let (second, _) = read_records(&dir.path().join("5_journal.log.2")).unwrap();
        let (active, _) = read_records(&journal.active_path()).unwrap();
        assert_eq!((first[0].seq, second[0].seq, active[0].seq), (1, 2, 3));

        assert_eq!(journal.prune(2).unwrap(), 2);
        assert_eq!(journal.archive_count().unwrap(), 0);
        let r = record(&journal, "b3");
        assert!(journal.log(&r).unwrap().is_none());
        assert!(journal.rotate().unwrap().ends_with("5_journal.log.3"));
    }

    #[test]
    fn test_reopen_continues_sequence_and_drops_torn_tail() {
        let dir = tempdir().unwrap();
        let path = {
            let mut journal = DmTvcOperationJournal::open(dir.path(), VOL, u64::MAX).unwrap();
            for i in 0..2 {
                let r = record(&journal, &format!("b{i}"));
                journal.log(&r).unwrap();
            }
            journal.active_path()
        };
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&JOURNAL_MAGIC.to_le_bytes()).unwrap();
        drop(file);

        let mut journal = DmTvcOperationJournal::open(dir.path(), VOL, u64::MAX).unwrap();
        assert_eq!(journal.next_seq(), 3);
        let r = record(&journal, "b2");
        journal.log(&r).unwrap().unwrap();
        assert_eq!(journal.replay(0).unwrap().len(), 3);

        let mut stale = record(&journal, "b3");
        stale.seq = 1;
        assert!(journal.log(&stale).is_err());
    }

    #[test]
    fn test_failed_write_leaves_no_bytes_behind() {
        let dir = tempdir().unwrap();
        let mut journal = DmTvcOperationJournal::open(dir.path(), VOL, u64::MAX).unwrap();
        let r = record(&journal, "b0");
        journal.log(&r).unwrap().unwrap();
        let size = journal.size();

        let r = record(&journal, "b1");
        journal.fail_next_write = true;
        assert!(matches!(journal.log(&r), Err(Error::DiskWriteFailed(_))));
        assert_eq!(journal.size(), size);
        assert_eq!(journal.next_seq(), 2);
        assert_eq!(std::fs::metadata(journal.active_path()).unwrap().len(), size);

        // The retry lands where the failed record would have
        assert_eq!(journal.log(&r).unwrap(), Some(size));
        let r = record(&journal, "b2");
        journal.log(&r).unwrap().unwrap();
        let path = journal.active_path();
        let len = journal.size();
        drop(journal);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);

        let journal = DmTvcOperationJournal::open(dir.path(), VOL, u64::MAX).unwrap();
        let seqs: Vec<_> = journal.replay(0).unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(journal.next_seq(), 4);
    }
}
