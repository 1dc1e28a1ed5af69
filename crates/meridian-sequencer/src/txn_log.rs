//! The sequencer commit log (`txn_seq/_txnlog`).
//!
//! A 16-byte header (magic, format version, reserved) followed by fixed-size
//! [`TxnRecord`]s, the record of txn `n` at offset `16 + (n - 1) * 64`.
//! Appends are all-or-nothing: a failed write or sync cuts the file back to
//! its previous length. A torn last record found at open is cut off.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use meridian_common::constants::{FORMAT_VERSION, TXN_LOG_MAGIC};
use meridian_common::types::TxnId;

use crate::error::{SequencerError, SequencerResult};
use crate::record::TxnRecord;

/// Size of the commit log header.
pub const TXN_LOG_HEADER_SIZE: u64 = 16;

/// Append-only commit log. Not synchronized; the sequencer serializes access.
#[derive(Debug)]
pub struct TxnLog {
    path: PathBuf,
    file: File,
    /// Number of records.
    count: u64,
    sync: bool,
    #[cfg(test)]
    fail_next_append: bool,
}

impl TxnLog {
    /// Creates an empty log. Fails if the file exists.
    pub fn create(path: impl AsRef<Path>, sync: bool) -> SequencerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut header = [0u8; TXN_LOG_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&TXN_LOG_MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(Self {
            path,
            file,
            count: 0,
            sync,
            #[cfg(test)]
            fail_next_append: false,
        })
    }

    /// Opens an existing log, validating the header and cutting off a torn
    /// last record.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> SequencerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; TXN_LOG_HEADER_SIZE as usize];
        file.read_exact(&mut header)
            .map_err(|_| SequencerError::corrupted(&path, 0, "commit log header truncated"))?;
        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != TXN_LOG_MAGIC {
            return Err(SequencerError::InvalidMagic {
                path,
                expected: TXN_LOG_MAGIC,
                found: magic,
            });
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != FORMAT_VERSION {
            return Err(SequencerError::UnsupportedVersion { path, found: version });
        }

        let len = file.metadata()?.len();
        let body = len.saturating_sub(TXN_LOG_HEADER_SIZE);
        let mut count = body / TxnRecord::SIZE as u64;
        let mut valid_len = TXN_LOG_HEADER_SIZE + count * TxnRecord::SIZE as u64;

        let mut log = Self {
            path,
            file,
            count,
            sync,
            #[cfg(test)]
            fail_next_append: false,
        };

        // The last complete record may itself be torn (written but not synced).
        if count > 0 {
            let last = TxnId::new(count);
            let intact = matches!(log.read_record(last)?, Some(r) if r.txn == last);
            if !intact {
                count -= 1;
                valid_len -= TxnRecord::SIZE as u64;
                log.count = count;
            }
        }

        if valid_len != len {
            warn!(
                path = %log.path.display(),
                len,
                valid_len,
                "cutting torn tail of commit log"
            );
            log.file.set_len(valid_len)?;
            log.file.sync_all()?;
        }

        Ok(log)
    }

    fn offset_of(txn: TxnId) -> u64 {
        TXN_LOG_HEADER_SIZE + (txn.get() - 1) * TxnRecord::SIZE as u64
    }

    /// Number of records, which is also the last txn id.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Last assigned txn, [`TxnId::NONE`] if empty.
    pub fn last_txn(&self) -> TxnId {
        TxnId::new(self.count)
    }

    /// Appends `record`, whose txn must be `last_txn() + 1`.
    pub fn append(&mut self, record: &TxnRecord) -> SequencerResult<()> {
        debug_assert_eq!(record.txn, self.last_txn().next());
        let offset = Self::offset_of(record.txn);

        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_append) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected commit log failure").into());
        }

        let result = self
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&record.to_bytes()))
            .and_then(|()| if self.sync { self.file.sync_data() } else { Ok(()) });

        if let Err(err) = result {
            // Best effort: the record is not counted either way.
            let _ = self.file.set_len(offset);
            return Err(err.into());
        }
        self.count += 1;
        Ok(())
    }

    /// Reads the record of `txn`. Returns `Ok(None)` for txns past the end
    /// and for records whose checksum does not match.
    fn read_record(&mut self, txn: TxnId) -> SequencerResult<Option<TxnRecord>> {
        if txn == TxnId::NONE || txn.get() > self.count {
            return Ok(None);
        }
        let mut bytes = [0u8; TxnRecord::SIZE];
        self.file.seek(SeekFrom::Start(Self::offset_of(txn)))?;
        self.file.read_exact(&mut bytes)?;
        Ok(TxnRecord::from_bytes(&bytes))
    }

    /// Reads up to `limit` records starting at `from`.
    pub fn read(&mut self, from: TxnId, limit: usize) -> SequencerResult<Vec<TxnRecord>> {
        let from = from.get().max(1);
        if from > self.count || limit == 0 {
            return Ok(Vec::new());
        }
        let n = (self.count - from + 1).min(limit as u64) as usize;
        let mut bytes = vec![0u8; n * TxnRecord::SIZE];
        self.file.seek(SeekFrom::Start(Self::offset_of(TxnId::new(from))))?;
        self.file.read_exact(&mut bytes)?;

        let mut records = Vec::with_capacity(n);
        for (i, chunk) in bytes.chunks_exact(TxnRecord::SIZE).enumerate() {
            let expected = TxnId::new(from + i as u64);
            let offset = Self::offset_of(expected);
            let chunk: &[u8; TxnRecord::SIZE] = chunk
                .try_into()
                .map_err(|_| SequencerError::corrupted(&self.path, offset, "short record"))?;
            let record = TxnRecord::from_bytes(chunk)
                .ok_or_else(|| SequencerError::corrupted(&self.path, offset, "record checksum mismatch"))?;
            if record.txn != expected {
                return Err(SequencerError::corrupted(
                    &self.path,
                    offset,
                    format!("expected txn {expected}, found {}", record.txn),
                ));
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Returns the path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn fail_next_append(&mut self) {
        self.fail_next_append = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TxnFlags;
    use meridian_common::types::{SegmentId, StructureVersion, Timestamp, WalId};
    use tempfile::TempDir;

    fn record(txn: u64) -> TxnRecord {
        TxnRecord {
            txn: TxnId::new(txn),
            structure_version: StructureVersion::INITIAL,
            wal_id: WalId::new(1),
            segment_id: SegmentId::new(0),
            segment_txn: txn - 1,
            row_lo: 0,
            row_hi: 1,
            commit_ts: Timestamp::from_micros(txn as i64),
            flags: TxnFlags::empty(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_txnlog");
        let mut log = TxnLog::create(&path, true).unwrap();
        for txn in 1..=5 {
            log.append(&record(txn)).unwrap();
        }
        assert_eq!(log.last_txn(), TxnId::new(5));

        let records = log.read(TxnId::new(2), 2).unwrap();
        assert_eq!(records, vec![record(2), record(3)]);
        assert!(log.read(TxnId::new(6), 10).unwrap().is_empty());
        assert_eq!(log.read(TxnId::NONE, 100).unwrap().len(), 5);
    }

    #[test]
    fn test_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_txnlog");
        {
            let mut log = TxnLog::create(&path, false).unwrap();
            log.append(&record(1)).unwrap();
            log.append(&record(2)).unwrap();
        }
        let log = TxnLog::open(&path, false).unwrap();
        assert_eq!(log.last_txn(), TxnId::new(2));
        assert!(TxnLog::create(&path, false).is_err());
    }

    #[test]
    fn test_torn_tail_is_cut() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_txnlog");
        {
            let mut log = TxnLog::create(&path, false).unwrap();
            log.append(&record(1)).unwrap();
            log.append(&record(2)).unwrap();
        }
        // Half a record.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&record(3).to_bytes()[..30]).unwrap();
        drop(file);

        let mut log = TxnLog::open(&path, false).unwrap();
        assert_eq!(log.last_txn(), TxnId::new(2));
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            TXN_LOG_HEADER_SIZE + 2 * TxnRecord::SIZE as u64
        );
        log.append(&record(3)).unwrap();
        assert_eq!(log.read(TxnId::new(3), 1).unwrap(), vec![record(3)]);
    }

    #[test]
    fn test_damaged_last_record_is_cut() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_txnlog");
        {
            let mut log = TxnLog::create(&path, false).unwrap();
            log.append(&record(1)).unwrap();
            log.append(&record(2)).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 10;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let log = TxnLog::open(&path, false).unwrap();
        assert_eq!(log.last_txn(), TxnId::new(1));
    }

    #[test]
    fn test_failed_append_leaves_log_unchanged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_txnlog");
        let mut log = TxnLog::create(&path, false).unwrap();
        log.append(&record(1)).unwrap();

        log.fail_next_append();
        assert!(log.append(&record(2)).is_err());
        assert_eq!(log.last_txn(), TxnId::new(1));

        log.append(&record(2)).unwrap();
        assert_eq!(log.read(TxnId::FIRST, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_bad_magic() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_txnlog");
        std::fs::write(&path, [0u8; 16]).unwrap();
        assert!(matches!(
            TxnLog::open(&path, false),
            Err(SequencerError::InvalidMagic { .. })
        ));
    }
}
