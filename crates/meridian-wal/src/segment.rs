//! WAL segment files.
//!
//! A segment is the `events.wal` file in `wal<N>/<S>/`. It is written by
//! exactly one writer and read by the apply engine once commits reference
//! it. Every append either lands completely or the file is cut back to its
//! previous length.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use meridian_common::constants::WAL_EVENTS_FILE;
use meridian_common::types::{ColumnBatch, SegmentId, StructureVersion, TableId, WalId};

use crate::config::WalConfig;
use crate::error::{WalError, WalResult};
use crate::record::payload::{DataPayload, SealPayload, SegmentHeaderPayload};
use crate::record::types::WalEvent;

/// Segment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Segment is open for writing.
    Active,
    /// Segment is sealed (no more writes).
    Sealed,
}

/// Position of an appended data event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedEvent {
    /// Index of the data event within the segment.
    pub segment_txn: u64,
    /// First row (segment-relative).
    pub row_lo: u64,
    /// One past the last row.
    pub row_hi: u64,
}

/// A single WAL segment file open for writing.
pub struct WalSegment {
    /// Owning table.
    table_id: TableId,
    /// Writer directory.
    wal_id: WalId,
    /// Segment ID.
    segment_id: SegmentId,
    /// Path to the events file.
    path: PathBuf,
    /// File handle.
    file: Mutex<File>,
    /// Current write position.
    write_pos: AtomicU64,
    /// Data events written.
    event_count: AtomicU64,
    /// Rows written.
    row_count: AtomicU64,
    /// Segment state.
    state: RwLock<SegmentState>,
}

impl WalSegment {
    /// Creates the segment directory and file and writes the header event.
    pub fn create(
        segment_dir: impl AsRef<Path>,
        table_id: TableId,
        wal_id: WalId,
        segment_id: SegmentId,
    ) -> WalResult<Self> {
        let dir = segment_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(WAL_EVENTS_FILE);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let segment = Self {
            table_id,
            wal_id,
            segment_id,
            path,
            file: Mutex::new(file),
            write_pos: AtomicU64::new(0),
            event_count: AtomicU64::new(0),
            row_count: AtomicU64::new(0),
            state: RwLock::new(SegmentState::Active),
        };

        let header = WalEvent::SegmentHeader(SegmentHeaderPayload::new(table_id, wal_id, segment_id));
        segment.write_event(&header.serialize()?)?;
        segment.sync()?;

        Ok(segment)
    }

    /// Writes raw event bytes at the end of the file. On failure the file is
    /// cut back so no partial event remains.
    fn write_event(&self, bytes: &[u8]) -> WalResult<()> {
        let mut file = self.file.lock();
        let pos = self.write_pos.load(Ordering::Acquire);

        let result = file
            .seek(SeekFrom::Start(pos))
            .and_then(|_| file.write_all(bytes));
        if let Err(err) = result {
            // Best effort: the event is not counted either way.
            let _ = file.set_len(pos);
            return Err(err.into());
        }

        self.write_pos.store(pos + bytes.len() as u64, Ordering::Release);
        Ok(())
    }

    fn truncate_to(&self, pos: u64) {
        let file = self.file.lock();
        let _ = file.set_len(pos);
        self.write_pos.store(pos, Ordering::Release);
    }

    /// Appends one data event holding `rows`.
    pub fn append_data(
        &self,
        structure_version: StructureVersion,
        rows: ColumnBatch,
        config: &WalConfig,
    ) -> WalResult<AppendedEvent> {
        if !self.is_active() {
            return Err(WalError::SegmentSealed {
                wal_id: self.wal_id,
                segment_id: self.segment_id,
            });
        }

        let segment_txn = self.event_count.load(Ordering::Acquire);
        let row_lo = self.row_count.load(Ordering::Acquire);
        let payload = DataPayload::new(segment_txn, structure_version, row_lo, rows);
        let row_hi = payload.row_hi;

        let bytes = WalEvent::Data(payload).serialize()?;
        if bytes.len() > config.max_event_size {
            return Err(WalError::event_too_large(bytes.len(), config.max_event_size));
        }

        let pos = self.write_position();
        self.write_event(&bytes)?;
        if config.commit_mode.is_sync() {
            if let Err(err) = self.sync() {
                self.truncate_to(pos);
                return Err(err);
            }
        }

        self.event_count.store(segment_txn + 1, Ordering::Release);
        self.row_count.store(row_hi, Ordering::Release);

        Ok(AppendedEvent {
            segment_txn,
            row_lo,
            row_hi,
        })
    }

    /// Seals the segment: writes the seal event and syncs. Sealing twice is
    /// a no-op.
    pub fn seal(&self) -> WalResult<()> {
        let mut state = self.state.write();
        if *state == SegmentState::Sealed {
            return Ok(());
        }
        let seal = WalEvent::Seal(SealPayload {
            event_count: self.event_count(),
            row_count: self.row_count(),
        });
        self.write_event(&seal.serialize()?)?;
        self.sync()?;
        *state = SegmentState::Sealed;
        Ok(())
    }

    /// Syncs the segment to disk.
    pub fn sync(&self) -> WalResult<()> {
        let file = self.file.lock();
        file.sync_data()?;
        Ok(())
    }

    /// Returns the table ID.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Returns the wal ID.
    pub fn wal_id(&self) -> WalId {
        self.wal_id
    }

    /// Returns the segment ID.
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Returns the current write position (file size).
    pub fn write_position(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Returns the number of data events written.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Acquire)
    }

    /// Returns the number of rows written.
    pub fn row_count(&self) -> u64 {
        self.row_count.load(Ordering::Acquire)
    }

    /// Returns true if the segment should roll over before the next append.
    pub fn needs_rollover(&self, config: &WalConfig) -> bool {
        self.write_position() >= config.segment_rollover_bytes
            || self.row_count() >= config.segment_rollover_rows
    }

    /// Returns true if this segment is active (accepting writes).
    pub fn is_active(&self) -> bool {
        *self.state.read() == SegmentState::Active
    }

    /// Returns the segment state.
    pub fn state(&self) -> SegmentState {
        *self.state.read()
    }

    /// Returns the path to the events file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for WalSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalSegment")
            .field("table_id", &self.table_id)
            .field("wal_id", &self.wal_id)
            .field("segment_id", &self.segment_id)
            .field("path", &self.path)
            .field("write_pos", &self.write_position())
            .field("event_count", &self.event_count())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::types::{ColumnValue, Timestamp};
    use tempfile::TempDir;

    fn rows(n: usize) -> ColumnBatch {
        let mut batch = ColumnBatch::new(1);
        for i in 0..n {
            batch.push_row(Timestamp::from_micros(i as i64), [ColumnValue::Long(i as i64)]);
        }
        batch
    }

    fn create(tmp: &TempDir) -> WalSegment {
        WalSegment::create(
            tmp.path().join("wal1").join("0"),
            TableId::new(1),
            WalId::new(1),
            SegmentId::new(0),
        )
        .unwrap()
    }

    #[test]
    fn test_create_segment() {
        let tmp = TempDir::new().unwrap();
        let segment = create(&tmp);

        assert_eq!(segment.segment_id(), SegmentId::new(0));
        assert!(segment.is_active());
        assert!(segment.write_position() > 0);
        assert!(segment.path().exists());
    }

    #[test]
    fn test_append_data() {
        let tmp = TempDir::new().unwrap();
        let segment = create(&tmp);
        let config = WalConfig::default();

        let first = segment.append_data(StructureVersion::INITIAL, rows(3), &config).unwrap();
        assert_eq!(first, AppendedEvent { segment_txn: 0, row_lo: 0, row_hi: 3 });

        let second = segment.append_data(StructureVersion::INITIAL, rows(2), &config).unwrap();
        assert_eq!(second, AppendedEvent { segment_txn: 1, row_lo: 3, row_hi: 5 });
        assert_eq!(segment.row_count(), 5);
        assert_eq!(
            std::fs::metadata(segment.path()).unwrap().len(),
            segment.write_position()
        );
    }

    #[test]
    fn test_event_too_large() {
        let tmp = TempDir::new().unwrap();
        let segment = create(&tmp);
        let config = WalConfig::default().with_max_event_size(1024);
        let before = segment.write_position();

        let err = segment.append_data(StructureVersion::INITIAL, rows(200), &config).unwrap_err();
        assert!(matches!(err, WalError::EventTooLarge { .. }));
        assert_eq!(segment.write_position(), before);
        assert_eq!(segment.event_count(), 0);
    }

    #[test]
    fn test_seal_segment() {
        let tmp = TempDir::new().unwrap();
        let segment = create(&tmp);
        segment.seal().unwrap();
        assert_eq!(segment.state(), SegmentState::Sealed);
        segment.seal().unwrap();

        let err = segment
            .append_data(StructureVersion::INITIAL, rows(1), &WalConfig::default())
            .unwrap_err();
        assert!(matches!(err, WalError::SegmentSealed { .. }));
    }

    #[test]
    fn test_needs_rollover() {
        let tmp = TempDir::new().unwrap();
        let segment = create(&tmp);
        let config = WalConfig::default().with_segment_rollover_rows(4);

        segment.append_data(StructureVersion::INITIAL, rows(3), &config).unwrap();
        assert!(!segment.needs_rollover(&config));
        segment.append_data(StructureVersion::INITIAL, rows(1), &config).unwrap();
        assert!(segment.needs_rollover(&config));
    }
}
