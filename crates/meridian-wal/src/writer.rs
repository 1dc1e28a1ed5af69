//! WAL appender for one writer session.
//!
//! This module provides the writer component that handles:
//! - Appending data events to the writer's current segment
//! - Rolling over to a new segment on size or row thresholds
//! - Sealing the last segment and releasing the wal id on close

use std::sync::Arc;

use tracing::{debug, warn};

use meridian_common::types::{ColumnBatch, SegmentId, StructureVersion, WalId};

use crate::error::{WalError, WalResult};
use crate::segment::WalSegment;
use crate::store::WalSegmentStore;

/// Where a data event landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPosition {
    /// Writer directory.
    pub wal_id: WalId,
    /// Segment.
    pub segment_id: SegmentId,
    /// Index of the data event within the segment.
    pub segment_txn: u64,
    /// First row (segment-relative).
    pub row_lo: u64,
    /// One past the last row.
    pub row_hi: u64,
}

/// WAL appender statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    /// Total data events written.
    pub events_written: u64,
    /// Total rows written.
    pub rows_written: u64,
    /// Number of segment rollovers.
    pub segment_rollovers: u64,
}

/// Appends data events to the segments of one wal id.
pub struct WalAppender {
    /// Owning store.
    store: Arc<WalSegmentStore>,
    /// Wal id owned by this appender.
    wal_id: WalId,
    /// Current segment, created lazily.
    segment: Option<WalSegment>,
    /// Next segment id.
    next_segment_id: SegmentId,
    /// Forces a rollover before the next append (after a failed append).
    roll_pending: bool,
    /// Appender statistics.
    stats: WriterStats,
    /// Whether the appender is closed.
    closed: bool,
}

impl WalAppender {
    pub(crate) fn new(store: Arc<WalSegmentStore>, wal_id: WalId) -> Self {
        Self {
            store,
            wal_id,
            segment: None,
            next_segment_id: SegmentId::new(0),
            roll_pending: false,
            stats: WriterStats::default(),
            closed: false,
        }
    }

    /// Returns the wal id owned by this appender.
    pub fn wal_id(&self) -> WalId {
        self.wal_id
    }

    /// Returns the current segment id, if a segment is open.
    pub fn current_segment_id(&self) -> Option<SegmentId> {
        self.segment.as_ref().map(WalSegment::segment_id)
    }

    /// Appends `rows` as one data event.
    pub fn append(&mut self, structure_version: StructureVersion, rows: ColumnBatch) -> WalResult<SegmentPosition> {
        if self.closed {
            return Err(WalError::Closed);
        }

        let needs_roll = match &self.segment {
            None => true,
            Some(segment) => self.roll_pending || segment.needs_rollover(self.store.config()),
        };
        if needs_roll {
            self.rotate_segment()?;
        }

        let segment = self.segment.as_ref().ok_or(WalError::Closed)?;
        let row_count = rows.len() as u64;
        match segment.append_data(structure_version, rows, self.store.config()) {
            Ok(appended) => {
                self.stats.events_written += 1;
                self.stats.rows_written += row_count;
                Ok(SegmentPosition {
                    wal_id: self.wal_id,
                    segment_id: segment.segment_id(),
                    segment_txn: appended.segment_txn,
                    row_lo: appended.row_lo,
                    row_hi: appended.row_hi,
                })
            }
            Err(err) => {
                if !matches!(err, WalError::EventTooLarge { .. }) {
                    self.roll_pending = true;
                }
                Err(err)
            }
        }
    }

    /// Seals the current segment (if any) and opens the next one.
    pub fn rotate_segment(&mut self) -> WalResult<SegmentId> {
        self.seal_current()?;

        let segment_id = self.next_segment_id;
        let dir = self.store.segment_dir(self.wal_id, segment_id);
        // Registered before the directory exists, so the purge job never
        // sees the new segment as inactive.
        self.store.register_segment(self.wal_id, segment_id);
        let segment = match WalSegment::create(dir, self.store.table_id(), self.wal_id, segment_id) {
            Ok(segment) => segment,
            Err(err) => {
                self.store.unregister_segment(self.wal_id, segment_id);
                return Err(err);
            }
        };

        if segment_id.get() > 0 {
            self.stats.segment_rollovers += 1;
        }
        self.next_segment_id = segment_id.next();
        self.segment = Some(segment);
        self.roll_pending = false;
        debug!(table_id = %self.store.table_id(), wal_id = %self.wal_id, %segment_id, "opened wal segment");
        Ok(segment_id)
    }

    fn seal_current(&mut self) -> WalResult<()> {
        if let Some(segment) = self.segment.take() {
            let result = segment.seal();
            // A segment that failed to seal is still complete up to its last
            // data event; readers tolerate the missing seal.
            self.store.unregister_segment(self.wal_id, segment.segment_id());
            result?;
        }
        Ok(())
    }

    /// Seals the current segment and releases the wal id.
    pub fn close(&mut self) -> WalResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.seal_current();
        self.store.release_wal(self.wal_id);
        result
    }

    /// Returns true if the appender is closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns appender statistics.
    pub fn stats(&self) -> WriterStats {
        self.stats
    }
}

impl Drop for WalAppender {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(wal_id = %self.wal_id, error = %err, "failed to seal wal segment on close");
        }
    }
}

impl std::fmt::Debug for WalAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalAppender")
            .field("wal_id", &self.wal_id)
            .field("segment", &self.current_segment_id())
            .field("closed", &self.closed)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use meridian_common::types::{ColumnValue, TableId, Timestamp};
    use tempfile::TempDir;

    fn rows(n: usize) -> ColumnBatch {
        let mut batch = ColumnBatch::new(1);
        for i in 0..n {
            batch.push_row(Timestamp::from_micros(i as i64), [ColumnValue::Long(i as i64)]);
        }
        batch
    }

    fn store(tmp: &TempDir, config: WalConfig) -> Arc<WalSegmentStore> {
        Arc::new(WalSegmentStore::open(tmp.path(), TableId::new(1), Arc::new(config)).unwrap())
    }

    #[test]
    fn test_append_positions() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, WalConfig::default());
        let mut appender = store.acquire_appender().unwrap();

        let a = appender.append(StructureVersion::INITIAL, rows(2)).unwrap();
        let b = appender.append(StructureVersion::INITIAL, rows(3)).unwrap();
        assert_eq!((a.segment_id, a.segment_txn, a.row_lo, a.row_hi), (SegmentId::new(0), 0, 0, 2));
        assert_eq!((b.segment_id, b.segment_txn, b.row_lo, b.row_hi), (SegmentId::new(0), 1, 2, 5));
        assert_eq!(appender.stats().rows_written, 5);
    }

    #[test]
    fn test_rollover_on_rows() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, WalConfig::default().with_segment_rollover_rows(3));
        let mut appender = store.acquire_appender().unwrap();

        let a = appender.append(StructureVersion::INITIAL, rows(3)).unwrap();
        let b = appender.append(StructureVersion::INITIAL, rows(1)).unwrap();
        assert_eq!(a.segment_id, SegmentId::new(0));
        assert_eq!(b.segment_id, SegmentId::new(1));
        assert_eq!(b.segment_txn, 0);
        assert_eq!(appender.stats().segment_rollovers, 1);

        assert!(!store.is_segment_active(a.wal_id, a.segment_id));
        assert!(store.is_segment_active(b.wal_id, b.segment_id));
        assert!(store.open_reader(a.wal_id, a.segment_id).unwrap().is_sealed());
    }

    #[test]
    fn test_close_seals_and_releases() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, WalConfig::default());
        let mut appender = store.acquire_appender().unwrap();
        let pos = appender.append(StructureVersion::INITIAL, rows(1)).unwrap();

        appender.close().unwrap();
        assert!(appender.is_closed());
        assert!(!store.is_wal_active(pos.wal_id));
        assert!(store.open_reader(pos.wal_id, pos.segment_id).unwrap().is_sealed());
        assert!(matches!(
            appender.append(StructureVersion::INITIAL, rows(1)),
            Err(WalError::Closed)
        ));
    }

    #[test]
    fn test_failed_segment_create_is_not_left_active() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, WalConfig::default());
        let mut appender = store.acquire_appender().unwrap();
        let wal_id = appender.wal_id();

        // A plain file in place of the wal directory makes the create fail.
        std::fs::remove_dir(store.wal_dir(wal_id)).unwrap();
        std::fs::write(store.wal_dir(wal_id), b"").unwrap();

        assert!(appender.append(StructureVersion::INITIAL, rows(1)).is_err());
        assert!(!store.is_segment_active(wal_id, SegmentId::new(0)));
        assert!(appender.current_segment_id().is_none());
    }
}
