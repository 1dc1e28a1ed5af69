//! Table writers.
//!
//! A [`WalWriter`] owns one WAL directory of a table for its whole life.
//! Rows are buffered in memory, one at a time, and written to the WAL as a
//! single event on `commit`, which then takes the next transaction id from
//! the table's sequencer.
//!
//! The writer keeps its own copy of the table structure. If another writer
//! changes the structure, commits fail with a stale-structure error until
//! the writer catches up with [`WalWriter::go_active`]; buffered rows are
//! migrated to the new structure and committed afterwards.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use meridian_common::types::{
    ColumnBatch, ColumnValue, StructureChange, StructureVersion, TableStructure, TableToken,
    Timestamp, TxnId, WalId,
};
use meridian_sequencer::{SequencerError, TxnRequest};
use meridian_wal::WalAppender;

use crate::config::RetryPolicy;
use crate::error::{EngineError, EngineResult};
use crate::queue::ApplyQueue;
use crate::retry::with_retry;
use crate::table::Table;

/// Row being filled by `put`.
struct PendingRow {
    ts: Timestamp,
    values: Vec<ColumnValue>,
}

/// Writes rows of one table through its own WAL directory.
pub struct WalWriter {
    table: Arc<Table>,
    queue: Arc<ApplyQueue>,
    appender: WalAppender,
    structure: Arc<TableStructure>,
    rows: ColumnBatch,
    row: Option<PendingRow>,
    /// Version the writer was asked to reach but the table has not.
    behind: Option<StructureVersion>,
    retry: RetryPolicy,
}

impl fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalWriter")
            .field("table", &self.table.token())
            .field("wal_id", &self.appender.wal_id())
            .field("structure_version", &self.structure.version())
            .field("pending_rows", &self.rows.len())
            .finish()
    }
}

impl WalWriter {
    pub(crate) fn new(
        table: Arc<Table>,
        queue: Arc<ApplyQueue>,
        appender: WalAppender,
        retry: RetryPolicy,
    ) -> Self {
        let structure = table.sequencer().structure();
        let rows = ColumnBatch::new(structure.column_count());
        debug!(table = %table.token(), wal_id = %appender.wal_id(), "opened writer");
        Self {
            table,
            queue,
            appender,
            structure,
            rows,
            row: None,
            behind: None,
            retry,
        }
    }

    /// The table written to.
    pub fn token(&self) -> TableToken {
        self.table.token()
    }

    /// WAL directory owned by this writer.
    pub fn wal_id(&self) -> WalId {
        self.appender.wal_id()
    }

    /// Structure the writer buffers rows against.
    pub fn structure(&self) -> &Arc<TableStructure> {
        &self.structure
    }

    /// Number of buffered rows not yet committed.
    pub fn pending_rows(&self) -> usize {
        self.rows.len()
    }

    /// Starts a row at `ts`. Columns not set are null.
    pub fn new_row(&mut self, ts: Timestamp) -> EngineResult<()> {
        if self.row.is_some() {
            return Err(EngineError::RowInProgress);
        }
        self.row = Some(PendingRow {
            ts,
            values: vec![ColumnValue::Null; self.structure.column_count()],
        });
        Ok(())
    }

    /// Sets a column of the current row.
    pub fn put(&mut self, column: &str, value: impl Into<ColumnValue>) -> EngineResult<()> {
        let row = self.row.as_mut().ok_or(EngineError::NoRowInProgress)?;
        let index = self
            .structure
            .column_index(column)
            .ok_or_else(|| EngineError::UnknownColumn(column.to_string()))?;
        let column_type = self.structure.columns()[index].column_type;

        let value = value.into();
        let value = if value.matches_type(column_type) {
            value
        } else {
            let shown = value.to_string();
            value.coerce(column_type).ok_or_else(|| EngineError::InvalidValue {
                column: column.to_string(),
                column_type,
                value: shown,
            })?
        };
        row.values[index] = value;
        Ok(())
    }

    /// Adds the current row to the buffer.
    pub fn append(&mut self) -> EngineResult<()> {
        let row = self.row.take().ok_or(EngineError::NoRowInProgress)?;
        self.rows.push_row(row.ts, row.values);
        Ok(())
    }

    /// Discards the current row.
    pub fn cancel_row(&mut self) {
        self.row = None;
    }

    /// Discards every buffered row.
    pub fn rollback(&mut self) {
        self.row = None;
        self.rows = ColumnBatch::new(self.structure.column_count());
    }

    /// Writes buffered rows to the WAL and commits them.
    ///
    /// Returns `None` if nothing was buffered. On failure the rows stay
    /// buffered; after a stale-structure error call [`go_active`] and commit
    /// again.
    ///
    /// [`go_active`]: WalWriter::go_active
    pub fn commit(&mut self) -> EngineResult<Option<TxnId>> {
        if self.row.is_some() {
            return Err(EngineError::RowInProgress);
        }
        let sequencer = self.table.sequencer();
        if let Some(required) = self.behind {
            return Err(EngineError::StructureNotReached {
                required,
                current: sequencer.structure_version(),
            });
        }
        if self.rows.is_empty() {
            return Ok(None);
        }

        let version = self.structure.version();
        let current = sequencer.structure_version();
        if current != version {
            return Err(SequencerError::StaleStructure {
                requested: version,
                current,
            }
            .into());
        }

        let position = self.appender.append(version, self.rows.clone())?;
        let request = TxnRequest::data(
            position.wal_id,
            position.segment_id,
            position.segment_txn,
            version,
            position.row_lo,
            position.row_hi,
        );
        let txn = with_retry(&self.retry, "commit", || Ok(sequencer.next_txn(request)?))?;

        debug!(
            table = %self.table.token(),
            txn = %txn,
            wal_id = %position.wal_id,
            segment_id = %position.segment_id,
            rows = self.rows.len(),
            "committed"
        );
        self.rows = ColumnBatch::new(self.structure.column_count());
        self.queue.push(self.table.table_id());
        Ok(Some(txn))
    }

    /// Catches up with the table's current structure.
    pub fn go_active(&mut self) -> EngineResult<()> {
        let current = self.table.sequencer().structure_version();
        self.go_active_at(current).map(|_| ())
    }

    /// Catches up with structure version `required`. Returns false, and
    /// refuses commits, if the table has not reached it yet.
    pub fn go_active_at(&mut self, required: StructureVersion) -> EngineResult<bool> {
        let sequencer = Arc::clone(self.table.sequencer());
        if sequencer.structure_version() < required {
            self.behind = Some(required);
            return Ok(false);
        }

        let mut structure = Arc::clone(&self.structure);
        while structure.version() < required {
            let version = structure.version().next();
            let (next, change) = with_retry(&self.retry, "read structure", || {
                Ok((sequencer.structure_at(version)?, sequencer.change_at(version)?))
            })?;
            let (Some(next), Some(change)) = (next, change) else {
                return Err(SequencerError::corrupted(
                    sequencer.dir(),
                    0,
                    format!("structure version {version} missing"),
                )
                .into());
            };
            self.migrate(&structure, &change);
            structure = next;
        }

        let column_count = structure.column_count();
        self.rows.pad_columns(column_count);
        if let Some(row) = &mut self.row {
            row.values.resize(column_count, ColumnValue::Null);
        }
        if structure.version() != self.structure.version() {
            debug!(
                table = %self.table.token(),
                from = %self.structure.version(),
                to = %structure.version(),
                "writer caught up with structure"
            );
        }
        self.structure = structure;
        self.behind = None;
        Ok(true)
    }

    /// Rewrites buffered values for one structure change made on `prior`.
    fn migrate(&mut self, prior: &TableStructure, change: &StructureChange) {
        let (name, cast_to) = match change {
            StructureChange::DropColumn { name } => (name, None),
            StructureChange::ChangeColumnType { name, column_type } => (name, Some(*column_type)),
            StructureChange::AddColumn { .. } | StructureChange::RenameColumn { .. } => return,
        };
        let Some(index) = prior.column_index(name) else {
            return;
        };
        let convert = |value: &ColumnValue| match cast_to {
            Some(ty) => value.cast(ty),
            None => ColumnValue::Null,
        };
        if let Some(values) = self.rows.column_mut(index) {
            for value in values.iter_mut() {
                *value = convert(value);
            }
        }
        if let Some(value) = self.row.as_mut().and_then(|row| row.values.get_mut(index)) {
            *value = convert(value);
        }
    }

    /// Commits buffered rows, then commits `change`. Returns the change's
    /// transaction and the new structure version.
    pub fn alter(&mut self, change: StructureChange) -> EngineResult<(TxnId, StructureVersion)> {
        self.commit()?;
        let sequencer = Arc::clone(self.table.sequencer());
        let expected = self.structure.version();
        let (txn, version) = with_retry(&self.retry, "alter", || Ok(sequencer.alter(expected, &change)?))?;
        self.go_active_at(version)?;
        self.queue.push(self.table.table_id());
        info!(table = %self.table.token(), txn = %txn, version = %version, change = %change, "altered table");
        Ok((txn, version))
    }

    /// Commits buffered rows, then commits a truncate.
    pub fn truncate(&mut self) -> EngineResult<TxnId> {
        self.commit()?;
        let sequencer = Arc::clone(self.table.sequencer());
        let txn = with_retry(&self.retry, "truncate", || Ok(sequencer.truncate()?))?;
        self.queue.push(self.table.table_id());
        info!(table = %self.table.token(), txn = %txn, "truncated table");
        Ok(txn)
    }

    /// Seals the current segment and releases the WAL directory. Buffered
    /// rows are discarded.
    pub fn close(mut self) -> EngineResult<()> {
        self.appender.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Engine, EngineConfig};
    use meridian_common::types::{ColumnType, PartitionBy};
    use tempfile::TempDir;

    const HOUR: i64 = 3_600_000_000;

    fn engine(tmp: &TempDir) -> Engine {
        let config = EngineConfig::builder().sync(false).build();
        let engine = Engine::open(tmp.path(), config).unwrap();
        let structure = TableStructure::builder("ts", PartitionBy::Day)
            .column("v", ColumnType::Int)
            .build()
            .unwrap();
        engine.create_table("t", structure).unwrap();
        engine
    }

    fn row(writer: &mut WalWriter, hour: i64, v: i32) {
        writer.new_row(Timestamp::from_micros(hour * HOUR)).unwrap();
        writer.put("v", v).unwrap();
        writer.append().unwrap();
    }

    #[test]
    fn test_row_protocol() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let mut writer = engine.writer("t").unwrap();

        assert!(matches!(writer.put("v", 1), Err(EngineError::NoRowInProgress)));
        writer.new_row(Timestamp::from_micros(0)).unwrap();
        assert!(matches!(writer.new_row(Timestamp::from_micros(0)), Err(EngineError::RowInProgress)));
        assert!(matches!(writer.put("nope", 1), Err(EngineError::UnknownColumn(_))));
        assert!(matches!(writer.put("v", "text"), Err(EngineError::InvalidValue { .. })));
        assert!(matches!(writer.commit(), Err(EngineError::RowInProgress)));
        writer.cancel_row();

        assert_eq!(writer.commit().unwrap(), None);
        row(&mut writer, 0, 1);
        row(&mut writer, 1, 2);
        assert_eq!(writer.pending_rows(), 2);
        assert_eq!(writer.commit().unwrap(), Some(TxnId::new(1)));
        assert_eq!(writer.pending_rows(), 0);

        row(&mut writer, 2, 3);
        writer.rollback();
        assert_eq!(writer.commit().unwrap(), None);
    }

    #[test]
    fn test_stale_writer_catches_up() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let mut w1 = engine.writer("t").unwrap();
        let mut w2 = engine.writer("t").unwrap();
        assert_ne!(w1.wal_id(), w2.wal_id());

        row(&mut w2, 0, 7);
        w1.alter(StructureChange::AddColumn {
            name: "extra".into(),
            column_type: ColumnType::Long,
        })
        .unwrap();

        let err = w2.commit().unwrap_err();
        assert!(err.is_stale_structure());
        assert_eq!(w2.pending_rows(), 1);

        w2.go_active().unwrap();
        assert_eq!(w2.structure().column_count(), 2);
        assert_eq!(w2.commit().unwrap(), Some(TxnId::new(2)));
    }

    #[test]
    fn test_migration_casts_and_drops() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let mut w1 = engine.writer("t").unwrap();
        let mut w2 = engine.writer("t").unwrap();

        row(&mut w2, 0, 5);
        w1.alter(StructureChange::ChangeColumnType {
            name: "v".into(),
            column_type: ColumnType::Long,
        })
        .unwrap();
        w2.go_active().unwrap();
        assert_eq!(w2.rows.column(0).unwrap(), &[ColumnValue::Long(5)]);

        w1.go_active().unwrap();
        w1.alter(StructureChange::DropColumn { name: "v".into() }).unwrap();
        w2.go_active().unwrap();
        assert_eq!(w2.rows.column(0).unwrap(), &[ColumnValue::Null]);
        w2.new_row(Timestamp::from_micros(0)).unwrap();
        assert!(matches!(w2.put("v", 1), Err(EngineError::UnknownColumn(_))));
    }

    #[test]
    fn test_go_active_at_future_version() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let mut writer = engine.writer("t").unwrap();

        assert!(!writer.go_active_at(StructureVersion::new(3)).unwrap());
        row(&mut writer, 0, 1);
        assert!(matches!(writer.commit(), Err(EngineError::StructureNotReached { .. })));

        assert!(writer.go_active_at(StructureVersion::INITIAL).unwrap());
        assert_eq!(writer.commit().unwrap(), Some(TxnId::new(1)));
    }

    #[test]
    fn test_dropped_table_rejects_commits() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let mut writer = engine.writer("t").unwrap();
        engine.drop_table("t").unwrap();

        row(&mut writer, 0, 1);
        let err = writer.commit().unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(writer.pending_rows(), 1);
    }
}
