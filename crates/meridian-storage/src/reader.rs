//! Snapshot readers.

use std::sync::Arc;

use meridian_common::types::{ColumnBatch, ColumnValue, PartitionKey, TableStructure, Timestamp, TxnId};

use crate::error::StorageResult;
use crate::partition::VersionRef;
use crate::table::{TableSnapshot, TableStorage};
use crate::tracker::VersionPin;

/// One row as seen by a reader: the designated timestamp and the values of
/// the visible columns.
pub type Row = (Timestamp, Vec<ColumnValue>);

/// A reader pinned to one snapshot of a table.
///
/// The partition versions of the snapshot stay on disk until the reader is
/// dropped or reloaded. Rows published after the reader was opened are not
/// visible, even if they were appended to a version it pins.
#[derive(Debug)]
pub struct TableReader {
    storage: Arc<TableStorage>,
    snapshot: Arc<TableSnapshot>,
    _pin: VersionPin,
}

impl TableReader {
    pub(crate) fn new(storage: Arc<TableStorage>, snapshot: Arc<TableSnapshot>, pin: VersionPin) -> Self {
        Self {
            storage,
            snapshot,
            _pin: pin,
        }
    }

    /// Re-pins the latest snapshot. Returns true if it changed.
    pub fn reload(&mut self) -> bool {
        let (snapshot, pin) = self.storage.pin_current();
        let changed = !Arc::ptr_eq(&snapshot, &self.snapshot);
        // The new pin is taken before the old one is released.
        self.snapshot = snapshot;
        self._pin = pin;
        changed
    }

    /// Applied watermark of the snapshot.
    pub fn applied_txn(&self) -> TxnId {
        self.snapshot.applied_txn()
    }

    /// Structure of the snapshot.
    pub fn structure(&self) -> &Arc<TableStructure> {
        self.snapshot.structure()
    }

    /// The pinned snapshot.
    pub fn snapshot(&self) -> &Arc<TableSnapshot> {
        &self.snapshot
    }

    /// Partition keys in time order.
    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        self.snapshot.partitions().map(|p| p.key).collect()
    }

    /// Total number of rows.
    pub fn row_count(&self) -> u64 {
        self.snapshot.row_count()
    }

    /// Names of the visible columns, in column order.
    pub fn column_names(&self) -> Vec<String> {
        self.structure()
            .visible_columns()
            .map(|(_, meta)| meta.name.clone())
            .collect()
    }

    /// Reads every stored column of partition `key`, dropped ones included.
    pub fn read_partition(&self, key: PartitionKey) -> StorageResult<ColumnBatch> {
        let column_count = self.structure().column_count();
        match self.snapshot.partition(key) {
            Some(entry) => self.storage.store().read_rows(
                VersionRef::new(entry.key, entry.version),
                0,
                entry.rows,
                column_count,
            ),
            None => Ok(ColumnBatch::new(column_count)),
        }
    }

    /// Reads all rows in time order, visible columns only.
    pub fn rows(&self) -> StorageResult<Vec<Row>> {
        let visible: Vec<usize> = self.structure().visible_columns().map(|(i, _)| i).collect();
        let mut out = Vec::with_capacity(self.row_count() as usize);
        for key in self.partition_keys() {
            let batch = self.read_partition(key)?;
            for (ts, values) in batch.rows() {
                out.push((ts, visible.iter().map(|&i| values[i].clone()).collect()));
            }
        }
        Ok(out)
    }
}
