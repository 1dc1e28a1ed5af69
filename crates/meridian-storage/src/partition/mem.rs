//! In-memory partition store with fault injection.

use std::collections::BTreeMap;
use std::io;

use parking_lot::Mutex;

use meridian_common::types::{ColumnBatch, ColumnValue};

use super::{PartitionStore, VersionRef};
use crate::error::{StorageError, StorageResult};

/// Store operations a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Create,
    Append,
    Sync,
    Read,
    Remove,
}

#[derive(Debug)]
struct Fault {
    op: FaultOp,
    remaining: u32,
    kind: io::ErrorKind,
}

#[derive(Debug, Default)]
struct MemVersion {
    batch: ColumnBatch,
    synced_rows: u64,
}

/// Partition store keeping versions in memory.
///
/// Survives a simulated restart as long as the same instance is handed to
/// the reopened table.
#[derive(Debug, Default)]
pub struct MemPartitionStore {
    versions: Mutex<BTreeMap<VersionRef, MemVersion>>,
    faults: Mutex<Vec<Fault>>,
}

impl MemPartitionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls of `op` fail with an I/O error of `kind`.
    pub fn inject_fault(&self, op: FaultOp, count: u32, kind: io::ErrorKind) {
        self.faults.lock().push(Fault {
            op,
            remaining: count,
            kind,
        });
    }

    /// Removes all pending faults.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Number of rows stored in `version`, committed or not.
    pub fn stored_rows(&self, version: VersionRef) -> Option<u64> {
        self.versions.lock().get(&version).map(|v| v.batch.len() as u64)
    }

    /// Number of rows made durable in `version`.
    pub fn synced_rows(&self, version: VersionRef) -> Option<u64> {
        self.versions.lock().get(&version).map(|v| v.synced_rows)
    }

    fn check_fault(&self, op: FaultOp) -> StorageResult<()> {
        let mut faults = self.faults.lock();
        if let Some(index) = faults.iter().position(|f| f.op == op) {
            let kind = faults[index].kind;
            if faults[index].remaining <= 1 {
                faults.remove(index);
            } else {
                faults[index].remaining -= 1;
            }
            return Err(io::Error::new(kind, format!("injected {op:?} fault")).into());
        }
        Ok(())
    }
}

impl PartitionStore for MemPartitionStore {
    fn create_version(&self, version: VersionRef) -> StorageResult<()> {
        self.check_fault(FaultOp::Create)?;
        let mut versions = self.versions.lock();
        if versions.contains_key(&version) {
            return Err(StorageError::VersionExists(version));
        }
        versions.insert(version, MemVersion::default());
        Ok(())
    }

    fn append_rows(&self, version: VersionRef, committed_rows: u64, rows: &ColumnBatch) -> StorageResult<()> {
        self.check_fault(FaultOp::Append)?;
        let mut versions = self.versions.lock();
        let stored = versions
            .get_mut(&version)
            .ok_or(StorageError::VersionNotFound(version))?;
        let len = stored.batch.len() as u64;
        if len < committed_rows {
            return Err(StorageError::MissingRows {
                version,
                stored: len,
                expected: committed_rows,
            });
        }
        let mut kept = stored.batch.slice(0, committed_rows as usize);
        kept.extend(rows);
        stored.batch = kept;
        stored.synced_rows = stored.synced_rows.min(committed_rows);
        Ok(())
    }

    fn sync_version(&self, version: VersionRef) -> StorageResult<()> {
        self.check_fault(FaultOp::Sync)?;
        let mut versions = self.versions.lock();
        let stored = versions
            .get_mut(&version)
            .ok_or(StorageError::VersionNotFound(version))?;
        stored.synced_rows = stored.batch.len() as u64;
        Ok(())
    }

    fn read_rows(&self, version: VersionRef, lo: u64, hi: u64, column_count: usize) -> StorageResult<ColumnBatch> {
        self.check_fault(FaultOp::Read)?;
        let versions = self.versions.lock();
        let stored = versions.get(&version).ok_or(StorageError::VersionNotFound(version))?;
        let len = stored.batch.len() as u64;
        if len < hi {
            return Err(StorageError::MissingRows {
                version,
                stored: len,
                expected: hi,
            });
        }
        let mut rows = stored.batch.slice(lo as usize, hi as usize);
        rows.pad_columns(column_count);
        if rows.column_count() > column_count {
            let timestamps = rows.timestamps().to_vec();
            let columns = (0..column_count)
                .map(|i| rows.column(i).map(<[ColumnValue]>::to_vec).unwrap_or_default())
                .collect();
            rows = ColumnBatch::from_columns(timestamps, columns)
                .ok_or_else(|| StorageError::corrupted("<memory>", "column lengths differ"))?;
        }
        Ok(rows)
    }

    fn remove_version(&self, version: VersionRef) -> StorageResult<()> {
        self.check_fault(FaultOp::Remove)?;
        self.versions.lock().remove(&version);
        Ok(())
    }

    fn list_versions(&self) -> StorageResult<Vec<VersionRef>> {
        Ok(self.versions.lock().keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::types::{PartitionKey, Timestamp};

    fn batch(values: &[i32]) -> ColumnBatch {
        let mut batch = ColumnBatch::new(1);
        for (i, &v) in values.iter().enumerate() {
            batch.push_row(Timestamp::from_micros(i as i64), [ColumnValue::Int(v)]);
        }
        batch
    }

    #[test]
    fn test_append_discards_uncommitted_rows() {
        let store = MemPartitionStore::new();
        let v = VersionRef::new(PartitionKey::new(0), 1);
        store.create_version(v).unwrap();
        store.append_rows(v, 0, &batch(&[1, 2])).unwrap();
        store.sync_version(v).unwrap();
        store.append_rows(v, 2, &batch(&[3])).unwrap();
        assert_eq!(store.stored_rows(v), Some(3));
        assert_eq!(store.synced_rows(v), Some(2));

        store.append_rows(v, 2, &batch(&[4])).unwrap();
        let read = store.read_rows(v, 0, 3, 2).unwrap();
        assert_eq!(
            read.column(0).unwrap(),
            &[ColumnValue::Int(1), ColumnValue::Int(2), ColumnValue::Int(4)]
        );
        assert_eq!(read.column(1).unwrap(), vec![ColumnValue::Null; 3].as_slice());
    }

    #[test]
    fn test_fault_injection() {
        let store = MemPartitionStore::new();
        let v = VersionRef::new(PartitionKey::new(0), 1);
        store.inject_fault(FaultOp::Create, 2, io::ErrorKind::Interrupted);

        let err = store.create_version(v).unwrap_err();
        assert!(err.class().is_retryable());
        assert!(store.create_version(v).is_err());
        store.create_version(v).unwrap();

        store.inject_fault(FaultOp::Sync, 1, io::ErrorKind::Other);
        assert!(store.sync_version(v).unwrap_err().class().is_fatal());
        store.sync_version(v).unwrap();
    }
}
