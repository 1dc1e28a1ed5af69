//! Partition version storage.
//!
//! A partition version is the column data of one time partition written by
//! one publish. Versions are only ever appended to (rows that land after
//! the partition's last timestamp) or replaced by a newer version (an
//! out-of-order merge, a column type change). The [`PartitionStore`] trait
//! is the narrow interface the table layer writes through.

mod fs;
mod mem;

pub use fs::FsPartitionStore;
pub use mem::{FaultOp, MemPartitionStore};

use std::fmt;

use meridian_common::types::{ColumnBatch, PartitionKey};

use crate::error::StorageResult;

/// Identifies one version of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionRef {
    pub partition: PartitionKey,
    /// Table-wide version number; never reused.
    pub version: u64,
}

impl VersionRef {
    /// Creates a version reference.
    pub const fn new(partition: PartitionKey, version: u64) -> Self {
        Self { partition, version }
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.partition.get(), self.version)
    }
}

/// Column storage of partition versions.
///
/// `committed_rows` arguments carry the row count recorded in the table
/// state: anything a store holds beyond it is leftover of a publish that
/// never completed and must be discarded.
pub trait PartitionStore: Send + Sync + fmt::Debug {
    /// Creates an empty version.
    fn create_version(&self, version: VersionRef) -> StorageResult<()>;

    /// Appends `rows` after the first `committed_rows` rows. Columns holding
    /// fewer values than `committed_rows` are padded with nulls first.
    fn append_rows(&self, version: VersionRef, committed_rows: u64, rows: &ColumnBatch) -> StorageResult<()>;

    /// Makes everything appended so far durable.
    fn sync_version(&self, version: VersionRef) -> StorageResult<()>;

    /// Reads rows `lo..hi` with `column_count` columns. Columns that were
    /// never written read as nulls.
    fn read_rows(&self, version: VersionRef, lo: u64, hi: u64, column_count: usize) -> StorageResult<ColumnBatch>;

    /// Physically removes a version.
    fn remove_version(&self, version: VersionRef) -> StorageResult<()>;

    /// Lists every stored version.
    fn list_versions(&self) -> StorageResult<Vec<VersionRef>>;
}
