//! # meridian-storage
//!
//! Versioned, time-partitioned column storage for Meridian tables.
//!
//! A table's canonical data is a set of partitions, each stored as one
//! promoted [`PartitionVersion`](partition::VersionRef). In-order rows are
//! appended to the promoted version; rows that land before existing data
//! are merged into a new version, and the old one is kept until no reader
//! pins it. The table state file `_txn` names the promoted versions and
//! the applied watermark; replacing it is the commit point of every
//! publish.

mod config;
mod error;
pub mod partition;
mod reader;
pub mod state;
mod table;
pub mod tracker;

pub use config::StorageConfig;
pub use error::{StorageError, StorageResult};
pub use meridian_common::types::ColumnBatch;
pub use partition::{FaultOp, FsPartitionStore, MemPartitionStore, PartitionStore, VersionRef};
pub use reader::{Row, TableReader};
pub use state::{PartitionEntry, TableState};
pub use table::{ApplyBatch, PublishStats, TableSnapshot, TableStorage};
pub use tracker::{Lineage, TrackerStats, VersionPin, VersionTracker};
