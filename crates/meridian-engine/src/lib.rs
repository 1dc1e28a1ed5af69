//! # meridian-engine
//!
//! WAL commit and apply engine for column-oriented, time-partitioned tables.
//!
//! Many writers append rows to a table concurrently. Each writer owns a
//! private WAL directory; committing writes the buffered rows to the WAL and
//! takes the next transaction id from the table's sequencer. Background
//! workers then merge committed transactions into table storage strictly in
//! transaction order, and readers see a consistent snapshot up to the last
//! applied transaction.
//!
//! ## Example
//!
//! ```rust,no_run
//! use meridian_common::types::{ColumnType, PartitionBy, TableStructure, Timestamp};
//! use meridian_engine::{Engine, EngineConfig};
//!
//! let engine = Engine::open("/tmp/meridian", EngineConfig::default()).unwrap();
//! let structure = TableStructure::builder("ts", PartitionBy::Day)
//!     .column("price", ColumnType::Double)
//!     .build()
//!     .unwrap();
//! engine.create_table("trades", structure).unwrap();
//!
//! let mut writer = engine.writer("trades").unwrap();
//! writer.new_row(Timestamp::now()).unwrap();
//! writer.put("price", 101.5).unwrap();
//! writer.append().unwrap();
//! writer.commit().unwrap();
//!
//! engine.drain().unwrap();
//! assert_eq!(engine.reader("trades").unwrap().row_count(), 1);
//! ```

#![warn(clippy::all)]

mod apply;
mod config;
mod engine;
mod error;
pub mod jobs;
mod queue;
mod retry;
mod table;
mod worker;
mod writer;

pub use apply::{ApplyState, PassOutcome};
pub use config::{ApplyConfig, EngineConfig, EngineConfigBuilder, PurgeConfig, RetryPolicy, WorkerConfig};
pub use engine::{DrainStats, Engine, TableStatus};
pub use error::{EngineError, EngineResult};
pub use jobs::{Job, JobOutcome};
pub use worker::{WorkerPool, WorkerStats};
pub use writer::WalWriter;

pub use meridian_common::types::{StructureChange, TableStructure, TableToken, Timestamp, TxnId};
pub use meridian_sequencer::{SuspendReason, TxnKind, TxnRecord};
pub use meridian_storage::TableReader;
