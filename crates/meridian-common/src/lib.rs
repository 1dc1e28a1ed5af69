//! # meridian-common
//!
//! Common types shared by all Meridian components.
//!
//! This crate provides the foundational types used across the WAL,
//! sequencer, storage and engine crates. It includes:
//!
//! - **Types**: table identity (`TableToken`), ordering identifiers (`TxnId`,
//!   `StructureVersion`), WAL addressing (`WalId`, `SegmentId`) and timestamps
//! - **Values**: column types, column values and their binary codec
//! - **Structure**: versioned table structure and the changes applied to it
//! - **Errors**: the error classification shared by every crate's error type
//! - **Constants**: file names, magic numbers and limits
//!
//! ## Example
//!
//! ```rust
//! use meridian_common::types::{ColumnType, PartitionBy, TableStructure, TxnId};
//!
//! let structure = TableStructure::builder("ts", PartitionBy::Day)
//!     .column("price", ColumnType::Double)
//!     .build()
//!     .unwrap();
//! assert_eq!(structure.visible_columns().count(), 1);
//! assert!(TxnId::new(1) > TxnId::NONE);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod error;
pub mod types;

pub use error::ErrorClass;
pub use types::{
    ColumnBatch, ColumnType, ColumnValue, DecodeError, PartitionBy, PartitionKey, SegmentId,
    StructureChange, StructureError, StructureVersion, TableId, TableStructure, TableToken,
    Timestamp, TxnId, WalId,
};
