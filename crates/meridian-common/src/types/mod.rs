//! Core types for Meridian.

mod batch;
mod ids;
mod structure;
mod timestamps;
mod values;

pub use batch::ColumnBatch;
pub use ids::{is_valid_name, SegmentId, StructureVersion, TableId, TableToken, TxnId, WalId};
pub use structure::{
    ColumnMeta, StructureChange, StructureError, StructureResult, TableStructure,
    TableStructureBuilder,
};
pub use timestamps::{PartitionBy, PartitionKey, Timestamp};
pub use values::{ensure_remaining, get_str, put_str, ColumnType, ColumnValue, DecodeError};
