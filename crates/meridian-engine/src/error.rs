//! Engine error types.

use std::io;
use thiserror::Error;

use meridian_common::types::{ColumnType, StructureError, StructureVersion, TxnId};
use meridian_common::ErrorClass;
use meridian_sequencer::SequencerError;
use meridian_storage::StorageError;
use meridian_wal::WalError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// WAL segment error.
    #[error(transparent)]
    Wal(#[from] WalError),

    /// Sequencer error.
    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    /// Table storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Invalid structure or structure change.
    #[error(transparent)]
    Structure(#[from] StructureError),

    /// I/O error on an engine file.
    #[error("engine I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// No table has this name.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A table with this name exists.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// Name cannot be used for a table.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// The table has no visible column with this name.
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    /// Value does not fit the column.
    #[error("cannot store {value} in column {column} of type {column_type}")]
    InvalidValue {
        column: String,
        column_type: ColumnType,
        value: String,
    },

    /// `put` or `append` without `new_row`.
    #[error("no row in progress")]
    NoRowInProgress,

    /// `new_row` or `commit` while a row is in progress.
    #[error("a row is in progress; append or cancel it first")]
    RowInProgress,

    /// The writer was asked to reach a structure version the table has not
    /// committed yet.
    #[error("structure version {required} not reached, table is at {current}")]
    StructureNotReached {
        required: StructureVersion,
        current: StructureVersion,
    },

    /// `resume_from` target outside the commit log.
    #[error("cannot resume from txn {txn}: last txn is {last}")]
    InvalidResumeTxn { txn: TxnId, last: TxnId },

    /// Worker thread could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Configuration error.
    #[error("engine configuration error: {0}")]
    ConfigError(String),
}

impl EngineError {
    /// Creates a config error.
    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::ConfigError(reason.into())
    }

    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Wal(err) => err.class(),
            Self::Sequencer(err) => err.class(),
            Self::Storage(err) => err.class(),
            Self::Structure(err) => err.class(),
            Self::Io { source } => ErrorClass::of_io(source),
            Self::StructureNotReached { .. } => ErrorClass::StaleStructure,
            Self::TableNotFound(_)
            | Self::TableExists(_)
            | Self::InvalidTableName(_)
            | Self::UnknownColumn(_)
            | Self::InvalidValue { .. }
            | Self::NoRowInProgress
            | Self::RowInProgress
            | Self::InvalidResumeTxn { .. }
            | Self::ConfigError(_) => ErrorClass::Rejected,
            Self::Spawn(_) => ErrorClass::Fatal,
        }
    }

    /// Returns true if the writer must call `go_active` before committing.
    pub fn is_stale_structure(&self) -> bool {
        self.class() == ErrorClass::StaleStructure
    }

    /// Returns true if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::types::TableId;

    #[test]
    fn test_classes() {
        let stale: EngineError = SequencerError::StaleStructure {
            requested: StructureVersion::new(1),
            current: StructureVersion::new(2),
        }
        .into();
        assert!(stale.is_stale_structure());

        let busy: EngineError = SequencerError::Busy {
            table_id: TableId::new(1),
        }
        .into();
        assert!(busy.is_retryable());

        let missing: EngineError = WalError::SegmentNotFound {
            wal_id: meridian_common::types::WalId::new(1),
            segment_id: meridian_common::types::SegmentId::new(0),
        }
        .into();
        assert!(missing.class().is_fatal());

        assert_eq!(EngineError::TableNotFound("t".into()).class(), ErrorClass::Rejected);
        assert!(EngineError::StructureNotReached {
            required: StructureVersion::new(3),
            current: StructureVersion::new(2),
        }
        .is_stale_structure());
    }
}
