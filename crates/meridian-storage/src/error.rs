//! Storage error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use meridian_common::types::{DecodeError, StructureVersion, TxnId};
use meridian_common::ErrorClass;

use crate::partition::VersionRef;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in table storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error on a storage file.
    #[error("storage I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// A storage file is corrupted.
    #[error("storage file {path} corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    /// Invalid file magic number.
    #[error("invalid magic in {path}: expected {expected:#010x}, found {found:#010x}")]
    InvalidMagic {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    /// Unsupported file format version.
    #[error("unsupported format version in {path}: {found}")]
    UnsupportedVersion { path: PathBuf, found: u32 },

    /// Value decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A partition version does not exist.
    #[error("partition version {0} not found")]
    VersionNotFound(VersionRef),

    /// A partition version already exists.
    #[error("partition version {0} already exists")]
    VersionExists(VersionRef),

    /// Fewer rows are stored than the table state claims.
    #[error("partition version {version} holds {stored} rows, {expected} expected")]
    MissingRows {
        version: VersionRef,
        stored: u64,
        expected: u64,
    },

    /// Rows were written against another structure version.
    #[error("txn {txn} written against structure {found}, table is at {expected}")]
    StructureMismatch {
        txn: TxnId,
        expected: StructureVersion,
        found: StructureVersion,
    },

    /// Transactions were handed over out of order.
    #[error("txn {found} out of order, expected {expected}")]
    OutOfOrder { expected: TxnId, found: TxnId },

    /// The table changed after the batch was started.
    #[error("table changed while a batch was prepared")]
    StaleBatch,

    /// The table storage already exists.
    #[error("table storage already exists in {0}")]
    AlreadyExists(PathBuf),

    /// Configuration error.
    #[error("storage configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupted { .. }
                | Self::InvalidMagic { .. }
                | Self::UnsupportedVersion { .. }
                | Self::Decode(_)
                | Self::MissingRows { .. }
        )
    }

    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io { source } => ErrorClass::of_io(source),
            Self::StaleBatch => ErrorClass::Retryable,
            Self::StructureMismatch { .. } => ErrorClass::StaleStructure,
            Self::AlreadyExists(_) | Self::ConfigError(_) => ErrorClass::Rejected,
            Self::Corrupted { .. }
            | Self::InvalidMagic { .. }
            | Self::UnsupportedVersion { .. }
            | Self::Decode(_)
            | Self::VersionNotFound(_)
            | Self::VersionExists(_)
            | Self::MissingRows { .. }
            | Self::OutOfOrder { .. } => ErrorClass::Fatal,
        }
    }
}
