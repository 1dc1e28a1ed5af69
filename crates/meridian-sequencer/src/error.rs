//! Sequencer error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use meridian_common::types::{DecodeError, StructureError, StructureVersion, TableId};
use meridian_common::ErrorClass;

/// Result type for sequencer operations.
pub type SequencerResult<T> = Result<T, SequencerError>;

/// Errors that can occur in the table sequencer.
#[derive(Debug, Error)]
pub enum SequencerError {
    /// I/O error on a sequencer file.
    #[error("sequencer I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// A sequencer file is corrupted.
    #[error("sequencer file {path} corrupted at offset {offset}: {reason}")]
    Corrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

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

    /// The commit was made against an outdated structure version.
    #[error("stale structure version {requested}, table is at {current}")]
    StaleStructure {
        requested: StructureVersion,
        current: StructureVersion,
    },

    /// The structure change is invalid.
    #[error(transparent)]
    Structure(#[from] StructureError),

    /// The commit log could not be locked in time.
    #[error("commit log of table {table_id} busy")]
    Busy { table_id: TableId },

    /// The table was dropped.
    #[error("table {table_id} was dropped")]
    Dropped { table_id: TableId },

    /// The sequencer directory does not exist.
    #[error("no sequencer found in {path}")]
    NotFound { path: PathBuf },

    /// The sequencer directory already exists.
    #[error("sequencer already exists in {path}")]
    AlreadyExists { path: PathBuf },

    /// Status file could not be encoded or decoded.
    #[error("status file error: {0}")]
    Status(#[from] serde_json::Error),
}

impl SequencerError {
    /// Creates a corruption error.
    pub fn corrupted(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// Converts a decode error on `path` into a corruption error.
    pub fn decode(path: impl Into<PathBuf>, offset: u64, err: DecodeError) -> Self {
        Self::corrupted(path, offset, err.to_string())
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupted { .. }
                | Self::InvalidMagic { .. }
                | Self::UnsupportedVersion { .. }
                | Self::Status(_)
        )
    }

    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io { source } => ErrorClass::of_io(source),
            Self::Busy { .. } => ErrorClass::Retryable,
            Self::StaleStructure { .. } => ErrorClass::StaleStructure,
            Self::Structure(err) => err.class(),
            Self::Dropped { .. } | Self::NotFound { .. } | Self::AlreadyExists { .. } => {
                ErrorClass::Rejected
            }
            Self::Corrupted { .. }
            | Self::InvalidMagic { .. }
            | Self::UnsupportedVersion { .. }
            | Self::Status(_) => ErrorClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = SequencerError::StaleStructure {
            requested: StructureVersion::new(1),
            current: StructureVersion::new(2),
        };
        assert_eq!(err.class(), ErrorClass::StaleStructure);

        let err = SequencerError::Busy {
            table_id: TableId::new(1),
        };
        assert!(err.class().is_retryable());

        let err = SequencerError::corrupted("/tmp/_txnlog", 16, "bad checksum");
        assert!(err.is_corruption());
        assert!(err.class().is_fatal());

        let err: SequencerError = StructureError::UnknownColumn("x".into()).into();
        assert_eq!(err.class(), ErrorClass::Rejected);
    }

    #[test]
    fn test_display() {
        let err = SequencerError::StaleStructure {
            requested: StructureVersion::new(1),
            current: StructureVersion::new(2),
        };
        assert_eq!(err.to_string(), "stale structure version 1, table is at 2");
    }
}
