//! WAL error types.
//!
//! This module defines all error types for WAL segments.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use meridian_common::types::{DecodeError, SegmentId, WalId};
use meridian_common::ErrorClass;

/// Result type for WAL operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// I/O error during WAL operations.
    #[error("WAL I/O error: {source}")]
    Io {
        /// Underlying error.
        #[from]
        source: io::Error,
    },

    /// WAL segment file is corrupted.
    #[error("WAL segment {path} corrupted at offset {offset}: {reason}")]
    SegmentCorrupted {
        /// Events file.
        path: PathBuf,
        /// Offset of the bad event.
        offset: u64,
        /// What is wrong.
        reason: String,
    },

    /// Invalid WAL segment magic number.
    #[error("Invalid WAL segment magic: expected {expected:#010x}, found {found:#010x}")]
    InvalidMagic {
        /// Expected magic.
        expected: u32,
        /// Magic on disk.
        found: u32,
    },

    /// Invalid WAL segment version.
    #[error("Unsupported WAL version: expected {expected}, found {found}")]
    UnsupportedVersion {
        /// Supported version.
        expected: u32,
        /// Version on disk.
        found: u32,
    },

    /// WAL event checksum mismatch.
    #[error("WAL event checksum mismatch at offset {offset}: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Offset of the event.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Checksum of the bytes read.
        computed: u32,
    },

    /// WAL event too large.
    #[error("WAL event too large: {size} bytes exceeds maximum {max} bytes")]
    EventTooLarge {
        /// Encoded event size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// WAL segment not found.
    #[error("WAL segment not found: wal{wal_id}/{segment_id}")]
    SegmentNotFound {
        /// Writer directory.
        wal_id: WalId,
        /// Missing segment.
        segment_id: SegmentId,
    },

    /// Data event not found in a segment.
    #[error("WAL event {segment_txn} not found in wal{wal_id}/{segment_id}")]
    EventNotFound {
        /// Writer directory.
        wal_id: WalId,
        /// Segment searched.
        segment_id: SegmentId,
        /// Index of the missing data event.
        segment_txn: u64,
    },

    /// Row range of a commit does not match the data event.
    #[error("row range {lo}..{hi} does not match WAL event {segment_txn} ({event_lo}..{event_hi})")]
    RowRangeMismatch {
        /// Index of the data event.
        segment_txn: u64,
        /// First row named by the commit.
        lo: u64,
        /// End of the commit's row range.
        hi: u64,
        /// First row of the event.
        event_lo: u64,
        /// End of the event's row range.
        event_hi: u64,
    },

    /// Segment was sealed and accepts no more events.
    #[error("WAL segment wal{wal_id}/{segment_id} is sealed")]
    SegmentSealed {
        /// Writer directory.
        wal_id: WalId,
        /// Sealed segment.
        segment_id: SegmentId,
    },

    /// Segment header belongs to another table, wal or segment.
    #[error("WAL segment header mismatch: {reason}")]
    HeaderMismatch {
        /// Which field differs.
        reason: String,
    },

    /// WAL event decode error.
    #[error("Failed to decode WAL event: {0}")]
    Decode(#[from] DecodeError),

    /// The segment store is closed.
    #[error("WAL segment store is closed")]
    Closed,

    /// Configuration error.
    #[error("WAL configuration error: {reason}")]
    ConfigError {
        /// What is invalid.
        reason: String,
    },
}

impl WalError {
    /// Creates a segment corrupted error.
    pub fn segment_corrupted(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        Self::SegmentCorrupted {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a checksum mismatch error.
    pub fn checksum_mismatch(offset: u64, expected: u32, computed: u32) -> Self {
        Self::ChecksumMismatch {
            offset,
            expected,
            computed,
        }
    }

    /// Creates an event too large error.
    pub fn event_too_large(size: usize, max: usize) -> Self {
        Self::EventTooLarge { size, max }
    }

    /// Creates a config error.
    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// Returns true if this is a recoverable error.
    pub fn is_recoverable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::SegmentCorrupted { .. }
                | Self::ChecksumMismatch { .. }
                | Self::InvalidMagic { .. }
                | Self::UnsupportedVersion { .. }
                | Self::HeaderMismatch { .. }
                | Self::RowRangeMismatch { .. }
                | Self::Decode(_)
        )
    }

    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io { source } => ErrorClass::of_io(source),
            Self::EventTooLarge { .. } | Self::SegmentSealed { .. } | Self::Closed | Self::ConfigError { .. } => {
                ErrorClass::Rejected
            }
            _ => ErrorClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = WalError::segment_corrupted("/tmp/wal1/0/events.wal", 100, "bad data");
        assert!(err.is_corruption());
        assert!(!err.is_recoverable());
        assert_eq!(err.class(), ErrorClass::Fatal);

        let err = WalError::checksum_mismatch(100, 0x1234, 0x5678);
        assert!(err.is_corruption());

        let err = WalError::SegmentNotFound {
            wal_id: WalId::new(1),
            segment_id: SegmentId::new(0),
        };
        assert!(!err.is_corruption());
        assert!(err.class().is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = WalError::event_too_large(100_000_000, 10_000_000);
        let msg = format!("{}", err);
        assert!(msg.contains("100000000"));
        assert!(msg.contains("10000000"));
        assert_eq!(err.class(), ErrorClass::Rejected);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Interrupted, "signal");
        let wal_err: WalError = io_err.into();
        assert!(matches!(wal_err, WalError::Io { .. }));
        assert!(wal_err.is_recoverable());
    }
}
