//! # meridian-wal
//!
//! Per-writer WAL segments for Meridian tables.
//!
//! Every writer session owns one `wal<N>/` directory under the table
//! directory and appends to its own segments, so writers never contend on
//! I/O. The apply engine reads segments once commits reference them and the
//! purge job deletes them once every referencing transaction is applied.
//!
//! # Architecture
//!
//! A segment lives in `wal<N>/<S>/events.wal` and contains a segment header
//! event, zero or more data events (one per commit) and, once closed, a seal
//! event.
//!
//! ## Event Format
//!
//! Each event consists of a 16-byte header followed by a variable-length payload:
//!
//! ```text
//! +------------+--------------+------+-------+--------------+
//! | Length (4) | Checksum (4) | Type | Flags | Reserved (6) |
//! +------------+--------------+------+-------+--------------+
//! |                  Payload (variable)                     |
//! +---------------------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;

/// WAL event types and serialization.
pub mod record;

/// WAL segment files.
pub mod segment;

/// Segment appender for one writer.
pub mod writer;

/// Segment reader for the apply engine.
pub mod reader;

/// Per-table segment store.
pub mod store;

// Re-exports for convenience
pub use config::{CommitMode, WalConfig};
pub use error::{WalError, WalResult};
pub use reader::SegmentReader;
pub use record::{DataPayload, EventFlags, EventHeader, EventType, WalEvent};
pub use segment::{SegmentState, WalSegment};
pub use store::{SegmentPin, SegmentRef, WalSegmentStore};
pub use writer::{SegmentPosition, WalAppender, WriterStats};
