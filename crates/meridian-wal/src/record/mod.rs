//! WAL event types and serialization.
//!
//! Events are serialized with a fixed-size header followed by a
//! variable-length payload.

pub mod header;
pub mod payload;
pub mod types;

pub use header::EventHeader;
pub use payload::{DataPayload, Payload, SealPayload, SegmentHeaderPayload};
pub use types::{EventFlags, EventType, WalEvent};
