//! # meridian-sequencer
//!
//! Per-table transaction sequencer for Meridian.
//!
//! Every table has one [`TableSequencer`] living in its `txn_seq/`
//! directory:
//!
//! - `_txnlog`: the commit log, one fixed-size [`TxnRecord`] per txn, in
//!   commit order. This is the canonical order the apply engine follows.
//! - `_meta`: the structure log, the initial structure followed by every
//!   [`StructureChange`](meridian_common::types::StructureChange).
//! - `_status.json`: the suspension flag and its reason.
//!
//! Writers only hand the sequencer metadata (where their rows are and which
//! structure version they were written against); the row data stays in
//! their WAL segments.

mod config;
mod error;
pub mod record;
mod sequencer;
pub mod status;
pub mod structure_log;
pub mod txn_log;

pub use config::SequencerConfig;
pub use error::{SequencerError, SequencerResult};
pub use record::{TxnFlags, TxnKind, TxnRecord};
pub use sequencer::{TableSequencer, TxnRequest};
pub use status::{SuspendReason, SuspendStatus};
