//! Apply pipeline: merges committed transactions into table storage in
//! commit order.
//!
//! One pass reads a run of commit records past the table's applied
//! watermark and folds consecutive data transactions into a single
//! [`ApplyBatch`]. Structure changes and truncates are barriers: the batch
//! built so far is published, the barrier is applied on its own, and a new
//! batch starts under the resulting structure.
//!
//! Failures are classified. Transient ones are retried with backoff and, if
//! they persist, the table is re-queued. Anything else publishes the part of
//! the pass that preceded the failing transaction and suspends the table
//! until an operator resumes it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use tracing::{debug, error, info, warn};

use meridian_common::types::{SegmentId, TxnId, WalId};
use meridian_common::ErrorClass;
use meridian_sequencer::{SequencerError, SuspendReason, TxnKind, TxnRecord};
use meridian_storage::ApplyBatch;
use meridian_wal::{SegmentPin, SegmentReader};

use crate::config::ApplyConfig;
use crate::error::{EngineError, EngineResult};
use crate::retry::with_retry;
use crate::table::Table;

/// What the apply pipeline of a table is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    /// Nothing in progress.
    Idle,
    /// Reading the commit log.
    Draining,
    /// Applying a transaction.
    Applying(TxnId),
    /// Stopped until resumed.
    Suspended,
}

impl fmt::Display for ApplyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Draining => f.write_str("draining"),
            Self::Applying(txn) => write!(f, "applying txn {txn}"),
            Self::Suspended => f.write_str("suspended"),
        }
    }
}

/// Result of one apply pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing was pending.
    Idle,
    /// Another thread holds the table's apply lock.
    Busy,
    /// Transactions were applied. `more` is set if some are still pending.
    Applied { txns: u64, more: bool },
    /// A transient failure outlasted its retries; try again later.
    Deferred,
    /// The table is suspended.
    Suspended,
}

impl PassOutcome {
    /// Returns true if the table should be queued again. A busy table is
    /// re-queued since the running pass may have missed the latest commit.
    pub fn needs_requeue(&self) -> bool {
        matches!(self, Self::Applied { more: true, .. } | Self::Deferred | Self::Busy)
    }

    /// Transactions applied by the pass.
    pub fn applied(&self) -> u64 {
        match self {
            Self::Applied { txns, .. } => *txns,
            _ => 0,
        }
    }
}

/// A failure pinned to the transaction that caused it.
struct Failure {
    txn: TxnId,
    error: EngineError,
}

impl Failure {
    fn new(txn: TxnId, error: impl Into<EngineError>) -> Self {
        Self {
            txn,
            error: error.into(),
        }
    }
}

/// Runs one apply pass over `table`.
pub(crate) fn apply_pass(table: &Table, config: &ApplyConfig) -> PassOutcome {
    if table.sequencer().is_suspended() || table.is_dropped() {
        return PassOutcome::Suspended;
    }
    let Some(_guard) = table.try_lock_apply() else {
        return PassOutcome::Busy;
    };
    // Re-checked under the lock: a concurrent pass may have suspended it.
    if table.sequencer().is_suspended() {
        return PassOutcome::Suspended;
    }

    let mut pass = Pass::new(table, config);
    let result = pass.run();
    let applied = pass.applied;
    drop(pass);

    let sequencer = table.sequencer();
    let outcome = match result {
        Ok(()) => {
            let more = table.storage().applied_txn() < sequencer.last_txn();
            if applied == 0 && !more {
                PassOutcome::Idle
            } else {
                PassOutcome::Applied { txns: applied, more }
            }
        }
        Err(Failure { txn, error: err }) if err.is_retryable() => {
            warn!(table = %table.token(), txn = %txn, error = %err, "apply deferred");
            PassOutcome::Deferred
        }
        Err(Failure { txn, error: err }) => {
            suspend(table, txn, err.class(), err.to_string());
            PassOutcome::Suspended
        }
    };
    if outcome != PassOutcome::Suspended {
        table.set_apply_state(ApplyState::Idle);
    }
    outcome
}

/// Persists a suspension of `table` caused by `txn`.
pub(crate) fn suspend(table: &Table, txn: TxnId, class: ErrorClass, message: String) {
    error!(
        table = %table.token(),
        txn = %txn,
        class = class.as_str(),
        error = %message,
        "suspending table"
    );
    table.set_apply_state(ApplyState::Suspended);
    if let Err(err) = table.sequencer().suspend(SuspendReason::new(txn, class, message)) {
        error!(table = %table.token(), error = %err, "failed to persist suspension");
    }
}

/// Skips every transaction before `txn` and resumes the table. Structure
/// changes among the skipped transactions are still applied so that later
/// data matches the table's structure.
pub(crate) fn resume_from(table: &Table, txn: TxnId, config: &ApplyConfig) -> EngineResult<()> {
    let _guard = table.lock_apply();
    let sequencer = table.sequencer();
    let storage = table.storage();
    let last = sequencer.last_txn();
    if txn == TxnId::NONE || txn > last.next() {
        return Err(EngineError::InvalidResumeTxn { txn, last });
    }

    let target = txn.prev();
    let mut from = storage.applied_txn().next();
    let mut skipped = 0u64;
    'read: while from <= target {
        let records = sequencer.read_txns(from, config.max_txns_per_pass)?;
        if records.is_empty() {
            break;
        }
        for record in records {
            if record.txn > target {
                break 'read;
            }
            if record.kind() == TxnKind::Structure && !record.is_rollback() {
                storage.skip_to(record.txn.prev())?;
                apply_structure(table, &record, config)?;
            } else {
                skipped += 1;
            }
            from = record.txn.next();
        }
    }
    storage.skip_to(target)?;
    sequencer.resume()?;
    table.set_apply_state(ApplyState::Idle);
    info!(table = %table.token(), from = %txn, skipped, "resumed table");
    Ok(())
}

fn apply_structure(table: &Table, record: &TxnRecord, config: &ApplyConfig) -> EngineResult<()> {
    let sequencer = table.sequencer();
    let version = record.structure_version;
    let missing = || {
        SequencerError::corrupted(
            sequencer.dir(),
            0,
            format!("txn {} references unknown structure version {version}", record.txn),
        )
    };
    let (structure, change) = with_retry(&config.retry, "read structure", || {
        Ok((sequencer.structure_at(version)?, sequencer.change_at(version)?))
    })?;
    let structure = structure.ok_or_else(missing)?;
    let change = change.ok_or_else(missing)?;
    table.storage().apply_structure(record.txn, structure, &change)?;
    Ok(())
}

struct Pass<'a> {
    table: &'a Table,
    config: &'a ApplyConfig,
    /// Segments read by this pass, pinned against purge.
    segments: HashMap<(WalId, SegmentId), (SegmentReader, SegmentPin)>,
    applied: u64,
}

impl<'a> Pass<'a> {
    fn new(table: &'a Table, config: &'a ApplyConfig) -> Self {
        Self {
            table,
            config,
            segments: HashMap::new(),
            applied: 0,
        }
    }

    fn run(&mut self) -> Result<(), Failure> {
        let sequencer = self.table.sequencer();
        let storage = self.table.storage();
        let from = storage.applied_txn().next();
        if from > sequencer.last_txn() {
            return Ok(());
        }

        self.table.set_apply_state(ApplyState::Draining);
        let records = with_retry(&self.config.retry, "read commit log", || {
            Ok(sequencer.read_txns(from, self.config.max_txns_per_pass)?)
        })
        .map_err(|err| Failure::new(from, err))?;

        let mut batch = storage.begin_batch();
        for record in &records {
            self.table.set_apply_state(ApplyState::Applying(record.txn));
            if record.is_rollback() || (record.kind() == TxnKind::Data && !record.has_rows()) {
                batch.skip(record.txn).map_err(|err| Failure::new(record.txn, err))?;
                continue;
            }
            match record.kind() {
                TxnKind::Data => {
                    if record.wait_all_done() {
                        batch = self.publish(batch)?;
                    }
                    if let Err(err) = self.add_data(&mut batch, record) {
                        self.publish_prefix(batch);
                        return Err(Failure::new(record.txn, err));
                    }
                    if record.wait_all_done() || batch.row_count() >= self.config.max_batch_rows {
                        batch = self.publish(batch)?;
                    }
                }
                TxnKind::Structure => {
                    self.publish(batch)?;
                    apply_structure(self.table, record, self.config)
                        .map_err(|err| Failure::new(record.txn, err))?;
                    self.applied += 1;
                    batch = storage.begin_batch();
                }
                TxnKind::Truncate => {
                    self.publish(batch)?;
                    storage.truncate(record.txn).map_err(|err| Failure::new(record.txn, err))?;
                    self.applied += 1;
                    batch = storage.begin_batch();
                }
            }
        }
        self.publish(batch)?;
        Ok(())
    }

    /// Reads the rows of `record` from its WAL segment into `batch`.
    fn add_data(&mut self, batch: &mut ApplyBatch, record: &TxnRecord) -> EngineResult<()> {
        let wal = self.table.wal();
        let retry = &self.config.retry;
        let (reader, _) = match self.segments.entry((record.wal_id, record.segment_id)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let pin = wal.pin(record.wal_id, record.segment_id);
                let reader = with_retry(retry, "read wal segment", || {
                    Ok(wal.open_reader(record.wal_id, record.segment_id)?)
                })?;
                entry.insert((reader, pin))
            }
        };
        let event = reader.committed_event(record.segment_txn, record.row_lo, record.row_hi)?;
        batch.add(record.txn, record.structure_version, &event.rows)?;
        Ok(())
    }

    /// Publishes `batch` and returns a fresh one.
    fn publish(&mut self, batch: ApplyBatch) -> Result<ApplyBatch, Failure> {
        let storage = self.table.storage();
        if batch.is_empty() {
            return Ok(batch);
        }
        let first = storage.applied_txn().next();
        let txns = batch.txn_count() as u64;
        let stats = storage.publish(batch).map_err(|err| Failure::new(first, err))?;
        self.applied += txns;
        debug!(table = %self.table.token(), txns, rows = stats.rows, "applied batch");
        Ok(storage.begin_batch())
    }

    /// Publishes what was gathered before a failing transaction.
    fn publish_prefix(&mut self, batch: ApplyBatch) {
        if let Err(failure) = self.publish(batch) {
            warn!(
                table = %self.table.token(),
                txn = %failure.txn,
                error = %failure.error,
                "could not publish transactions before failure"
            );
        }
    }
}
