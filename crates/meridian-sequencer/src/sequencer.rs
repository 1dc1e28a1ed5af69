//! The per-table transaction sequencer.
//!
//! `TableSequencer` is the single point of ordering for a table. Writers
//! call [`TableSequencer::next_txn`] with a reference to rows they already
//! made durable in their own WAL segment; the sequencer checks the structure
//! version, appends one fixed-size record to the commit log and returns the
//! assigned [`TxnId`]. Structure changes and truncates go through the same
//! lock and the same log as barrier records.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{error, info, warn};

use meridian_common::constants::{STRUCTURE_LOG_FILE, TXN_LOG_FILE};
use meridian_common::types::{
    SegmentId, StructureChange, StructureVersion, TableId, TableStructure, Timestamp, TxnId, WalId,
};

use crate::config::SequencerConfig;
use crate::error::{SequencerError, SequencerResult};
use crate::record::{TxnFlags, TxnRecord};
use crate::status::{SuspendReason, SuspendStatus};
use crate::structure_log::StructureLog;
use crate::txn_log::TxnLog;

/// A commit request: where the rows are and which structure they were
/// written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnRequest {
    pub wal_id: WalId,
    pub segment_id: SegmentId,
    pub segment_txn: u64,
    pub structure_version: StructureVersion,
    pub row_lo: u64,
    pub row_hi: u64,
    /// Occupy the slot without anything to apply.
    pub rollback: bool,
    /// Require everything before to be applied first.
    pub wait_all_done: bool,
}

impl TxnRequest {
    /// Creates a plain data request.
    pub fn data(
        wal_id: WalId,
        segment_id: SegmentId,
        segment_txn: u64,
        structure_version: StructureVersion,
        row_lo: u64,
        row_hi: u64,
    ) -> Self {
        Self {
            wal_id,
            segment_id,
            segment_txn,
            structure_version,
            row_lo,
            row_hi,
            rollback: false,
            wait_all_done: false,
        }
    }

    fn flags(&self) -> TxnFlags {
        let mut flags = TxnFlags::empty();
        flags.set(TxnFlags::ROLLBACK, self.rollback);
        flags.set(TxnFlags::WAIT_ALL_DONE, self.wait_all_done);
        flags
    }
}

struct Logs {
    txn_log: TxnLog,
    structure_log: StructureLog,
}

/// Per-table commit order and structure authority.
pub struct TableSequencer {
    dir: PathBuf,
    table_id: TableId,
    config: SequencerConfig,
    /// Held for the duration of one append.
    logs: Mutex<Logs>,
    structure: RwLock<Arc<TableStructure>>,
    structure_version: AtomicU64,
    last_txn: AtomicU64,
    status: Mutex<SuspendStatus>,
    suspended: AtomicBool,
    dropped: AtomicBool,
}

impl std::fmt::Debug for TableSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSequencer")
            .field("dir", &self.dir)
            .field("table_id", &self.table_id)
            .field("last_txn", &self.last_txn())
            .field("structure_version", &self.structure_version())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

impl TableSequencer {
    /// Creates the sequencer files for a new table in `dir`.
    pub fn create(
        dir: impl AsRef<Path>,
        table_id: TableId,
        structure: &TableStructure,
        config: SequencerConfig,
    ) -> SequencerResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.join(TXN_LOG_FILE).exists() {
            return Err(SequencerError::AlreadyExists { path: dir });
        }
        fs::create_dir_all(&dir)?;

        let sync = config.sync_on_append;
        let txn_log = TxnLog::create(dir.join(TXN_LOG_FILE), sync)?;
        let structure_log = StructureLog::create(dir.join(STRUCTURE_LOG_FILE), structure, sync)?;
        SuspendStatus::default().save(&dir, sync)?;

        info!(table_id = %table_id, dir = %dir.display(), "created table sequencer");
        Ok(Self::assemble(dir, table_id, config, txn_log, structure_log, SuspendStatus::default()))
    }

    /// Opens the sequencer of an existing table.
    ///
    /// Structure versions the commit log never recorded (a crash between the
    /// two appends of a structure change) are dropped.
    pub fn open(dir: impl AsRef<Path>, table_id: TableId, config: SequencerConfig) -> SequencerResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.join(TXN_LOG_FILE).exists() {
            return Err(SequencerError::NotFound { path: dir });
        }

        let sync = config.sync_on_append;
        let mut txn_log = TxnLog::open(dir.join(TXN_LOG_FILE), sync)?;
        let mut structure_log = StructureLog::open(dir.join(STRUCTURE_LOG_FILE), sync)?;

        let last = txn_log.last_txn();
        let committed = match txn_log.read(last, 1)?.first() {
            Some(record) => record.structure_version,
            None => StructureVersion::INITIAL,
        };
        if structure_log.version() < committed {
            return Err(SequencerError::corrupted(
                structure_log.path(),
                0,
                format!(
                    "structure log at version {} behind commit log at {committed}",
                    structure_log.version()
                ),
            ));
        }
        if structure_log.version() > committed {
            warn!(
                table_id = %table_id,
                logged = %structure_log.version(),
                committed = %committed,
                "dropping uncommitted structure versions"
            );
            structure_log.truncate_to(committed)?;
        }

        let status = SuspendStatus::load(&dir)?;
        let sequencer = Self::assemble(dir, table_id, config, txn_log, structure_log, status);
        info!(
            table_id = %table_id,
            last_txn = %sequencer.last_txn(),
            structure_version = %sequencer.structure_version(),
            suspended = sequencer.is_suspended(),
            "opened table sequencer"
        );
        Ok(sequencer)
    }

    fn assemble(
        dir: PathBuf,
        table_id: TableId,
        config: SequencerConfig,
        txn_log: TxnLog,
        structure_log: StructureLog,
        status: SuspendStatus,
    ) -> Self {
        let structure = structure_log.current();
        Self {
            dir,
            table_id,
            structure_version: AtomicU64::new(structure.version().get()),
            last_txn: AtomicU64::new(txn_log.last_txn().get()),
            structure: RwLock::new(structure),
            suspended: AtomicBool::new(status.suspended),
            status: Mutex::new(status),
            logs: Mutex::new(Logs { txn_log, structure_log }),
            dropped: AtomicBool::new(false),
            config,
        }
    }

    fn lock_logs(&self) -> SequencerResult<MutexGuard<'_, Logs>> {
        let logs = self
            .logs
            .try_lock_for(self.config.lock_timeout())
            .ok_or(SequencerError::Busy { table_id: self.table_id })?;
        if self.is_dropped() {
            return Err(SequencerError::Dropped { table_id: self.table_id });
        }
        Ok(logs)
    }

    fn check_version(&self, logs: &Logs, requested: StructureVersion) -> SequencerResult<()> {
        let current = logs.structure_log.version();
        if requested != current {
            return Err(SequencerError::StaleStructure { requested, current });
        }
        Ok(())
    }

    fn append(&self, logs: &mut Logs, mut record: TxnRecord) -> SequencerResult<TxnId> {
        record.txn = logs.txn_log.last_txn().next();
        logs.txn_log.append(&record)?;
        self.last_txn.store(record.txn.get(), Ordering::Release);
        Ok(record.txn)
    }

    /// Assigns the next txn to a commit.
    pub fn next_txn(&self, request: TxnRequest) -> SequencerResult<TxnId> {
        let mut logs = self.lock_logs()?;
        self.check_version(&logs, request.structure_version)?;

        let record = TxnRecord {
            txn: TxnId::NONE,
            structure_version: request.structure_version,
            wal_id: request.wal_id,
            segment_id: request.segment_id,
            segment_txn: request.segment_txn,
            row_lo: request.row_lo,
            row_hi: request.row_hi,
            commit_ts: Timestamp::now(),
            flags: request.flags(),
        };
        self.append(&mut logs, record)
    }

    /// Commits a structure change made against `expected`.
    ///
    /// The change goes to the structure log first, then its barrier record to
    /// the commit log. If the second append fails the first is undone.
    pub fn alter(
        &self,
        expected: StructureVersion,
        change: &StructureChange,
    ) -> SequencerResult<(TxnId, StructureVersion)> {
        let mut logs = self.lock_logs()?;
        self.check_version(&logs, expected)?;

        let next = logs.structure_log.append(change)?;
        let record = barrier_record(next.version(), TxnFlags::STRUCTURE);
        let txn = match self.append(&mut logs, record) {
            Ok(txn) => txn,
            Err(err) => {
                if let Err(undo) = logs.structure_log.truncate_to(expected) {
                    error!(
                        table_id = %self.table_id,
                        error = %undo,
                        "failed to undo structure log append"
                    );
                }
                return Err(err);
            }
        };

        let version = next.version();
        *self.structure.write() = next;
        self.structure_version.store(version.get(), Ordering::Release);
        info!(table_id = %self.table_id, txn = %txn, version = %version, change = %change, "structure changed");
        Ok((txn, version))
    }

    /// Commits a truncate barrier.
    pub fn truncate(&self) -> SequencerResult<TxnId> {
        let mut logs = self.lock_logs()?;
        let version = logs.structure_log.version();
        let txn = self.append(
            &mut logs,
            barrier_record(version, TxnFlags::TRUNCATE | TxnFlags::WAIT_ALL_DONE),
        )?;
        info!(table_id = %self.table_id, txn = %txn, "table truncated");
        Ok(txn)
    }

    /// Reads up to `limit` commit records starting at `from`, capped at the
    /// configured read batch size.
    pub fn read_txns(&self, from: TxnId, limit: usize) -> SequencerResult<Vec<TxnRecord>> {
        let limit = limit.min(self.config.read_batch_size);
        let mut logs = self
            .logs
            .try_lock_for(self.config.lock_timeout())
            .ok_or(SequencerError::Busy { table_id: self.table_id })?;
        logs.txn_log.read(from, limit)
    }

    /// Current structure version.
    pub fn structure_version(&self) -> StructureVersion {
        StructureVersion::new(self.structure_version.load(Ordering::Acquire))
    }

    /// Snapshot of the current structure.
    pub fn structure(&self) -> Arc<TableStructure> {
        Arc::clone(&self.structure.read())
    }

    /// Structure at a committed `version`.
    pub fn structure_at(&self, version: StructureVersion) -> SequencerResult<Option<Arc<TableStructure>>> {
        Ok(self.lock_for_read()?.structure_log.structure_at(version))
    }

    /// The change that produced `version`.
    pub fn change_at(&self, version: StructureVersion) -> SequencerResult<Option<StructureChange>> {
        Ok(self.lock_for_read()?.structure_log.change_at(version).cloned())
    }

    fn lock_for_read(&self) -> SequencerResult<MutexGuard<'_, Logs>> {
        self.logs
            .try_lock_for(self.config.lock_timeout())
            .ok_or(SequencerError::Busy { table_id: self.table_id })
    }

    /// Last assigned txn.
    pub fn last_txn(&self) -> TxnId {
        TxnId::new(self.last_txn.load(Ordering::Acquire))
    }

    /// Returns true if the table is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Why the table is suspended.
    pub fn suspend_reason(&self) -> Option<SuspendReason> {
        self.status.lock().reason.clone()
    }

    /// Suspends the table. Commits are still accepted; apply stops.
    pub fn suspend(&self, reason: SuspendReason) -> SequencerResult<()> {
        let mut status = self.status.lock();
        error!(table_id = %self.table_id, reason = %reason, "suspending table");
        let next = SuspendStatus {
            suspended: true,
            reason: Some(reason),
        };
        next.save(&self.dir, self.config.sync_on_append)?;
        *status = next;
        self.suspended.store(true, Ordering::Release);
        Ok(())
    }

    /// Clears the suspension. Returns false if the table was not suspended.
    pub fn resume(&self) -> SequencerResult<bool> {
        let mut status = self.status.lock();
        if !status.suspended {
            return Ok(false);
        }
        let next = SuspendStatus::default();
        next.save(&self.dir, self.config.sync_on_append)?;
        *status = next;
        self.suspended.store(false, Ordering::Release);
        info!(table_id = %self.table_id, "table resumed");
        Ok(true)
    }

    /// Rejects every later commit.
    pub fn mark_dropped(&self) {
        // Under the logs lock so no append is in flight afterwards.
        let _logs = self.logs.lock();
        self.dropped.store(true, Ordering::Release);
    }

    /// Returns true once the table was dropped.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Table id.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Sequencer directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configuration.
    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }
}

fn barrier_record(structure_version: StructureVersion, flags: TxnFlags) -> TxnRecord {
    TxnRecord {
        txn: TxnId::NONE,
        structure_version,
        wal_id: WalId::METADATA,
        segment_id: SegmentId::new(0),
        segment_txn: 0,
        row_lo: 0,
        row_hi: 0,
        commit_ts: Timestamp::now(),
        flags: flags | TxnFlags::BARRIER,
    }
}
