//! Engine facade.
//!
//! The [`Engine`] owns every table under one root directory. It hands out
//! writers and readers, runs the apply pipeline, and exposes the operator
//! controls (suspend state, resume). Background work either runs on a
//! [`WorkerPool`] started with [`Engine::start_workers`] or synchronously
//! through [`Engine::drain`].

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use meridian_common::constants::{TABLE_DROPPED_FILE, TABLE_NAME_FILE, TABLE_STATE_FILE};
use meridian_common::types::{
    is_valid_name, SegmentId, StructureVersion, TableId, TableStructure, TableToken, TxnId, WalId,
};
use meridian_common::ErrorClass;
use meridian_sequencer::{SuspendReason, TxnRecord};
use meridian_storage::TableReader;

use crate::apply::{self, apply_pass, ApplyState, PassOutcome};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::jobs::default_jobs;
use crate::queue::ApplyQueue;
use crate::table::Table;
use crate::worker::WorkerPool;
use crate::writer::WalWriter;

#[derive(Default)]
struct Tables {
    by_name: HashMap<String, Arc<Table>>,
    by_id: HashMap<TableId, Arc<Table>>,
}

impl Tables {
    fn insert(&mut self, table: Arc<Table>) {
        self.by_id.insert(table.table_id(), Arc::clone(&table));
        self.by_name.insert(table.name(), table);
    }

    fn remove(&mut self, name: &str) -> Option<Arc<Table>> {
        let table = self.by_name.remove(name)?;
        self.by_id.remove(&table.table_id());
        Some(table)
    }
}

/// Point-in-time status of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStatus {
    pub token: TableToken,
    /// Last committed transaction.
    pub last_txn: TxnId,
    /// Last transaction visible to readers.
    pub applied_txn: TxnId,
    /// Latest committed structure version.
    pub structure_version: StructureVersion,
    pub state: ApplyState,
    pub suspend_reason: Option<SuspendReason>,
    pub partitions: usize,
    pub rows: u64,
    /// Writers currently open.
    pub writers: usize,
}

impl TableStatus {
    /// Transactions committed but not yet applied.
    pub fn lag(&self) -> u64 {
        self.last_txn.get().saturating_sub(self.applied_txn.get())
    }
}

/// What [`Engine::drain`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Transactions applied.
    pub txns: u64,
    /// WAL segments deleted.
    pub segments: usize,
    /// Partition versions deleted.
    pub versions: usize,
    /// Dropped tables deleted from disk.
    pub tables: usize,
}

/// WAL commit and apply engine over a directory of tables.
pub struct Engine {
    root: PathBuf,
    config: EngineConfig,
    tables: RwLock<Tables>,
    /// Dropped tables waiting for their last user to go away.
    dropped: Mutex<Vec<Arc<Table>>>,
    next_table_id: AtomicU32,
    queue: Arc<ApplyQueue>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.root)
            .field("tables", &self.tables.read().by_id.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl Engine {
    /// Opens the engine rooted at `root`, creating the directory if needed.
    ///
    /// Directories of dropped tables are deleted. Tables with unapplied
    /// transactions are queued for apply.
    pub fn open(root: impl AsRef<Path>, config: EngineConfig) -> EngineResult<Self> {
        config.validate().map_err(EngineError::config_error)?;
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let queue = Arc::new(ApplyQueue::new());
        let mut tables = Tables::default();
        let mut max_id = 0;

        let mut entries = fs::read_dir(&root)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(fs::DirEntry::file_name);
        for entry in entries {
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(dir_name) = file_name.to_str() else {
                continue;
            };
            let Some((_, table_id)) = TableToken::parse_dir_name(dir_name) else {
                continue;
            };
            max_id = max_id.max(table_id.get());

            let dir = entry.path();
            if dir.join(TABLE_DROPPED_FILE).exists() {
                fs::remove_dir_all(&dir)?;
                info!(dir = %dir.display(), "removed dropped table");
                continue;
            }
            if !dir.join(TABLE_NAME_FILE).exists() || !dir.join(TABLE_STATE_FILE).exists() {
                warn!(dir = %dir.display(), "skipping incomplete table directory");
                continue;
            }

            let table = Arc::new(Table::open(&root, dir_name, table_id, &config)?);
            let name = table.name();
            if tables.by_name.contains_key(&name) {
                warn!(table = %name, dir = %dir.display(), "duplicate table name, skipping");
                continue;
            }
            if table.storage().applied_txn() < table.sequencer().last_txn() {
                queue.push(table_id);
            }
            tables.insert(table);
        }

        info!(
            root = %root.display(),
            tables = tables.by_id.len(),
            pending = queue.len(),
            "opened engine"
        );
        Ok(Self {
            root,
            config,
            tables: RwLock::new(tables),
            dropped: Mutex::new(Vec::new()),
            next_table_id: AtomicU32::new(max_id + 1),
            queue,
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a table.
    pub fn create_table(&self, name: &str, structure: TableStructure) -> EngineResult<TableToken> {
        if !is_valid_name(name) {
            return Err(EngineError::InvalidTableName(name.to_string()));
        }
        let mut tables = self.tables.write();
        if tables.by_name.contains_key(name) {
            return Err(EngineError::TableExists(name.to_string()));
        }
        let table_id = TableId::new(self.next_table_id.fetch_add(1, Ordering::SeqCst));
        let token = TableToken::new(name, table_id);
        let table = Table::create(&self.root, token.clone(), &structure, &self.config)?;
        tables.insert(Arc::new(table));
        Ok(token)
    }

    /// Renames a table. Open writers and readers are unaffected.
    pub fn rename_table(&self, from: &str, to: &str) -> EngineResult<TableToken> {
        if !is_valid_name(to) {
            return Err(EngineError::InvalidTableName(to.to_string()));
        }
        let mut tables = self.tables.write();
        if tables.by_name.contains_key(to) {
            return Err(EngineError::TableExists(to.to_string()));
        }
        let table = tables
            .by_name
            .get(from)
            .cloned()
            .ok_or_else(|| EngineError::TableNotFound(from.to_string()))?;
        let token = table.rename(to)?;
        tables.by_name.remove(from);
        tables.by_name.insert(to.to_string(), table);
        info!(from, to, table_id = %token.table_id(), "renamed table");
        Ok(token)
    }

    /// Drops a table. Its files are deleted once no writer or reader uses
    /// it.
    pub fn drop_table(&self, name: &str) -> EngineResult<()> {
        let mut tables = self.tables.write();
        let table = tables
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::TableNotFound(name.to_string()))?;
        table.mark_dropped()?;
        tables.remove(name);
        drop(tables);

        info!(table = %name, table_id = %table.table_id(), "dropped table");
        self.dropped.lock().push(table);
        Ok(())
    }

    pub(crate) fn table(&self, name: &str) -> EngineResult<Arc<Table>> {
        self.tables
            .read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::TableNotFound(name.to_string()))
    }

    fn table_by_id(&self, table_id: TableId) -> Option<Arc<Table>> {
        self.tables.read().by_id.get(&table_id).cloned()
    }

    fn all_tables(&self) -> Vec<Arc<Table>> {
        self.tables.read().by_id.values().cloned().collect()
    }

    /// Token of the table called `name`.
    pub fn table_token(&self, name: &str) -> EngineResult<TableToken> {
        Ok(self.table(name)?.token())
    }

    /// All tables, ordered by name.
    pub fn tables(&self) -> Vec<TableToken> {
        let mut tokens: Vec<_> = self.tables.read().by_id.values().map(|t| t.token()).collect();
        tokens.sort_by(|a, b| a.name().cmp(b.name()));
        tokens
    }

    /// Opens a writer with its own WAL directory.
    pub fn writer(&self, name: &str) -> EngineResult<WalWriter> {
        let table = self.table(name)?;
        let appender = table.wal().acquire_appender()?;
        Ok(WalWriter::new(
            table,
            Arc::clone(&self.queue),
            appender,
            self.config.commit_retry.clone(),
        ))
    }

    /// Opens a reader on the latest applied snapshot.
    pub fn reader(&self, name: &str) -> EngineResult<TableReader> {
        Ok(self.table(name)?.storage().reader())
    }

    /// Latest committed structure.
    pub fn structure(&self, name: &str) -> EngineResult<Arc<TableStructure>> {
        Ok(self.table(name)?.sequencer().structure())
    }

    /// Last committed transaction.
    pub fn last_txn(&self, name: &str) -> EngineResult<TxnId> {
        Ok(self.table(name)?.sequencer().last_txn())
    }

    /// Reads up to `limit` commit records starting at `from`.
    pub fn read_txns(&self, name: &str, from: TxnId, limit: usize) -> EngineResult<Vec<TxnRecord>> {
        Ok(self.table(name)?.sequencer().read_txns(from, limit)?)
    }

    /// Last transaction visible to readers.
    pub fn last_applied_txn(&self, name: &str) -> EngineResult<TxnId> {
        Ok(self.table(name)?.storage().applied_txn())
    }

    /// What the apply pipeline of the table is doing.
    pub fn apply_state(&self, name: &str) -> EngineResult<ApplyState> {
        Ok(self.table(name)?.apply_state())
    }

    /// Returns true if applying the table stopped on an error.
    pub fn is_suspended(&self, name: &str) -> EngineResult<bool> {
        Ok(self.table(name)?.sequencer().is_suspended())
    }

    /// Why the table was suspended.
    pub fn suspend_reason(&self, name: &str) -> EngineResult<Option<SuspendReason>> {
        Ok(self.table(name)?.sequencer().suspend_reason())
    }

    /// Status of the table.
    pub fn status(&self, name: &str) -> EngineResult<TableStatus> {
        let table = self.table(name)?;
        let sequencer = table.sequencer();
        let snapshot = table.storage().snapshot();
        Ok(TableStatus {
            token: table.token(),
            last_txn: sequencer.last_txn(),
            applied_txn: snapshot.applied_txn(),
            structure_version: sequencer.structure_version(),
            state: table.apply_state(),
            suspend_reason: sequencer.suspend_reason(),
            partitions: snapshot.partitions().count(),
            rows: snapshot.row_count(),
            writers: table.wal().active_wal_count(),
        })
    }

    /// Clears a suspension; apply retries the failed transaction. Returns
    /// false if the table was not suspended.
    pub fn resume(&self, name: &str) -> EngineResult<bool> {
        let table = self.table(name)?;
        let resumed = table.sequencer().resume()?;
        if resumed {
            table.set_apply_state(ApplyState::Idle);
            self.queue.push(table.table_id());
            info!(table = %name, "resumed table");
        }
        Ok(resumed)
    }

    /// Clears a suspension and skips every transaction before `txn`.
    /// Structure changes among them are still applied.
    pub fn resume_from(&self, name: &str, txn: TxnId) -> EngineResult<()> {
        let table = self.table(name)?;
        apply::resume_from(&table, txn, &self.config.apply)?;
        self.queue.push(table.table_id());
        Ok(())
    }

    /// Runs background work on this thread until nothing is left to do.
    pub fn drain(&self) -> EngineResult<DrainStats> {
        let mut stats = DrainStats::default();
        loop {
            self.check_txns()?;
            let mut txns = 0;
            while let Some(table_id) = self.queue.pop() {
                let Some(table) = self.table_by_id(table_id) else {
                    continue;
                };
                let outcome = apply_pass(&table, &self.config.apply);
                txns += outcome.applied();
                if matches!(outcome, PassOutcome::Applied { more: true, .. }) {
                    self.queue.push(table_id);
                }
            }
            let segments = self.purge_wal()?;
            let versions = self.purge_partitions()?;
            let tables = self.purge_dropped()?;

            stats.txns += txns;
            stats.segments += segments;
            stats.versions += versions;
            stats.tables += tables;
            if txns == 0 && segments == 0 && versions == 0 && tables == 0 {
                break;
            }
        }
        debug!(?stats, "drained engine");
        Ok(stats)
    }

    /// Runs the purge jobs once, without applying anything.
    pub fn purge(&self) -> EngineResult<DrainStats> {
        Ok(DrainStats {
            txns: 0,
            segments: self.purge_wal()?,
            versions: self.purge_partitions()?,
            tables: self.purge_dropped()?,
        })
    }

    /// Starts the background workers.
    pub fn start_workers(self: &Arc<Self>) -> EngineResult<WorkerPool> {
        WorkerPool::start(default_jobs(self), &self.config.workers)
    }

    /// Applies the next queued table.
    pub(crate) fn apply_next(&self) -> Option<PassOutcome> {
        let table_id = self.queue.pop()?;
        let Some(table) = self.table_by_id(table_id) else {
            return Some(PassOutcome::Idle);
        };
        let outcome = apply_pass(&table, &self.config.apply);
        if outcome.needs_requeue() {
            self.queue.push(table_id);
        }
        Some(outcome)
    }

    /// Queues tables with unapplied transactions, suspending those whose
    /// pending transactions cannot be applied. Returns how many were queued.
    pub(crate) fn check_txns(&self) -> EngineResult<usize> {
        let mut queued = 0;
        for table in self.all_tables() {
            if self.check_table(&table)? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    fn check_table(&self, table: &Table) -> EngineResult<bool> {
        let sequencer = table.sequencer();
        let storage = table.storage();
        if table.is_dropped() || sequencer.is_suspended() {
            return Ok(false);
        }
        let applied = storage.applied_txn();
        let last = sequencer.last_txn();
        if applied > last {
            apply::suspend(
                table,
                applied,
                ErrorClass::Fatal,
                format!("applied txn {applied} is past the last committed txn {last}"),
            );
            return Ok(false);
        }
        if applied == last {
            return Ok(false);
        }

        let records = sequencer.read_txns(applied.next(), sequencer.config().read_batch_size)?;
        for record in records.iter().filter(|r| r.has_rows()) {
            if table.wal().segment_exists(record.wal_id, record.segment_id) {
                continue;
            }
            // Applied and purged since `applied` was read.
            if storage.applied_txn() >= record.txn {
                continue;
            }
            apply::suspend(
                table,
                record.txn,
                ErrorClass::Fatal,
                format!(
                    "wal segment {}/{} of txn {} is missing",
                    record.wal_id, record.segment_id, record.txn
                ),
            );
            return Ok(false);
        }
        Ok(self.queue.push(table.table_id()))
    }

    /// Deletes sealed WAL segments no unapplied transaction references.
    /// Returns how many were deleted.
    pub(crate) fn purge_wal(&self) -> EngineResult<usize> {
        let mut removed = 0;
        for table in self.all_tables() {
            removed += purge_table_wal(&table)?;
        }
        Ok(removed)
    }

    /// Deletes superseded partition versions no reader uses.
    pub(crate) fn purge_partitions(&self) -> EngineResult<usize> {
        let mut removed = 0;
        for table in self.all_tables() {
            removed += table.storage().purge_versions()?;
        }
        Ok(removed)
    }

    /// Deletes the directories of dropped tables nobody uses any more.
    pub(crate) fn purge_dropped(&self) -> EngineResult<usize> {
        let mut dropped = self.dropped.lock();
        let mut removed = 0;
        let mut kept = Vec::new();
        for table in dropped.drain(..) {
            if table.in_use() {
                kept.push(table);
                continue;
            }
            match fs::remove_dir_all(table.dir()) {
                Ok(()) => {
                    removed += 1;
                    info!(table = %table.token(), "deleted dropped table");
                }
                Err(err) => {
                    warn!(table = %table.token(), error = %err, "failed to delete dropped table");
                    kept.push(table);
                }
            }
        }
        *dropped = kept;
        Ok(removed)
    }
}

fn purge_table_wal(table: &Table) -> EngineResult<usize> {
    let wal = table.wal();
    // Listed before the watermark is read: a segment sealed after this point
    // is left for the next run.
    let sealed: Vec<_> = wal
        .list_segments()?
        .into_iter()
        .filter(|s| !wal.is_segment_active(s.wal_id, s.segment_id))
        .collect();

    let mut removed = 0;
    if !sealed.is_empty() {
        let needed = pending_segments(table)?;
        for segment in sealed {
            if needed.contains(&(segment.wal_id, segment.segment_id)) {
                continue;
            }
            if wal.remove_segment(segment.wal_id, segment.segment_id)? {
                removed += 1;
            }
        }
    }
    for wal_id in wal.list_wal_ids()? {
        if !wal.is_wal_active(wal_id) {
            wal.remove_wal_dir_if_empty(wal_id)?;
        }
    }
    if removed > 0 {
        debug!(table = %table.token(), removed, "purged wal segments");
    }
    Ok(removed)
}

/// Segments referenced by transactions not applied yet.
fn pending_segments(table: &Table) -> EngineResult<HashSet<(WalId, SegmentId)>> {
    let sequencer = table.sequencer();
    let mut from = table.storage().applied_txn().next();
    let last = sequencer.last_txn();
    let mut needed = HashSet::new();
    while from <= last {
        let records = sequencer.read_txns(from, sequencer.config().read_batch_size)?;
        let Some(tail) = records.last() else {
            break;
        };
        from = tail.txn.next();
        needed.extend(
            records
                .iter()
                .filter(|r| r.has_rows())
                .map(|r| (r.wal_id, r.segment_id)),
        );
    }
    Ok(needed)
}
