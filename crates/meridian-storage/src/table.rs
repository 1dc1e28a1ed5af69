//! Canonical storage of one table.
//!
//! `TableStorage` owns the table state file, the partition store and the
//! version tracker. It is mutated by exactly one applier at a time; every
//! mutation is a publish:
//!
//! 1. new partition versions are written (out-of-order merges, type
//!    changes) and in-order rows are appended to promoted versions past
//!    their committed row count,
//! 2. everything written is synced,
//! 3. the table state file is replaced (the commit point),
//! 4. the in-memory snapshot is swapped and the tracker updated.
//!
//! A failure before step 3 leaves readers and the durable state untouched:
//! new versions become orphans for the purge job and rows appended past a
//! committed count are cut by the next append.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use meridian_common::constants::TABLE_STATE_FILE;
use meridian_common::types::{
    ColumnBatch, ColumnType, PartitionKey, StructureChange, StructureVersion, TableStructure, TxnId,
};

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::partition::{PartitionStore, VersionRef};
use crate::reader::TableReader;
use crate::state::{PartitionEntry, TableState};
use crate::tracker::{VersionPin, VersionTracker};

/// Immutable view of a table as of one applied txn.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    applied_txn: TxnId,
    structure: Arc<TableStructure>,
    partitions: BTreeMap<PartitionKey, PartitionEntry>,
}

impl TableSnapshot {
    /// Highest applied txn.
    pub fn applied_txn(&self) -> TxnId {
        self.applied_txn
    }

    /// Structure the data is stored under.
    pub fn structure(&self) -> &Arc<TableStructure> {
        &self.structure
    }

    /// Promoted partitions in time order.
    pub fn partitions(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.partitions.values()
    }

    /// Promoted partition `key`.
    pub fn partition(&self, key: PartitionKey) -> Option<&PartitionEntry> {
        self.partitions.get(&key)
    }

    /// Total number of rows.
    pub fn row_count(&self) -> u64 {
        self.partitions.values().map(|p| p.rows).sum()
    }

    /// Promoted versions.
    pub fn versions(&self) -> Vec<VersionRef> {
        self.partitions
            .values()
            .map(|p| VersionRef::new(p.key, p.version))
            .collect()
    }

    fn to_state(&self, next_version: u64) -> TableState {
        TableState {
            applied_txn: self.applied_txn,
            structure_version: self.structure.version(),
            next_version,
            partitions: self.partitions.values().copied().collect(),
        }
    }
}

/// Rows of consecutive data transactions, published together.
#[derive(Debug)]
pub struct ApplyBatch {
    base: Arc<TableSnapshot>,
    last_txn: TxnId,
    txn_count: usize,
    row_count: usize,
    /// New rows per partition, in txn order.
    rows: BTreeMap<PartitionKey, ColumnBatch>,
}

impl ApplyBatch {
    fn new(base: Arc<TableSnapshot>) -> Self {
        Self {
            last_txn: base.applied_txn,
            base,
            txn_count: 0,
            row_count: 0,
            rows: BTreeMap::new(),
        }
    }

    fn expect_next(&self, txn: TxnId) -> StorageResult<()> {
        let expected = self.last_txn.next();
        if txn != expected {
            return Err(StorageError::OutOfOrder { expected, found: txn });
        }
        Ok(())
    }

    /// Adds the rows of data transaction `txn`, written against
    /// `structure_version`.
    pub fn add(&mut self, txn: TxnId, structure_version: StructureVersion, rows: &ColumnBatch) -> StorageResult<()> {
        self.expect_next(txn)?;
        let structure = &self.base.structure;
        if structure_version != structure.version() {
            return Err(StorageError::StructureMismatch {
                txn,
                expected: structure.version(),
                found: structure_version,
            });
        }
        let column_count = structure.column_count();
        if rows.column_count() > column_count {
            return Err(StorageError::corrupted(
                PathBuf::new(),
                format!("txn {txn} has {} columns, structure has {column_count}", rows.column_count()),
            ));
        }

        let partition_by = structure.partition_by();
        let mut split: BTreeMap<PartitionKey, Vec<usize>> = BTreeMap::new();
        for (index, ts) in rows.timestamps().iter().enumerate() {
            split.entry(partition_by.partition_of(*ts)).or_default().push(index);
        }
        for (key, indexes) in split {
            let mut part = rows.take(&indexes);
            part.pad_columns(column_count);
            self.rows
                .entry(key)
                .or_insert_with(|| ColumnBatch::new(column_count))
                .extend(&part);
        }

        self.last_txn = txn;
        self.txn_count += 1;
        self.row_count += rows.len();
        Ok(())
    }

    /// Adds a transaction with nothing to apply.
    pub fn skip(&mut self, txn: TxnId) -> StorageResult<()> {
        self.expect_next(txn)?;
        self.last_txn = txn;
        self.txn_count += 1;
        Ok(())
    }

    /// Returns true if no transaction was added.
    pub fn is_empty(&self) -> bool {
        self.txn_count == 0
    }

    /// Number of transactions added.
    pub fn txn_count(&self) -> usize {
        self.txn_count
    }

    /// Number of rows added.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Last transaction added (the applied txn before the batch if empty).
    pub fn last_txn(&self) -> TxnId {
        self.last_txn
    }

    /// Structure version the batch applies under.
    pub fn structure_version(&self) -> StructureVersion {
        self.base.structure.version()
    }
}

/// What a publish did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub rows: u64,
    /// Partitions appended to in place.
    pub appended: usize,
    /// Partition versions written from scratch.
    pub created: usize,
    /// Versions superseded.
    pub superseded: usize,
}

/// Versions written by one publish.
#[derive(Default)]
struct Changes {
    created: Vec<VersionRef>,
    appended: Vec<VersionRef>,
    superseded: Vec<VersionRef>,
}

/// Canonical storage of one table.
pub struct TableStorage {
    dir: PathBuf,
    store: Arc<dyn PartitionStore>,
    tracker: Arc<VersionTracker>,
    snapshot: RwLock<Arc<TableSnapshot>>,
    /// Serializes publishes.
    write_lock: Mutex<()>,
    next_version: AtomicU64,
    config: StorageConfig,
}

impl std::fmt::Debug for TableStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("TableStorage")
            .field("dir", &self.dir)
            .field("applied_txn", &snapshot.applied_txn)
            .field("partitions", &snapshot.partitions.len())
            .finish()
    }
}

impl TableStorage {
    /// Creates the storage of a new table in `dir`.
    pub fn create(
        dir: impl AsRef<Path>,
        store: Arc<dyn PartitionStore>,
        structure: Arc<TableStructure>,
        config: StorageConfig,
    ) -> StorageResult<Self> {
        config.validate().map_err(StorageError::config_error)?;
        let dir = dir.as_ref().to_path_buf();
        if dir.join(TABLE_STATE_FILE).exists() {
            return Err(StorageError::AlreadyExists(dir));
        }
        let state = TableState::new(structure.version());
        state.save(&dir, config.sync_writes)?;

        Ok(Self::assemble(dir, store, state, structure, config))
    }

    /// Opens the storage of an existing table. `structure_at` resolves the
    /// structure version recorded in the table state.
    pub fn open(
        dir: impl AsRef<Path>,
        store: Arc<dyn PartitionStore>,
        config: StorageConfig,
        structure_at: impl FnOnce(StructureVersion) -> Option<Arc<TableStructure>>,
    ) -> StorageResult<Self> {
        config.validate().map_err(StorageError::config_error)?;
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(TABLE_STATE_FILE);
        let mut state = TableState::load(&dir)?
            .ok_or_else(|| StorageError::corrupted(&path, "table state missing"))?;
        let structure = structure_at(state.structure_version).ok_or_else(|| {
            StorageError::corrupted(&path, format!("unknown structure version {}", state.structure_version))
        })?;

        let listed = store.list_versions()?;
        for entry in &state.partitions {
            let version = VersionRef::new(entry.key, entry.version);
            if listed.binary_search(&version).is_err() {
                return Err(StorageError::VersionNotFound(version));
            }
        }
        if let Some(max) = listed.iter().map(|v| v.version).max() {
            state.next_version = state.next_version.max(max + 1);
        }

        let storage = Self::assemble(dir, store, state, structure, config);
        let promoted = storage.snapshot().versions();
        let mut orphans = 0;
        for version in listed {
            if promoted.binary_search(&version).is_err() {
                storage.tracker.supersede(version);
                orphans += 1;
            }
        }
        info!(
            dir = %storage.dir.display(),
            applied_txn = %storage.applied_txn(),
            orphans,
            "opened table storage"
        );
        Ok(storage)
    }

    fn assemble(
        dir: PathBuf,
        store: Arc<dyn PartitionStore>,
        state: TableState,
        structure: Arc<TableStructure>,
        config: StorageConfig,
    ) -> Self {
        let tracker = Arc::new(VersionTracker::new());
        let snapshot = TableSnapshot {
            applied_txn: state.applied_txn,
            structure,
            partitions: state.partitions.iter().map(|p| (p.key, *p)).collect(),
        };
        for version in snapshot.versions() {
            tracker.promote(version);
        }
        Self {
            dir,
            store,
            tracker,
            snapshot: RwLock::new(Arc::new(snapshot)),
            write_lock: Mutex::new(()),
            next_version: AtomicU64::new(state.next_version),
            config,
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Highest applied txn.
    pub fn applied_txn(&self) -> TxnId {
        self.snapshot.read().applied_txn
    }

    /// Current structure.
    pub fn structure(&self) -> Arc<TableStructure> {
        Arc::clone(&self.snapshot.read().structure)
    }

    /// Opens a reader pinned to the current snapshot.
    pub fn reader(self: &Arc<Self>) -> TableReader {
        let (snapshot, pin) = self.pin_current();
        TableReader::new(Arc::clone(self), snapshot, pin)
    }

    /// Pins the versions of the current snapshot. The snapshot lock is held
    /// while pinning so a concurrent publish cannot supersede them first.
    pub(crate) fn pin_current(&self) -> (Arc<TableSnapshot>, VersionPin) {
        let guard = self.snapshot.read();
        let snapshot = Arc::clone(&guard);
        let pin = self.tracker.pin(snapshot.versions());
        (snapshot, pin)
    }

    /// Starts a batch on top of the current snapshot.
    pub fn begin_batch(&self) -> ApplyBatch {
        ApplyBatch::new(self.snapshot())
    }

    /// Publishes a batch.
    pub fn publish(&self, batch: ApplyBatch) -> StorageResult<PublishStats> {
        let _guard = self.write_lock.lock();
        let base = self.snapshot();
        if !Arc::ptr_eq(&base, &batch.base) {
            return Err(StorageError::StaleBatch);
        }
        if batch.is_empty() {
            return Ok(PublishStats::default());
        }

        // The merge reads the promoted versions it replaces.
        let _pin = self.tracker.pin(base.versions());
        let mut next = (*base).clone();
        next.applied_txn = batch.last_txn;
        let mut changes = Changes::default();

        let result = batch
            .rows
            .into_iter()
            .try_for_each(|(key, rows)| self.merge_partition(&mut next, key, rows, &mut changes))
            .and_then(|()| self.commit(&next, &changes));
        if let Err(err) = result {
            self.abandon(&changes);
            return Err(err);
        }

        let stats = PublishStats {
            rows: batch.row_count as u64,
            appended: changes.appended.len(),
            created: changes.created.len(),
            superseded: changes.superseded.len(),
        };
        self.install(next, &changes);
        debug!(
            dir = %self.dir.display(),
            applied_txn = %batch.last_txn,
            txns = batch.txn_count,
            rows = stats.rows,
            created = stats.created,
            appended = stats.appended,
            "published batch"
        );
        Ok(stats)
    }

    /// Applies the structure change committed as `txn`, producing `structure`.
    /// A column type change rewrites every partition.
    pub fn apply_structure(
        &self,
        txn: TxnId,
        structure: Arc<TableStructure>,
        change: &StructureChange,
    ) -> StorageResult<PublishStats> {
        let _guard = self.write_lock.lock();
        let base = self.snapshot();
        let expected = base.applied_txn.next();
        if txn != expected {
            return Err(StorageError::OutOfOrder { expected, found: txn });
        }
        if structure.version() != base.structure.version().next() {
            return Err(StorageError::StructureMismatch {
                txn,
                expected: base.structure.version().next(),
                found: structure.version(),
            });
        }

        let _pin = self.tracker.pin(base.versions());
        let mut next = (*base).clone();
        next.applied_txn = txn;
        next.structure = Arc::clone(&structure);
        let mut changes = Changes::default();

        let result = match change {
            StructureChange::ChangeColumnType { name, column_type } => {
                let index = base.structure.column_index(name).ok_or_else(|| {
                    StorageError::corrupted(PathBuf::new(), format!("txn {txn} changes unknown column {name}"))
                })?;
                self.rewrite_column(&mut next, index, *column_type, &mut changes)
            }
            _ => Ok(()),
        }
        .and_then(|()| self.commit(&next, &changes));
        if let Err(err) = result {
            self.abandon(&changes);
            return Err(err);
        }

        let stats = PublishStats {
            rows: 0,
            appended: 0,
            created: changes.created.len(),
            superseded: changes.superseded.len(),
        };
        self.install(next, &changes);
        info!(
            dir = %self.dir.display(),
            txn = %txn,
            version = %structure.version(),
            change = %change,
            rewritten = stats.created,
            "applied structure change"
        );
        Ok(stats)
    }

    /// Removes every row; committed as `txn`.
    pub fn truncate(&self, txn: TxnId) -> StorageResult<PublishStats> {
        let _guard = self.write_lock.lock();
        let base = self.snapshot();
        let expected = base.applied_txn.next();
        if txn != expected {
            return Err(StorageError::OutOfOrder { expected, found: txn });
        }

        let mut next = (*base).clone();
        next.applied_txn = txn;
        next.partitions.clear();
        let changes = Changes {
            superseded: base.versions(),
            ..Changes::default()
        };
        self.commit(&next, &changes)?;

        let stats = PublishStats {
            superseded: changes.superseded.len(),
            ..PublishStats::default()
        };
        self.install(next, &changes);
        info!(dir = %self.dir.display(), txn = %txn, "truncated table");
        Ok(stats)
    }

    /// Moves the watermark to `txn` without applying anything. Used when an
    /// operator skips transactions.
    pub fn skip_to(&self, txn: TxnId) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        let base = self.snapshot();
        if txn <= base.applied_txn {
            return Ok(());
        }
        let mut next = (*base).clone();
        next.applied_txn = txn;
        self.commit(&next, &Changes::default())?;
        self.install(next, &Changes::default());
        info!(dir = %self.dir.display(), txn = %txn, "skipped to txn");
        Ok(())
    }

    /// Deletes superseded, unreferenced partition versions. Returns how many
    /// were deleted.
    pub fn purge_versions(&self) -> StorageResult<usize> {
        let mut removed = 0;
        for version in self.tracker.purgeable() {
            if !self.tracker.claim(version) {
                continue;
            }
            if let Err(err) = self.store.remove_version(version) {
                // Still superseded; the next run retries.
                self.tracker.supersede(version);
                return Err(err);
            }
            debug!(dir = %self.dir.display(), version = %version, "purged partition version");
            removed += 1;
        }
        Ok(removed)
    }

    fn allocate_version(&self, key: PartitionKey, changes: &mut Changes) -> StorageResult<VersionRef> {
        let version = VersionRef::new(key, self.next_version.fetch_add(1, Ordering::AcqRel));
        self.store.create_version(version)?;
        changes.created.push(version);
        Ok(version)
    }

    fn merge_partition(
        &self,
        next: &mut TableSnapshot,
        key: PartitionKey,
        rows: ColumnBatch,
        changes: &mut Changes,
    ) -> StorageResult<()> {
        let rows = rows.sorted_by_timestamp();
        let (Some(min_ts), Some(max_ts)) = (rows.min_timestamp(), rows.max_timestamp()) else {
            return Ok(());
        };
        let count = rows.len() as u64;

        let entry = match next.partitions.get(&key).copied() {
            None => {
                let version = self.allocate_version(key, changes)?;
                self.store.append_rows(version, 0, &rows)?;
                PartitionEntry {
                    key,
                    version: version.version,
                    rows: count,
                    min_ts,
                    max_ts,
                }
            }
            Some(entry) if min_ts >= entry.max_ts => {
                let version = VersionRef::new(key, entry.version);
                self.store.append_rows(version, entry.rows, &rows)?;
                changes.appended.push(version);
                PartitionEntry {
                    rows: entry.rows + count,
                    max_ts,
                    ..entry
                }
            }
            Some(entry) => {
                let old = VersionRef::new(key, entry.version);
                let version = self.allocate_version(key, changes)?;
                let column_count = next.structure.column_count();
                self.merge_out_of_order(old, entry.rows, &rows, version, column_count)?;
                changes.superseded.push(old);
                PartitionEntry {
                    key,
                    version: version.version,
                    rows: entry.rows + count,
                    min_ts: entry.min_ts.min(min_ts),
                    max_ts: entry.max_ts.max(max_ts),
                }
            }
        };
        next.partitions.insert(key, entry);
        Ok(())
    }

    /// Writes the sorted merge of `old` and `rows` into `target`, reading
    /// `old` in chunks. Existing rows go first on equal timestamps.
    fn merge_out_of_order(
        &self,
        old: VersionRef,
        old_rows: u64,
        rows: &ColumnBatch,
        target: VersionRef,
        column_count: usize,
    ) -> StorageResult<()> {
        let chunk = self.config.o3_merge_chunk_rows as u64;
        let new_ts = rows.timestamps();
        let mut next_new = 0;
        let mut written = 0;
        let mut lo = 0;

        while lo < old_rows {
            let hi = (lo + chunk).min(old_rows);
            let existing = self.store.read_rows(old, lo, hi, column_count)?;
            let mut out = ColumnBatch::new(column_count);
            for (ts, values) in existing.rows() {
                while next_new < rows.len() && new_ts[next_new] < ts {
                    push_row_of(&mut out, rows, next_new);
                    next_new += 1;
                }
                out.push_row(ts, values);
            }
            self.store.append_rows(target, written, &out)?;
            written += out.len() as u64;
            lo = hi;
        }

        if next_new < rows.len() {
            let rest = rows.slice(next_new, rows.len());
            self.store.append_rows(target, written, &rest)?;
        }
        Ok(())
    }

    fn rewrite_column(
        &self,
        next: &mut TableSnapshot,
        index: usize,
        column_type: ColumnType,
        changes: &mut Changes,
    ) -> StorageResult<()> {
        let column_count = next.structure.column_count();
        let chunk = self.config.o3_merge_chunk_rows as u64;
        let entries: Vec<PartitionEntry> = next.partitions.values().copied().collect();

        for entry in entries {
            let old = VersionRef::new(entry.key, entry.version);
            let version = self.allocate_version(entry.key, changes)?;
            let mut lo = 0;
            while lo < entry.rows {
                let hi = (lo + chunk).min(entry.rows);
                let mut rows = self.store.read_rows(old, lo, hi, column_count)?;
                if let Some(values) = rows.column_mut(index) {
                    for value in values.iter_mut() {
                        *value = value.cast(column_type);
                    }
                }
                self.store.append_rows(version, lo, &rows)?;
                lo = hi;
            }
            changes.superseded.push(old);
            next.partitions.insert(
                entry.key,
                PartitionEntry {
                    version: version.version,
                    ..entry
                },
            );
        }
        Ok(())
    }

    /// Syncs everything written and replaces the state file.
    fn commit(&self, next: &TableSnapshot, changes: &Changes) -> StorageResult<()> {
        if self.config.sync_writes {
            for version in changes.created.iter().chain(&changes.appended) {
                self.store.sync_version(*version)?;
            }
        }
        next.to_state(self.next_version.load(Ordering::Acquire))
            .save(&self.dir, self.config.sync_writes)
    }

    fn install(&self, next: TableSnapshot, changes: &Changes) {
        let mut guard = self.snapshot.write();
        *guard = Arc::new(next);
        for version in &changes.created {
            self.tracker.promote(*version);
        }
        for version in &changes.superseded {
            self.tracker.supersede(*version);
        }
    }

    /// Leaves versions written by a failed publish to the purge job.
    fn abandon(&self, changes: &Changes) {
        for version in &changes.created {
            self.tracker.supersede(*version);
        }
    }

    /// Table directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Partition store.
    pub fn store(&self) -> &Arc<dyn PartitionStore> {
        &self.store
    }

    /// Version tracker.
    pub fn tracker(&self) -> &Arc<VersionTracker> {
        &self.tracker
    }

    /// Configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
}

fn push_row_of(out: &mut ColumnBatch, rows: &ColumnBatch, index: usize) {
    if let Some((ts, values)) = rows.row(index) {
        out.push_row(ts, values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{FaultOp, FsPartitionStore, MemPartitionStore};
    use crate::tracker::Lineage;
    use meridian_common::types::{ColumnValue, PartitionBy, Timestamp};
    use std::io;
    use tempfile::TempDir;

    const HOUR: i64 = 3_600_000_000;

    fn structure() -> Arc<TableStructure> {
        Arc::new(
            TableStructure::builder("ts", PartitionBy::Day)
                .column("v", ColumnType::Int)
                .build()
                .unwrap(),
        )
    }

    fn rows(values: &[(i64, i32)]) -> ColumnBatch {
        let mut batch = ColumnBatch::new(1);
        for &(hour, v) in values {
            batch.push_row(Timestamp::from_micros(hour * HOUR), [ColumnValue::Int(v)]);
        }
        batch
    }

    fn values(storage: &Arc<TableStorage>) -> Vec<(i64, ColumnValue)> {
        storage
            .reader()
            .rows()
            .unwrap()
            .into_iter()
            .map(|(ts, v)| (ts.as_micros() / HOUR, v[0].clone()))
            .collect()
    }

    fn mem_storage(tmp: &TempDir, config: StorageConfig) -> (Arc<MemPartitionStore>, Arc<TableStorage>) {
        let store = Arc::new(MemPartitionStore::new());
        let storage = TableStorage::create(tmp.path(), store.clone(), structure(), config).unwrap();
        (store, Arc::new(storage))
    }

    fn publish(storage: &TableStorage, txn: u64, data: &[(i64, i32)]) -> PublishStats {
        let mut batch = storage.begin_batch();
        batch
            .add(TxnId::new(txn), StructureVersion::INITIAL, &rows(data))
            .unwrap();
        storage.publish(batch).unwrap()
    }

    #[test]
    fn test_in_order_rows_are_appended_in_place() {
        let tmp = TempDir::new().unwrap();
        let (_, storage) = mem_storage(&tmp, StorageConfig::default());

        let stats = publish(&storage, 1, &[(1, 10), (2, 20)]);
        assert_eq!(stats.created, 1);
        let reader = storage.reader();

        let stats = publish(&storage, 2, &[(2, 21), (3, 30)]);
        assert_eq!(stats.appended, 1);
        assert_eq!(stats.created, 0);

        assert_eq!(storage.applied_txn(), TxnId::new(2));
        assert_eq!(
            values(&storage),
            vec![
                (1, ColumnValue::Int(10)),
                (2, ColumnValue::Int(20)),
                (2, ColumnValue::Int(21)),
                (3, ColumnValue::Int(30)),
            ]
        );
        // The older reader still sees its row count.
        assert_eq!(reader.rows().unwrap().len(), 2);
        assert_eq!(reader.applied_txn(), TxnId::new(1));
    }

    #[test]
    fn test_out_of_order_rows_create_a_new_version() {
        let tmp = TempDir::new().unwrap();
        let (store, storage) = mem_storage(&tmp, StorageConfig::default());
        publish(&storage, 1, &[(5, 50), (10, 100)]);
        let old = storage.snapshot().versions()[0];

        let mut reader = storage.reader();
        let stats = publish(&storage, 2, &[(10, 101), (1, 10)]);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.superseded, 1);

        // Existing rows go first on equal timestamps.
        assert_eq!(
            values(&storage),
            vec![
                (1, ColumnValue::Int(10)),
                (5, ColumnValue::Int(50)),
                (10, ColumnValue::Int(100)),
                (10, ColumnValue::Int(101)),
            ]
        );

        assert_eq!(storage.tracker().lineage(old), Some(Lineage::Superseded));
        assert_eq!(storage.purge_versions().unwrap(), 0);
        assert!(store.stored_rows(old).is_some());
        assert_eq!(reader.rows().unwrap().len(), 2);

        assert!(reader.reload());
        assert_eq!(reader.rows().unwrap().len(), 4);
        assert_eq!(storage.purge_versions().unwrap(), 1);
        assert!(store.stored_rows(old).is_none());
    }

    #[test]
    fn test_merge_in_chunks() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig::default().with_o3_merge_chunk_rows(2);
        let (_, storage) = mem_storage(&tmp, config);
        publish(&storage, 1, &[(2, 2), (4, 4), (6, 6), (8, 8), (10, 10)]);
        publish(&storage, 2, &[(9, 9), (1, 1), (5, 5), (11, 11), (4, 40)]);

        let got: Vec<_> = values(&storage).into_iter().map(|(h, _)| h).collect();
        assert_eq!(got, vec![1, 2, 4, 4, 5, 6, 8, 9, 10, 11]);
        let fours: Vec<_> = values(&storage).into_iter().filter(|(h, _)| *h == 4).collect();
        assert_eq!(fours, vec![(4, ColumnValue::Int(4)), (4, ColumnValue::Int(40))]);
    }

    #[test]
    fn test_rows_split_by_partition() {
        let tmp = TempDir::new().unwrap();
        let (_, storage) = mem_storage(&tmp, StorageConfig::default());
        publish(&storage, 1, &[(30, 3), (1, 1), (50, 5)]);
        let snapshot = storage.snapshot();
        assert_eq!(snapshot.partitions().count(), 3);
        assert_eq!(snapshot.row_count(), 3);
        let got: Vec<_> = values(&storage).into_iter().map(|(h, _)| h).collect();
        assert_eq!(got, vec![1, 30, 50]);
    }

    #[test]
    fn test_failed_publish_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        let (store, storage) = mem_storage(&tmp, StorageConfig::default());
        publish(&storage, 1, &[(5, 50)]);

        store.inject_fault(FaultOp::Sync, 1, io::ErrorKind::Other);
        let mut batch = storage.begin_batch();
        batch.add(TxnId::new(2), StructureVersion::INITIAL, &rows(&[(1, 10), (6, 60)])).unwrap();
        let err = storage.publish(batch).unwrap_err();
        assert!(err.class().is_fatal());

        assert_eq!(storage.applied_txn(), TxnId::new(1));
        assert_eq!(values(&storage), vec![(5, ColumnValue::Int(50))]);
        assert_eq!(TableState::load(tmp.path()).unwrap().unwrap().applied_txn, TxnId::new(1));

        // The half-written version is an orphan.
        assert_eq!(storage.purge_versions().unwrap(), 1);

        publish(&storage, 2, &[(1, 10), (6, 60)]);
        assert_eq!(values(&storage).len(), 3);
    }

    #[test]
    fn test_batch_order_and_structure_checks() {
        let tmp = TempDir::new().unwrap();
        let (_, storage) = mem_storage(&tmp, StorageConfig::default());
        let mut batch = storage.begin_batch();
        let err = batch.add(TxnId::new(2), StructureVersion::INITIAL, &rows(&[(1, 1)])).unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrder { .. }));

        let err = batch.add(TxnId::new(1), StructureVersion::new(1), &rows(&[(1, 1)])).unwrap_err();
        assert!(matches!(err, StorageError::StructureMismatch { .. }));

        batch.skip(TxnId::new(1)).unwrap();
        batch.add(TxnId::new(2), StructureVersion::INITIAL, &rows(&[(1, 1)])).unwrap();
        assert_eq!(batch.txn_count(), 2);
        assert_eq!(batch.row_count(), 1);

        let stale = storage.begin_batch();
        storage.publish(batch).unwrap();
        assert!(matches!(storage.publish(stale), Err(StorageError::StaleBatch)));
        assert_eq!(storage.applied_txn(), TxnId::new(2));
    }

    #[test]
    fn test_structure_changes() {
        let tmp = TempDir::new().unwrap();
        let (_, storage) = mem_storage(&tmp, StorageConfig::default());
        publish(&storage, 1, &[(1, 10)]);

        let add = StructureChange::AddColumn {
            name: "w".into(),
            column_type: ColumnType::Varchar,
        };
        let s1 = Arc::new(storage.structure().apply(&add).unwrap());
        let stats = storage.apply_structure(TxnId::new(2), s1.clone(), &add).unwrap();
        assert_eq!(stats.created, 0);

        let mut batch = storage.begin_batch();
        let mut wide = ColumnBatch::new(2);
        wide.push_row(Timestamp::from_micros(2 * HOUR), [ColumnValue::Int(20), ColumnValue::from("x")]);
        batch.add(TxnId::new(3), s1.version(), &wide).unwrap();
        storage.publish(batch).unwrap();

        let rows = storage.reader().rows().unwrap();
        assert_eq!(rows[0].1, vec![ColumnValue::Int(10), ColumnValue::Null]);
        assert_eq!(rows[1].1, vec![ColumnValue::Int(20), ColumnValue::from("x")]);

        let change = StructureChange::ChangeColumnType {
            name: "v".into(),
            column_type: ColumnType::Long,
        };
        let s2 = Arc::new(s1.apply(&change).unwrap());
        let stats = storage.apply_structure(TxnId::new(4), s2, &change).unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.superseded, 1);

        let rows = storage.reader().rows().unwrap();
        assert_eq!(rows[0].1[0], ColumnValue::Long(10));
        assert_eq!(rows[1].1[0], ColumnValue::Long(20));

        let drop = StructureChange::DropColumn { name: "w".into() };
        let s3 = Arc::new(storage.structure().apply(&drop).unwrap());
        storage.apply_structure(TxnId::new(5), s3, &drop).unwrap();
        let reader = storage.reader();
        assert_eq!(reader.column_names(), vec!["v".to_string()]);
        assert_eq!(reader.rows().unwrap()[1].1, vec![ColumnValue::Long(20)]);
    }

    #[test]
    fn test_truncate() {
        let tmp = TempDir::new().unwrap();
        let (_, storage) = mem_storage(&tmp, StorageConfig::default());
        publish(&storage, 1, &[(1, 10), (30, 30)]);
        let stats = storage.truncate(TxnId::new(2)).unwrap();
        assert_eq!(stats.superseded, 2);
        assert_eq!(storage.snapshot().row_count(), 0);
        assert_eq!(storage.purge_versions().unwrap(), 2);

        publish(&storage, 3, &[(1, 11)]);
        assert_eq!(values(&storage), vec![(1, ColumnValue::Int(11))]);
    }

    #[test]
    fn test_reopen_on_disk() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data");
        {
            let store = Arc::new(FsPartitionStore::open(&data, PartitionBy::Day).unwrap());
            let storage = TableStorage::create(tmp.path(), store, structure(), StorageConfig::default()).unwrap();
            publish(&storage, 1, &[(5, 50), (1, 10)]);
            publish(&storage, 2, &[(3, 30)]);
        }

        let store = Arc::new(FsPartitionStore::open(&data, PartitionBy::Day).unwrap());
        let storage = Arc::new(
            TableStorage::open(tmp.path(), store, StorageConfig::default(), |version| {
                (version == StructureVersion::INITIAL).then(structure)
            })
            .unwrap(),
        );
        assert_eq!(storage.applied_txn(), TxnId::new(2));
        assert_eq!(
            values(&storage),
            vec![
                (1, ColumnValue::Int(10)),
                (3, ColumnValue::Int(30)),
                (5, ColumnValue::Int(50)),
            ]
        );
        // The version superseded by txn 2 is found again as an orphan.
        assert_eq!(storage.purge_versions().unwrap(), 1);
        publish(&storage, 3, &[(6, 60)]);
        assert_eq!(values(&storage).len(), 4);
    }

    #[test]
    fn test_skip_to() {
        let tmp = TempDir::new().unwrap();
        let (_, storage) = mem_storage(&tmp, StorageConfig::default());
        storage.skip_to(TxnId::new(4)).unwrap();
        assert_eq!(storage.applied_txn(), TxnId::new(4));
        storage.skip_to(TxnId::new(2)).unwrap();
        assert_eq!(storage.applied_txn(), TxnId::new(4));
        publish(&storage, 5, &[(1, 1)]);
    }
}
