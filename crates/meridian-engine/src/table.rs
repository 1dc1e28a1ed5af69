//! Open table: identity plus its sequencer, storage and WAL store.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use meridian_common::constants::{
    DATA_DIR, SEQUENCER_DIR, TABLE_DROPPED_FILE, TABLE_NAME_FILE, TEMP_SUFFIX,
};
use meridian_common::types::{TableId, TableStructure, TableToken};
use meridian_sequencer::TableSequencer;
use meridian_storage::{FsPartitionStore, TableStorage};
use meridian_wal::WalSegmentStore;

use crate::apply::ApplyState;
use crate::config::EngineConfig;
use crate::error::EngineResult;

pub(crate) struct Table {
    token: RwLock<TableToken>,
    dir: PathBuf,
    sequencer: Arc<TableSequencer>,
    storage: Arc<TableStorage>,
    wal: Arc<WalSegmentStore>,
    apply_lock: Mutex<()>,
    apply_state: Mutex<ApplyState>,
    dropped: AtomicBool,
    sync: bool,
}

impl Table {
    /// Creates the directory and files of a new table under `root`.
    pub(crate) fn create(
        root: &Path,
        token: TableToken,
        structure: &TableStructure,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        let dir = root.join(token.dir_name());
        fs::create_dir_all(&dir)?;
        let sync = config.storage.sync_writes;
        write_name(&dir, token.name(), sync)?;

        let sequencer = TableSequencer::create(
            dir.join(SEQUENCER_DIR),
            token.table_id(),
            structure,
            config.sequencer.clone(),
        )?;
        let store = FsPartitionStore::open(dir.join(DATA_DIR), structure.partition_by())?;
        let storage = TableStorage::create(&dir, Arc::new(store), sequencer.structure(), config.storage.clone())?;
        let wal = WalSegmentStore::open(&dir, token.table_id(), Arc::new(config.wal.clone()))?;
        if sync {
            sync_dir(root)?;
        }

        info!(table = %token, table_id = %token.table_id(), "created table");
        Ok(Self::assemble(token, dir, sequencer, storage, wal, sync))
    }

    /// Opens the table stored in `root/dir_name`.
    pub(crate) fn open(root: &Path, dir_name: &str, table_id: TableId, config: &EngineConfig) -> EngineResult<Self> {
        let dir = root.join(dir_name);
        let name = fs::read_to_string(dir.join(TABLE_NAME_FILE))?;
        let token = TableToken::from_parts(name.trim_end(), table_id, dir_name);

        let sequencer = TableSequencer::open(dir.join(SEQUENCER_DIR), table_id, config.sequencer.clone())?;
        let partition_by = sequencer.structure().partition_by();
        let store = FsPartitionStore::open(dir.join(DATA_DIR), partition_by)?;
        let storage = TableStorage::open(&dir, Arc::new(store), config.storage.clone(), |version| {
            sequencer.structure_at(version).ok().flatten()
        })?;
        let wal = WalSegmentStore::open(&dir, table_id, Arc::new(config.wal.clone()))?;

        debug!(
            table = %token,
            last_txn = %sequencer.last_txn(),
            applied_txn = %storage.applied_txn(),
            suspended = sequencer.is_suspended(),
            "opened table"
        );
        Ok(Self::assemble(token, dir, sequencer, storage, wal, config.storage.sync_writes))
    }

    fn assemble(
        token: TableToken,
        dir: PathBuf,
        sequencer: TableSequencer,
        storage: TableStorage,
        wal: WalSegmentStore,
        sync: bool,
    ) -> Self {
        let state = if sequencer.is_suspended() {
            ApplyState::Suspended
        } else {
            ApplyState::Idle
        };
        Self {
            token: RwLock::new(token),
            dir,
            sequencer: Arc::new(sequencer),
            storage: Arc::new(storage),
            wal: Arc::new(wal),
            apply_lock: Mutex::new(()),
            apply_state: Mutex::new(state),
            dropped: AtomicBool::new(false),
            sync,
        }
    }

    pub(crate) fn token(&self) -> TableToken {
        self.token.read().clone()
    }

    pub(crate) fn name(&self) -> String {
        self.token.read().name().to_string()
    }

    pub(crate) fn table_id(&self) -> TableId {
        self.sequencer.table_id()
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn sequencer(&self) -> &Arc<TableSequencer> {
        &self.sequencer
    }

    pub(crate) fn storage(&self) -> &Arc<TableStorage> {
        &self.storage
    }

    pub(crate) fn wal(&self) -> &Arc<WalSegmentStore> {
        &self.wal
    }

    /// Persists the new name. The directory keeps its original name.
    pub(crate) fn rename(&self, name: &str) -> EngineResult<TableToken> {
        let mut token = self.token.write();
        write_name(&self.dir, name, self.sync)?;
        *token = token.renamed(name);
        Ok(token.clone())
    }

    /// Refuses further commits and marks the directory for deletion.
    pub(crate) fn mark_dropped(&self) -> EngineResult<()> {
        self.sequencer.mark_dropped();
        self.dropped.store(true, Ordering::Release);
        let mut file = File::create(self.dir.join(TABLE_DROPPED_FILE))?;
        file.write_all(b"dropped\n")?;
        if self.sync {
            file.sync_all()?;
        }
        Ok(())
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// True while a writer, reader or apply pass still uses the table.
    pub(crate) fn in_use(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) > 1 || Arc::strong_count(&self.storage) > 1 || self.wal.active_wal_count() > 0
    }

    pub(crate) fn try_lock_apply(&self) -> Option<MutexGuard<'_, ()>> {
        self.apply_lock.try_lock()
    }

    pub(crate) fn lock_apply(&self) -> MutexGuard<'_, ()> {
        self.apply_lock.lock()
    }

    pub(crate) fn apply_state(&self) -> ApplyState {
        if self.sequencer.is_suspended() {
            return ApplyState::Suspended;
        }
        match *self.apply_state.lock() {
            ApplyState::Suspended => ApplyState::Idle,
            state => state,
        }
    }

    pub(crate) fn set_apply_state(&self, state: ApplyState) {
        *self.apply_state.lock() = state;
    }
}

fn write_name(dir: &Path, name: &str, sync: bool) -> EngineResult<()> {
    let path = dir.join(TABLE_NAME_FILE);
    let tmp = dir.join(format!("{TABLE_NAME_FILE}{TEMP_SUFFIX}"));
    {
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        file.write_all(name.as_bytes())?;
        if sync {
            file.sync_all()?;
        }
    }
    fs::rename(&tmp, &path)?;
    if sync {
        sync_dir(dir)?;
    }
    Ok(())
}

fn sync_dir(dir: &Path) -> EngineResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
