//! Per-table WAL segment store.
//!
//! The store owns the `wal<N>/` directories of one table. It hands out wal
//! ids to writers, tracks which segments are still being written and which
//! are pinned by an apply pass, and deletes segments on behalf of the purge
//! job only when neither is the case.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use meridian_common::constants::{WAL_DIR_PREFIX, WAL_EVENTS_FILE};
use meridian_common::types::{SegmentId, TableId, WalId};

use crate::config::WalConfig;
use crate::error::{WalError, WalResult};
use crate::reader::SegmentReader;
use crate::writer::WalAppender;

type SegmentKey = (WalId, SegmentId);

/// In-process bookkeeping shared with pins.
#[derive(Debug, Default)]
struct Registry {
    next_wal_id: u32,
    active_wals: HashSet<WalId>,
    active_segments: HashSet<SegmentKey>,
    pins: HashMap<SegmentKey, usize>,
}

/// A segment found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentRef {
    /// Writer directory.
    pub wal_id: WalId,
    /// Segment.
    pub segment_id: SegmentId,
}

/// WAL segments of one table.
pub struct WalSegmentStore {
    table_dir: PathBuf,
    table_id: TableId,
    config: Arc<WalConfig>,
    registry: Arc<Mutex<Registry>>,
}

impl WalSegmentStore {
    /// Opens the store of the table in `table_dir`.
    ///
    /// Wal ids found on disk are never handed out again.
    pub fn open(table_dir: impl Into<PathBuf>, table_id: TableId, config: Arc<WalConfig>) -> WalResult<Self> {
        config.validate().map_err(WalError::config_error)?;
        let table_dir = table_dir.into();
        std::fs::create_dir_all(&table_dir)?;

        let max_on_disk = list_wal_ids(&table_dir)?.into_iter().max();
        let next_wal_id = max_on_disk.map_or(WalId::FIRST, WalId::next).get();

        Ok(Self {
            table_dir,
            table_id,
            config,
            registry: Arc::new(Mutex::new(Registry {
                next_wal_id,
                ..Registry::default()
            })),
        })
    }

    /// Returns the table ID.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Directory of writer `wal_id`.
    pub fn wal_dir(&self, wal_id: WalId) -> PathBuf {
        self.table_dir.join(format!("{WAL_DIR_PREFIX}{wal_id}"))
    }

    /// Directory of one segment.
    pub fn segment_dir(&self, wal_id: WalId, segment_id: SegmentId) -> PathBuf {
        self.wal_dir(wal_id).join(segment_id.to_string())
    }

    /// Events file of one segment.
    pub fn segment_path(&self, wal_id: WalId, segment_id: SegmentId) -> PathBuf {
        self.segment_dir(wal_id, segment_id).join(WAL_EVENTS_FILE)
    }

    /// Allocates a fresh wal id and returns an appender that owns it until
    /// dropped.
    pub fn acquire_appender(self: &Arc<Self>) -> WalResult<WalAppender> {
        let wal_id = {
            let mut registry = self.registry.lock();
            let wal_id = WalId::new(registry.next_wal_id);
            registry.next_wal_id += 1;
            registry.active_wals.insert(wal_id);
            wal_id
        };
        if let Err(err) = std::fs::create_dir_all(self.wal_dir(wal_id)) {
            self.release_wal(wal_id);
            return Err(err.into());
        }
        debug!(table_id = %self.table_id, %wal_id, "acquired wal");
        Ok(WalAppender::new(Arc::clone(self), wal_id))
    }

    pub(crate) fn release_wal(&self, wal_id: WalId) {
        let mut registry = self.registry.lock();
        registry.active_wals.remove(&wal_id);
        registry.active_segments.retain(|(wal, _)| *wal != wal_id);
    }

    pub(crate) fn register_segment(&self, wal_id: WalId, segment_id: SegmentId) {
        self.registry.lock().active_segments.insert((wal_id, segment_id));
    }

    pub(crate) fn unregister_segment(&self, wal_id: WalId, segment_id: SegmentId) {
        self.registry.lock().active_segments.remove(&(wal_id, segment_id));
    }

    /// Returns true if a writer still appends to the segment.
    pub fn is_segment_active(&self, wal_id: WalId, segment_id: SegmentId) -> bool {
        self.registry.lock().active_segments.contains(&(wal_id, segment_id))
    }

    /// Returns true if a writer owns `wal_id`.
    pub fn is_wal_active(&self, wal_id: WalId) -> bool {
        self.registry.lock().active_wals.contains(&wal_id)
    }

    /// Number of writers currently holding a wal id.
    pub fn active_wal_count(&self) -> usize {
        self.registry.lock().active_wals.len()
    }

    /// Pins a segment so the purge job leaves it alone until the pin drops.
    pub fn pin(&self, wal_id: WalId, segment_id: SegmentId) -> SegmentPin {
        let key = (wal_id, segment_id);
        *self.registry.lock().pins.entry(key).or_insert(0) += 1;
        SegmentPin {
            registry: Arc::clone(&self.registry),
            key,
        }
    }

    /// Returns true if any pin is held on the segment.
    pub fn is_pinned(&self, wal_id: WalId, segment_id: SegmentId) -> bool {
        self.registry.lock().pins.contains_key(&(wal_id, segment_id))
    }

    /// Returns true if the segment's events file exists.
    pub fn segment_exists(&self, wal_id: WalId, segment_id: SegmentId) -> bool {
        self.segment_path(wal_id, segment_id).is_file()
    }

    /// Reads a segment.
    pub fn open_reader(&self, wal_id: WalId, segment_id: SegmentId) -> WalResult<SegmentReader> {
        let path = self.segment_path(wal_id, segment_id);
        if !path.is_file() {
            return Err(WalError::SegmentNotFound { wal_id, segment_id });
        }
        SegmentReader::open(path)
    }

    /// Lists wal ids present on disk.
    pub fn list_wal_ids(&self) -> WalResult<Vec<WalId>> {
        list_wal_ids(&self.table_dir)
    }

    /// Lists all segments present on disk, in (wal, segment) order.
    pub fn list_segments(&self) -> WalResult<Vec<SegmentRef>> {
        let mut segments = Vec::new();
        for wal_id in self.list_wal_ids()? {
            let dir = self.wal_dir(wal_id);
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                if let Some(id) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                    segments.push(SegmentRef {
                        wal_id,
                        segment_id: SegmentId::new(id),
                    });
                }
            }
        }
        segments.sort();
        Ok(segments)
    }

    /// Deletes a segment unless it is active or pinned.
    ///
    /// Returns true if the segment was removed. The registry lock is held
    /// across the check and the deletion so no pin can sneak in between.
    pub fn remove_segment(&self, wal_id: WalId, segment_id: SegmentId) -> WalResult<bool> {
        let registry = self.registry.lock();
        let key = (wal_id, segment_id);
        if registry.active_segments.contains(&key) || registry.pins.contains_key(&key) {
            return Ok(false);
        }
        match std::fs::remove_dir_all(self.segment_dir(wal_id, segment_id)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        drop(registry);
        debug!(table_id = %self.table_id, %wal_id, %segment_id, "removed wal segment");
        Ok(true)
    }

    /// Removes the directory of a closed writer once it holds no segments.
    pub fn remove_wal_dir_if_empty(&self, wal_id: WalId) -> WalResult<bool> {
        let registry = self.registry.lock();
        if registry.active_wals.contains(&wal_id) {
            return Ok(false);
        }
        let dir = self.wal_dir(wal_id);
        let mut entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if entries.next().is_some() {
            return Ok(false);
        }
        std::fs::remove_dir(&dir)?;
        drop(registry);
        debug!(table_id = %self.table_id, %wal_id, "removed empty wal directory");
        Ok(true)
    }

    /// Returns the table directory.
    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }
}

impl std::fmt::Debug for WalSegmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("WalSegmentStore")
            .field("table_dir", &self.table_dir)
            .field("table_id", &self.table_id)
            .field("active_wals", &registry.active_wals.len())
            .field("active_segments", &registry.active_segments.len())
            .field("pins", &registry.pins.len())
            .finish()
    }
}

/// RAII pin on a segment; released on drop.
pub struct SegmentPin {
    registry: Arc<Mutex<Registry>>,
    key: SegmentKey,
}

impl SegmentPin {
    /// Pinned wal id.
    pub fn wal_id(&self) -> WalId {
        self.key.0
    }

    /// Pinned segment id.
    pub fn segment_id(&self) -> SegmentId {
        self.key.1
    }
}

impl Drop for SegmentPin {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        if let Some(count) = registry.pins.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                registry.pins.remove(&self.key);
            }
        }
    }
}

impl std::fmt::Debug for SegmentPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SegmentPin(wal{}/{})", self.key.0, self.key.1)
    }
}

fn list_wal_ids(table_dir: &Path) -> WalResult<Vec<WalId>> {
    let mut ids = Vec::new();
    let entries = match std::fs::read_dir(table_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(id) = name
            .strip_prefix(WAL_DIR_PREFIX)
            .and_then(|s| s.parse::<u32>().ok())
        {
            ids.push(WalId::new(id));
        }
    }
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::types::{ColumnBatch, ColumnValue, StructureVersion, Timestamp};
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> Arc<WalSegmentStore> {
        Arc::new(WalSegmentStore::open(tmp.path(), TableId::new(1), Arc::new(WalConfig::default())).unwrap())
    }

    fn one_row() -> ColumnBatch {
        let mut batch = ColumnBatch::new(1);
        batch.push_row(Timestamp::from_micros(1), [ColumnValue::Int(1)]);
        batch
    }

    #[test]
    fn test_wal_ids_are_unique() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let a = store.acquire_appender().unwrap();
        let b = store.acquire_appender().unwrap();
        assert_eq!(a.wal_id(), WalId::new(1));
        assert_eq!(b.wal_id(), WalId::new(2));
        assert_eq!(store.active_wal_count(), 2);
        drop(a);
        assert!(!store.is_wal_active(WalId::new(1)));

        let c = store.acquire_appender().unwrap();
        assert_eq!(c.wal_id(), WalId::new(3));
    }

    #[test]
    fn test_wal_ids_resume_after_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = store(&tmp);
            let _a = store.acquire_appender().unwrap();
            let _b = store.acquire_appender().unwrap();
        }
        let store = store(&tmp);
        assert_eq!(store.acquire_appender().unwrap().wal_id(), WalId::new(3));
    }

    #[test]
    fn test_remove_respects_active_and_pins() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut appender = store.acquire_appender().unwrap();
        let pos = appender.append(StructureVersion::INITIAL, one_row()).unwrap();

        assert!(store.is_segment_active(pos.wal_id, pos.segment_id));
        assert!(!store.remove_segment(pos.wal_id, pos.segment_id).unwrap());

        appender.close().unwrap();
        let pin = store.pin(pos.wal_id, pos.segment_id);
        assert!(!store.remove_segment(pos.wal_id, pos.segment_id).unwrap());
        assert!(!store.remove_wal_dir_if_empty(pos.wal_id).unwrap());

        drop(pin);
        assert!(store.remove_segment(pos.wal_id, pos.segment_id).unwrap());
        assert!(!store.segment_exists(pos.wal_id, pos.segment_id));
        assert!(store.remove_wal_dir_if_empty(pos.wal_id).unwrap());
        assert!(store.list_wal_ids().unwrap().is_empty());
    }

    #[test]
    fn test_list_segments_and_reader() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut appender = store.acquire_appender().unwrap();
        let pos = appender.append(StructureVersion::INITIAL, one_row()).unwrap();

        assert_eq!(
            store.list_segments().unwrap(),
            vec![SegmentRef {
                wal_id: pos.wal_id,
                segment_id: pos.segment_id
            }]
        );

        let reader = store.open_reader(pos.wal_id, pos.segment_id).unwrap();
        assert_eq!(reader.data_events().len(), 1);

        assert!(matches!(
            store.open_reader(WalId::new(9), SegmentId::new(0)),
            Err(WalError::SegmentNotFound { .. })
        ));
    }

    #[test]
    fn test_pins_nest() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let a = store.pin(WalId::new(1), SegmentId::new(0));
        let b = store.pin(WalId::new(1), SegmentId::new(0));
        drop(a);
        assert!(store.is_pinned(WalId::new(1), SegmentId::new(0)));
        drop(b);
        assert!(!store.is_pinned(WalId::new(1), SegmentId::new(0)));
    }
}
