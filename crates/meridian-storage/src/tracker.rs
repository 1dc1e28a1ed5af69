//! Reference counting of partition versions.
//!
//! Every partition version known to a table is in the tracker with a
//! lineage state and a reference count:
//!
//! - [`Lineage::Current`]: promoted in the latest snapshot. Never purged.
//! - [`Lineage::Superseded`]: replaced by a newer version, removed by a
//!   truncate, or orphaned by a publish that never completed.
//!
//! Readers and the applier hold [`VersionPin`]s. A version is purgeable
//! once it is superseded and no pin holds it. Pins are only ever taken on
//! versions of the current snapshot, so a superseded version whose count
//! dropped to zero can never be pinned again.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::partition::VersionRef;

/// Lineage state of a partition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lineage {
    Current,
    Superseded,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    lineage: Lineage,
    refs: u32,
}

/// Tracks lineage and references of a table's partition versions.
#[derive(Default)]
pub struct VersionTracker {
    entries: Mutex<HashMap<VersionRef, Entry>>,
    pins_taken: AtomicU64,
    purged: AtomicU64,
}

impl VersionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a version as current.
    pub fn promote(&self, version: VersionRef) {
        self.entries
            .lock()
            .entry(version)
            .and_modify(|e| e.lineage = Lineage::Current)
            .or_insert(Entry {
                lineage: Lineage::Current,
                refs: 0,
            });
    }

    /// Marks a version superseded. Unknown versions are registered as such.
    pub fn supersede(&self, version: VersionRef) {
        self.entries
            .lock()
            .entry(version)
            .and_modify(|e| e.lineage = Lineage::Superseded)
            .or_insert(Entry {
                lineage: Lineage::Superseded,
                refs: 0,
            });
    }

    /// Pins `versions` until the returned guard is dropped.
    pub fn pin(self: &Arc<Self>, versions: Vec<VersionRef>) -> VersionPin {
        {
            let mut entries = self.entries.lock();
            for version in &versions {
                entries
                    .entry(*version)
                    .or_insert(Entry {
                        lineage: Lineage::Current,
                        refs: 0,
                    })
                    .refs += 1;
            }
        }
        self.pins_taken.fetch_add(1, Ordering::Relaxed);
        VersionPin {
            tracker: Arc::clone(self),
            versions,
        }
    }

    fn unpin(&self, versions: &[VersionRef]) {
        let mut entries = self.entries.lock();
        for version in versions {
            if let Some(entry) = entries.get_mut(version) {
                entry.refs = entry.refs.saturating_sub(1);
            }
        }
    }

    /// Versions that are superseded and unreferenced.
    pub fn purgeable(&self) -> Vec<VersionRef> {
        let mut versions: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.lineage == Lineage::Superseded && e.refs == 0)
            .map(|(v, _)| *v)
            .collect();
        versions.sort();
        versions
    }

    /// Takes a purgeable version out of the tracker. Returns false if it is
    /// current, pinned or unknown; the caller must not delete it then.
    pub fn claim(&self, version: VersionRef) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&version) {
            Some(e) if e.lineage == Lineage::Superseded && e.refs == 0 => {
                entries.remove(&version);
                self.purged.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Reference count of a version, `None` if unknown.
    pub fn refs(&self, version: VersionRef) -> Option<u32> {
        self.entries.lock().get(&version).map(|e| e.refs)
    }

    /// Lineage of a version, `None` if unknown.
    pub fn lineage(&self, version: VersionRef) -> Option<Lineage> {
        self.entries.lock().get(&version).map(|e| e.lineage)
    }

    /// Returns tracker statistics.
    pub fn stats(&self) -> TrackerStats {
        let entries = self.entries.lock();
        TrackerStats {
            current: entries.values().filter(|e| e.lineage == Lineage::Current).count(),
            superseded: entries.values().filter(|e| e.lineage == Lineage::Superseded).count(),
            pinned: entries.values().filter(|e| e.refs > 0).count(),
            pins_taken: self.pins_taken.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for VersionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionTracker").field("stats", &self.stats()).finish()
    }
}

/// Statistics about tracked versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub current: usize,
    pub superseded: usize,
    /// Versions with at least one pin.
    pub pinned: usize,
    pub pins_taken: u64,
    pub purged: u64,
}

/// Keeps a set of versions referenced while held.
pub struct VersionPin {
    tracker: Arc<VersionTracker>,
    versions: Vec<VersionRef>,
}

impl VersionPin {
    /// Pinned versions.
    pub fn versions(&self) -> &[VersionRef] {
        &self.versions
    }
}

impl Drop for VersionPin {
    fn drop(&mut self) {
        self.tracker.unpin(&self.versions);
    }
}

impl fmt::Debug for VersionPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionPin").field("versions", &self.versions).finish()
    }
}
