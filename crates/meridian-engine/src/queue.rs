//! Queue of tables with transactions to apply.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use meridian_common::types::TableId;

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<TableId>,
    queued: HashSet<TableId>,
}

/// FIFO of dirty tables. A table is queued at most once.
#[derive(Debug, Default)]
pub struct ApplyQueue {
    inner: Mutex<Inner>,
}

impl ApplyQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a table. Returns false if it was already queued.
    pub fn push(&self, table_id: TableId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.queued.insert(table_id) {
            return false;
        }
        inner.order.push_back(table_id);
        true
    }

    /// Takes the table queued first.
    pub fn pop(&self) -> Option<TableId> {
        let mut inner = self.inner.lock();
        let table_id = inner.order.pop_front()?;
        inner.queued.remove(&table_id);
        Some(table_id)
    }

    /// Number of queued tables.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }
}
