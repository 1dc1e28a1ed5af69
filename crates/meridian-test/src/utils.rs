//! Drivers that push a [`FuzzPlan`] through an engine, and helpers to read
//! tables back for comparison.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use meridian_common::types::{ColumnValue, Timestamp};
use meridian_engine::{
    Engine, EngineConfig, EngineError, EngineResult, PurgeConfig, TxnId, TxnKind, WalWriter, WorkerConfig,
};

use crate::fuzz::{FuzzPlan, FuzzTxn};

/// A table row as read back: timestamp and visible column values.
pub type Row = (Timestamp, Vec<ColumnValue>);

/// Engine configuration for tests: no fsync, fast background jobs.
pub fn test_config() -> EngineConfig {
    EngineConfig::builder()
        .sync(false)
        .purge(PurgeConfig {
            wal_purge_interval_ms: 5,
            partition_purge_interval_ms: 5,
            check_interval_ms: 20,
        })
        .workers(WorkerConfig::default().with_worker_count(2))
        .build()
}

/// Opens an engine with [`test_config`].
pub fn open_engine(dir: &Path) -> EngineResult<Engine> {
    Engine::open(dir, test_config())
}

/// Every row of `table`, in storage order.
pub fn table_rows(engine: &Engine, table: &str) -> EngineResult<Vec<Row>> {
    Ok(engine.reader(table)?.rows()?)
}

/// Rows in an order that does not depend on how commits interleaved.
pub fn canonical(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by_cached_key(|(ts, values)| (*ts, format!("{values:?}")));
    rows
}

/// Runs one transaction of a plan through `writer`.
pub fn write_txn(writer: &mut WalWriter, txn: &FuzzTxn) -> EngineResult<Option<TxnId>> {
    match txn {
        FuzzTxn::Data { rows, rollback } => {
            for row in rows {
                writer.new_row(row.ts)?;
                for (name, value) in &row.values {
                    writer.put(name, value.clone())?;
                }
                if row.cancelled {
                    writer.cancel_row();
                } else {
                    writer.append()?;
                }
            }
            if *rollback {
                writer.rollback();
                return Ok(None);
            }
            writer.commit()
        }
        FuzzTxn::Alter(change) => writer.alter(change.clone()).map(|(txn, _)| Some(txn)),
        FuzzTxn::Truncate => writer.truncate().map(Some),
    }
}

/// Creates `table` and commits the whole plan from a single writer.
/// Nothing is applied.
pub fn commit_sequential(engine: &Engine, table: &str, plan: &FuzzPlan) -> EngineResult<usize> {
    engine.create_table(table, plan.initial.clone())?;
    let mut writer = engine.writer(table)?;
    let mut committed = 0;
    for txn in &plan.txns {
        if write_txn(&mut writer, txn)?.is_some() {
            committed += 1;
        }
    }
    writer.close()?;
    Ok(committed)
}

/// Commits the plan from a single writer, then drains the engine.
pub fn run_sequential(engine: &Engine, table: &str, plan: &FuzzPlan) -> EngineResult<()> {
    let committed = commit_sequential(engine, table, plan)?;
    let stats = engine.drain()?;
    info!(seed = plan.seed, committed, applied = stats.txns, "sequential run done");
    Ok(())
}

/// How the concurrent run is driven.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrentOptions {
    /// Writer threads committing data transactions.
    pub writers: usize,
    /// Threads reloading readers while the plan runs.
    pub readers: usize,
    /// How long to wait for the background workers to catch up.
    pub timeout: Duration,
}

impl Default for ConcurrentOptions {
    fn default() -> Self {
        Self {
            writers: 3,
            readers: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Commits the plan from several writers at once while the engine's workers
/// apply and purge, and reader threads keep reloading.
///
/// Data transactions between two barriers are spread over the writers; a
/// barrier is committed once every writer is done with the data before it,
/// and all writers catch up with it before the next run of data.
///
/// Returns the txn each plan transaction was assigned, `None` where nothing
/// was committed.
pub fn run_concurrent(
    engine: &Arc<Engine>,
    table: &str,
    plan: &FuzzPlan,
    options: ConcurrentOptions,
) -> EngineResult<Vec<Option<TxnId>>> {
    engine.create_table(table, plan.initial.clone())?;
    let pool = engine.start_workers()?;
    let stop = AtomicBool::new(false);
    let reloads = AtomicUsize::new(0);
    let reader_errors: Mutex<Vec<EngineError>> = Mutex::new(Vec::new());

    let mut writers = (0..options.writers.max(1))
        .map(|_| engine.writer(table))
        .collect::<EngineResult<Vec<_>>>()?;

    let result = thread::scope(|scope| {
        for _ in 0..options.readers {
            scope.spawn(|| {
                if let Err(e) = reload_until(engine, table, &stop, &reloads) {
                    reader_errors.lock().push(e);
                }
            });
        }

        let assigned = commit_phases(plan, &mut writers);
        stop.store(true, Ordering::Release);
        assigned
    });
    let assigned = result?;
    if let Some(e) = reader_errors.into_inner().into_iter().next() {
        return Err(e);
    }

    for writer in writers {
        writer.close()?;
    }
    wait_applied(engine, table, options.timeout)?;
    pool.join()?;
    engine.drain()?;

    info!(
        seed = plan.seed,
        committed = assigned.iter().flatten().count(),
        writers = options.writers,
        reloads = reloads.load(Ordering::Relaxed),
        "concurrent run done"
    );
    Ok(assigned)
}

fn commit_phases(plan: &FuzzPlan, writers: &mut [WalWriter]) -> EngineResult<Vec<Option<TxnId>>> {
    let count = writers.len();
    let mut assigned = vec![None; plan.txns.len()];
    let mut start = 0;

    for (data, barrier) in plan.phases() {
        let results: Vec<EngineResult<Vec<(usize, TxnId)>>> = thread::scope(|scope| {
            let handles: Vec<_> = writers
                .iter_mut()
                .enumerate()
                .map(|(w, writer)| {
                    scope.spawn(move || -> EngineResult<Vec<(usize, TxnId)>> {
                        let mut done = Vec::new();
                        for (i, txn) in data.iter().enumerate().skip(w).step_by(count) {
                            if let Some(txn_id) = write_txn(writer, txn)? {
                                done.push((start + i, txn_id));
                            }
                        }
                        Ok(done)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });
        for result in results {
            for (index, txn_id) in result? {
                assigned[index] = Some(txn_id);
            }
        }
        start += data.len();

        if let Some(barrier) = barrier {
            if let Some(first) = writers.first_mut() {
                assigned[start] = write_txn(first, barrier)?;
            }
            for writer in writers.iter_mut() {
                writer.go_active()?;
            }
            debug!(txn = ?assigned[start], "barrier committed");
            start += 1;
        }
    }
    Ok(assigned)
}

/// Plan transactions in the order the commit log of `table` holds them.
///
/// `assigned` maps each plan transaction to its txn, as returned by
/// [`run_concurrent`]. Panics if the log and the plan disagree.
pub fn commit_order<'a>(
    engine: &Engine,
    table: &str,
    plan: &'a FuzzPlan,
    assigned: &[Option<TxnId>],
) -> EngineResult<Vec<&'a FuzzTxn>> {
    let by_txn: HashMap<TxnId, usize> = assigned
        .iter()
        .enumerate()
        .filter_map(|(index, txn)| txn.map(|txn| (txn, index)))
        .collect();

    let mut ordered = Vec::with_capacity(by_txn.len());
    let mut from = TxnId::FIRST;
    loop {
        let records = engine.read_txns(table, from, 256)?;
        let Some(last) = records.last() else {
            break;
        };
        from = last.txn.next();
        for record in &records {
            let Some(&index) = by_txn.get(&record.txn) else {
                panic!("txn {} is not in the plan", record.txn);
            };
            let txn = &plan.txns[index];
            let kind = match txn {
                FuzzTxn::Data { .. } => TxnKind::Data,
                FuzzTxn::Alter(_) => TxnKind::Structure,
                FuzzTxn::Truncate => TxnKind::Truncate,
            };
            assert_eq!(record.kind(), kind, "txn {}", record.txn);
            if let FuzzTxn::Data { rows, .. } = txn {
                let live = rows.iter().filter(|row| !row.cancelled).count() as u64;
                assert_eq!(record.row_count(), live, "txn {}", record.txn);
            }
            ordered.push(txn);
        }
    }
    assert_eq!(ordered.len(), by_txn.len(), "commit log of {table} is missing txns");
    Ok(ordered)
}

/// Creates `table`, commits `txns` in order from a single writer, then
/// drains. Each transaction must get the next txn.
pub fn replay(engine: &Engine, table: &str, plan: &FuzzPlan, txns: &[&FuzzTxn]) -> EngineResult<()> {
    engine.create_table(table, plan.initial.clone())?;
    let mut writer = engine.writer(table)?;
    let mut expected = TxnId::FIRST;
    for txn in txns {
        assert_eq!(write_txn(&mut writer, txn)?, Some(expected), "replay out of step");
        expected = expected.next();
    }
    writer.close()?;
    engine.drain()?;
    Ok(())
}

fn reload_until(engine: &Engine, table: &str, stop: &AtomicBool, reloads: &AtomicUsize) -> EngineResult<()> {
    let mut reader = engine.reader(table)?;
    let mut last = reader.applied_txn();
    while !stop.load(Ordering::Acquire) {
        if reader.reload() {
            let applied = reader.applied_txn();
            assert!(applied >= last, "reader went back from {last} to {applied}");
            let rows = reader.rows()?;
            assert_eq!(rows.len() as u64, reader.row_count());
            assert!(rows.windows(2).all(|w| w[0].0 <= w[1].0), "rows out of order at {applied}");
            last = applied;
            reloads.fetch_add(1, Ordering::Relaxed);
        } else {
            thread::sleep(Duration::from_millis(1));
        }
    }
    Ok(())
}

/// Waits until everything committed to `table` is applied.
pub fn wait_applied(engine: &Engine, table: &str, timeout: Duration) -> EngineResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let last = engine.last_txn(table)?;
        let applied = engine.last_applied_txn(table)?;
        if applied >= last {
            return Ok(());
        }
        if engine.is_suspended(table)? || Instant::now() >= deadline {
            let status = engine.status(table)?;
            panic!("table {table} did not catch up: {status:?}");
        }
        thread::sleep(Duration::from_millis(2));
    }
}
