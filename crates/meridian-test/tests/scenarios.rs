//! End-to-end scenarios with hand-written transactions.

use std::sync::Arc;

use meridian_common::types::{ColumnType, ColumnValue, PartitionBy, StructureChange, TableStructure, Timestamp, TxnId};
use meridian_engine::jobs::{ApplyJob, Job, JobOutcome};
use meridian_engine::{ApplyConfig, EngineConfig, EngineError, WalWriter};
use meridian_sequencer::SequencerError;
use meridian_test::utils::test_config;
use meridian_test::{open_engine, table_rows};
use tempfile::TempDir;

const MINUTE: i64 = 60_000_000;

fn at(hour: i64, minute: i64) -> Timestamp {
    Timestamp::from_micros((hour * 60 + minute) * MINUTE)
}

fn structure() -> TableStructure {
    TableStructure::builder("ts", PartitionBy::Day)
        .column("writer", ColumnType::Symbol)
        .column("v", ColumnType::Long)
        .build()
        .unwrap()
}

fn add_row(writer: &mut WalWriter, ts: Timestamp, name: &str, v: i64) {
    writer.new_row(ts).unwrap();
    writer.put("writer", name).unwrap();
    writer.put("v", v).unwrap();
    writer.append().unwrap();
}

fn row(ts: Timestamp, name: &str, v: i64) -> (Timestamp, Vec<ColumnValue>) {
    (ts, vec![ColumnValue::Str(name.to_string()), ColumnValue::Long(v)])
}

#[test]
fn test_two_writers_commit_in_sequencer_order() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path()).unwrap();
    engine.create_table("trades", structure()).unwrap();

    let mut w1 = engine.writer("trades").unwrap();
    let mut w2 = engine.writer("trades").unwrap();
    assert_ne!(w1.wal_id(), w2.wal_id());

    add_row(&mut w1, at(10, 0), "w1", 1);
    add_row(&mut w1, at(10, 5), "w1", 2);
    add_row(&mut w2, at(10, 2), "w2", 3);
    add_row(&mut w2, at(10, 3), "w2", 4);
    add_row(&mut w2, at(10, 5), "w2", 5);

    assert_eq!(w2.commit().unwrap(), Some(TxnId::new(1)));
    assert_eq!(w1.commit().unwrap(), Some(TxnId::new(2)));
    w1.close().unwrap();
    w2.close().unwrap();

    engine.drain().unwrap();
    assert_eq!(engine.last_applied_txn("trades").unwrap(), TxnId::new(2));
    assert_eq!(
        table_rows(&engine, "trades").unwrap(),
        vec![
            row(at(10, 0), "w1", 1),
            row(at(10, 2), "w2", 3),
            row(at(10, 3), "w2", 4),
            row(at(10, 5), "w2", 5),
            row(at(10, 5), "w1", 2),
        ]
    );
}

#[test]
fn test_rows_before_applied_data_go_to_a_new_version() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path()).unwrap();
    engine.create_table("trades", structure()).unwrap();
    let mut writer = engine.writer("trades").unwrap();

    add_row(&mut writer, at(10, 30), "a", 1);
    writer.commit().unwrap();
    engine.drain().unwrap();
    let before = engine.reader("trades").unwrap();

    add_row(&mut writer, at(10, 10), "b", 2);
    add_row(&mut writer, at(10, 40), "b", 3);
    writer.commit().unwrap();
    engine.drain().unwrap();

    // The pinned reader still sees the version it opened.
    assert_eq!(before.rows().unwrap(), vec![row(at(10, 30), "a", 1)]);
    assert_eq!(table_rows(&engine, "trades").unwrap().len(), 3);

    drop(before);
    assert!(engine.purge().unwrap().versions >= 1);
    assert_eq!(
        table_rows(&engine, "trades").unwrap(),
        vec![row(at(10, 10), "b", 2), row(at(10, 30), "a", 1), row(at(10, 40), "b", 3)]
    );
    writer.close().unwrap();
}

#[test]
fn test_add_column_is_a_barrier() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig::builder()
        .sync(false)
        .apply(ApplyConfig::default().with_max_txns_per_pass(1))
        .build();
    let engine = Arc::new(meridian_engine::Engine::open(tmp.path(), config).unwrap());
    engine.create_table("t", structure()).unwrap();

    let mut writer = engine.writer("t").unwrap();
    let mut stale = engine.writer("t").unwrap();
    for i in 0..4 {
        add_row(&mut writer, at(1, i), "w", i);
        assert_eq!(writer.commit().unwrap(), Some(TxnId::new(i as u64 + 1)));
    }

    let (txn, version) = writer
        .alter(StructureChange::AddColumn {
            name: "c".to_string(),
            column_type: ColumnType::Int,
        })
        .unwrap();
    assert_eq!(txn, TxnId::new(5));
    for i in 6..=8 {
        writer.new_row(at(2, i)).unwrap();
        writer.put("c", i as i32).unwrap();
        writer.append().unwrap();
        writer.commit().unwrap();
    }

    // A writer that has not caught up cannot see the column, and cannot
    // commit under the old structure.
    stale.new_row(at(3, 0)).unwrap();
    assert!(matches!(stale.put("c", 1), Err(EngineError::UnknownColumn(_))));
    stale.put("v", 9).unwrap();
    stale.append().unwrap();
    assert!(matches!(
        stale.commit(),
        Err(EngineError::Sequencer(SequencerError::StaleStructure { .. }))
    ));
    stale.go_active().unwrap();
    assert_eq!(stale.structure().version(), version);
    assert_eq!(stale.commit().unwrap(), Some(TxnId::new(9)));

    let job = ApplyJob::new(Arc::clone(&engine));
    let mut applied = Vec::new();
    while job.run_once().unwrap() == JobOutcome::DidWork {
        let txn = engine.last_applied_txn("t").unwrap();
        let reader = engine.reader("t").unwrap();
        let has_c = reader.column_names().contains(&"c".to_string());
        assert_eq!(has_c, txn >= TxnId::new(5), "txn {txn}");
        applied.push(txn.get());
    }
    assert_eq!(applied, (1..=9).collect::<Vec<_>>());

    let rows = table_rows(&engine, "t").unwrap();
    assert_eq!(rows.len(), 8);
    assert!(rows[..4].iter().all(|(_, values)| values[2] == ColumnValue::Null));
    assert_eq!(rows[4].1[2], ColumnValue::Int(6));
    assert_eq!(rows[7].1, vec![ColumnValue::Null, ColumnValue::Long(9), ColumnValue::Null]);
    writer.close().unwrap();
    stale.close().unwrap();
}

#[test]
fn test_wal_segments_are_purged_once_applied() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path()).unwrap();
    engine.create_table("t", structure()).unwrap();

    let mut open = engine.writer("t").unwrap();
    add_row(&mut open, at(0, 1), "open", 1);
    open.commit().unwrap();

    let mut closed = engine.writer("t").unwrap();
    add_row(&mut closed, at(0, 2), "closed", 2);
    closed.commit().unwrap();
    closed.close().unwrap();

    // Not applied yet: nothing may go.
    assert_eq!(engine.purge().unwrap().segments, 0);

    let stats = engine.drain().unwrap();
    assert_eq!(stats.txns, 2);
    assert_eq!(stats.segments, 1);

    // The open writer's segment is still active.
    assert_eq!(engine.purge().unwrap().segments, 0);
    add_row(&mut open, at(0, 3), "open", 3);
    open.commit().unwrap();
    open.close().unwrap();
    let stats = engine.drain().unwrap();
    assert_eq!(stats.segments, 1);
    assert_eq!(table_rows(&engine, "t").unwrap().len(), 3);
}

#[test]
fn test_rollback_consumes_no_txn() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path()).unwrap();
    engine.create_table("t", structure()).unwrap();
    let mut writer = engine.writer("t").unwrap();

    add_row(&mut writer, at(0, 0), "x", 1);
    writer.rollback();
    assert_eq!(writer.commit().unwrap(), None);
    assert_eq!(engine.last_txn("t").unwrap(), TxnId::NONE);

    writer.new_row(at(0, 1)).unwrap();
    writer.put("v", 5_i64).unwrap();
    writer.cancel_row();
    add_row(&mut writer, at(0, 2), "x", 2);
    assert_eq!(writer.commit().unwrap(), Some(TxnId::new(1)));
    writer.close().unwrap();

    engine.drain().unwrap();
    assert_eq!(table_rows(&engine, "t").unwrap(), vec![row(at(0, 2), "x", 2)]);
}

#[test]
fn test_truncate_waits_for_earlier_txns() {
    let tmp = TempDir::new().unwrap();
    let engine = meridian_engine::Engine::open(tmp.path(), test_config()).unwrap();
    engine.create_table("t", structure()).unwrap();

    let mut writer = engine.writer("t").unwrap();
    add_row(&mut writer, at(0, 0), "a", 1);
    writer.commit().unwrap();
    assert_eq!(writer.truncate().unwrap(), TxnId::new(2));
    add_row(&mut writer, at(0, 1), "b", 2);
    writer.commit().unwrap();
    writer.close().unwrap();

    engine.drain().unwrap();
    assert_eq!(table_rows(&engine, "t").unwrap(), vec![row(at(0, 1), "b", 2)]);
    assert_eq!(engine.last_applied_txn("t").unwrap(), TxnId::new(3));
}
