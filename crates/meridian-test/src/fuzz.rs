//! Random transaction plans and the in-memory model they are checked
//! against.
//!
//! A [`FuzzPlan`] is generated from a seed, so a failing run is reproduced
//! by re-running with the seed it printed.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

use meridian_common::types::{
    ColumnType, ColumnValue, PartitionBy, StructureChange, TableStructure, Timestamp,
};

const HOUR: i64 = 3_600_000_000;

/// Knobs of a generated plan. Probabilities are in `0.0..=1.0`.
#[derive(Debug, Clone)]
pub struct FuzzConfig {
    /// Seed of the generator.
    pub seed: u64,
    /// Number of transactions in the plan.
    pub txns: usize,
    /// Upper bound of rows per data transaction.
    pub max_rows: usize,
    /// Chance that a transaction changes the structure.
    pub structure_change: f64,
    /// Chance that a transaction truncates the table.
    pub truncate: f64,
    /// Chance that a data transaction is rolled back instead of committed.
    pub rollback: f64,
    /// Chance that a row is cancelled before it is appended.
    pub cancel_row: f64,
    /// Chance that a column is explicitly set to null.
    pub null_value: f64,
    /// Chance that a column is not set at all.
    pub unset_value: f64,
    /// Chance that a row reuses an earlier timestamp.
    pub equal_timestamp: f64,
    /// Rows are spread over this many hours.
    pub hours: i64,
}

impl FuzzConfig {
    /// Defaults for `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            txns: 60,
            max_rows: 40,
            structure_change: 0.08,
            truncate: 0.01,
            rollback: 0.05,
            cancel_row: 0.05,
            null_value: 0.1,
            unset_value: 0.1,
            equal_timestamp: 0.1,
            hours: 72,
        }
    }

    /// Seed from `MERIDIAN_FUZZ_SEED`, or a random one.
    pub fn from_env() -> Self {
        let seed = std::env::var("MERIDIAN_FUZZ_SEED")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(rand::random);
        Self::new(seed)
    }

    /// Sets the number of transactions.
    #[must_use]
    pub fn with_txns(mut self, txns: usize) -> Self {
        self.txns = txns;
        self
    }

    /// Sets the structure change probability.
    #[must_use]
    pub fn with_structure_change(mut self, p: f64) -> Self {
        self.structure_change = p;
        self
    }

    /// Sets the truncate probability.
    #[must_use]
    pub fn with_truncate(mut self, p: f64) -> Self {
        self.truncate = p;
        self
    }
}

/// One generated row. Columns are addressed by name as of the structure
/// the row is written under.
#[derive(Debug, Clone)]
pub struct FuzzRow {
    /// Designated timestamp.
    pub ts: Timestamp,
    /// Values to put; columns missing here are left unset.
    pub values: Vec<(String, ColumnValue)>,
    /// The row is cancelled instead of appended.
    pub cancelled: bool,
}

/// One step of a plan.
#[derive(Debug, Clone)]
pub enum FuzzTxn {
    /// Rows committed together, or rolled back.
    Data {
        /// Rows in write order.
        rows: Vec<FuzzRow>,
        /// Discard the rows instead of committing.
        rollback: bool,
    },
    /// A structure change.
    Alter(StructureChange),
    /// A truncate.
    Truncate,
}

impl FuzzTxn {
    /// Structure changes and truncates are barriers: every transaction
    /// before them is applied first.
    pub fn is_barrier(&self) -> bool {
        !matches!(self, Self::Data { .. })
    }
}

/// A generated sequence of transactions for one table.
#[derive(Debug, Clone)]
pub struct FuzzPlan {
    /// Seed the plan was generated from.
    pub seed: u64,
    /// Structure the table is created with.
    pub initial: TableStructure,
    /// Transactions in commit order.
    pub txns: Vec<FuzzTxn>,
}

impl FuzzPlan {
    /// Generates a plan.
    pub fn generate(config: &FuzzConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let initial = initial_structure();
        let mut structure = initial.clone();
        let mut next_column = 0usize;
        let mut timestamps: Vec<Timestamp> = Vec::new();
        let mut txns = Vec::with_capacity(config.txns);

        while txns.len() < config.txns {
            let roll: f64 = rng.gen();
            if roll < config.truncate {
                txns.push(FuzzTxn::Truncate);
                continue;
            }
            if roll < config.truncate + config.structure_change {
                if let Some(change) = random_change(&mut rng, &structure, &mut next_column) {
                    if let Ok(next) = structure.apply(&change) {
                        structure = next;
                        txns.push(FuzzTxn::Alter(change));
                    }
                }
                continue;
            }

            let count = rng.gen_range(1..=config.max_rows);
            let rows = (0..count)
                .map(|_| random_row(&mut rng, config, &structure, &mut timestamps))
                .collect();
            txns.push(FuzzTxn::Data {
                rows,
                rollback: rng.gen_bool(config.rollback),
            });
        }

        debug!(seed = config.seed, txns = txns.len(), "generated fuzz plan");
        Self {
            seed: config.seed,
            initial,
            txns,
        }
    }

    /// Splits the plan into runs of data transactions, each followed by the
    /// barrier that ends it (if any).
    pub fn phases(&self) -> Vec<(&[FuzzTxn], Option<&FuzzTxn>)> {
        let mut phases = Vec::new();
        let mut start = 0;
        for (i, txn) in self.txns.iter().enumerate() {
            if txn.is_barrier() {
                phases.push((&self.txns[start..i], Some(txn)));
                start = i + 1;
            }
        }
        phases.push((&self.txns[start..], None));
        phases
    }

    /// Rows the table must hold after the whole plan is applied, in storage
    /// order.
    pub fn expected(&self) -> Vec<(Timestamp, Vec<ColumnValue>)> {
        let mut model = Model::new(self.initial.clone());
        for txn in &self.txns {
            model.apply(txn);
        }
        model.rows()
    }
}

/// What the table must contain, computed without the engine.
#[derive(Debug)]
pub struct Model {
    structure: TableStructure,
    rows: Vec<(Timestamp, Vec<ColumnValue>)>,
}

impl Model {
    /// An empty table with `structure`.
    pub fn new(structure: TableStructure) -> Self {
        Self {
            structure,
            rows: Vec::new(),
        }
    }

    /// Applies one transaction.
    pub fn apply(&mut self, txn: &FuzzTxn) {
        match txn {
            FuzzTxn::Data { rollback: true, .. } => {}
            FuzzTxn::Data { rows, .. } => {
                for row in rows.iter().filter(|r| !r.cancelled) {
                    let mut values = vec![ColumnValue::Null; self.structure.column_count()];
                    for (name, value) in &row.values {
                        if let Some(index) = self.structure.column_index(name) {
                            values[index] = value.clone();
                        }
                    }
                    self.rows.push((row.ts, values));
                }
            }
            FuzzTxn::Alter(change) => {
                let Ok(next) = self.structure.apply(change) else {
                    return;
                };
                match change {
                    StructureChange::AddColumn { .. } => {
                        for (_, values) in &mut self.rows {
                            values.push(ColumnValue::Null);
                        }
                    }
                    StructureChange::ChangeColumnType { name, column_type } => {
                        if let Some(index) = self.structure.column_index(name) {
                            for (_, values) in &mut self.rows {
                                values[index] = values[index].cast(*column_type);
                            }
                        }
                    }
                    StructureChange::DropColumn { .. } | StructureChange::RenameColumn { .. } => {}
                }
                self.structure = next;
            }
            FuzzTxn::Truncate => self.rows.clear(),
        }
    }

    /// Visible columns of every row, ordered by timestamp and then by
    /// commit order.
    pub fn rows(&self) -> Vec<(Timestamp, Vec<ColumnValue>)> {
        let visible: Vec<usize> = self.structure.visible_columns().map(|(i, _)| i).collect();
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .map(|(ts, values)| (*ts, visible.iter().map(|&i| values[i].clone()).collect()))
            .collect();
        rows.sort_by_key(|(ts, _)| *ts);
        rows
    }
}

fn initial_structure() -> TableStructure {
    let built = TableStructure::builder("ts", PartitionBy::Day)
        .column("sym", ColumnType::Symbol)
        .column("price", ColumnType::Double)
        .column("qty", ColumnType::Int)
        .build();
    match built {
        Ok(structure) => structure,
        Err(e) => panic!("invalid fuzz structure: {e}"),
    }
}

fn random_change(
    rng: &mut StdRng,
    structure: &TableStructure,
    next_column: &mut usize,
) -> Option<StructureChange> {
    let visible: Vec<String> = structure
        .visible_columns()
        .map(|(_, meta)| meta.name.clone())
        .collect();
    let existing = visible.choose(rng).cloned();

    let change = match (rng.gen_range(0..4), existing) {
        (1, Some(name)) if visible.len() > 1 => StructureChange::DropColumn { name },
        (2, Some(from)) => {
            *next_column += 1;
            StructureChange::RenameColumn {
                from,
                to: format!("r{next_column}"),
            }
        }
        (3, Some(name)) => {
            let index = structure.column_index(&name)?;
            let current = structure.columns()[index].column_type;
            let choices: Vec<ColumnType> = ColumnType::ALL
                .into_iter()
                .filter(|&ty| ty != current)
                .collect();
            StructureChange::ChangeColumnType {
                name,
                column_type: *choices.choose(rng)?,
            }
        }
        _ => {
            *next_column += 1;
            StructureChange::AddColumn {
                name: format!("c{next_column}"),
                column_type: *ColumnType::ALL.choose(rng)?,
            }
        }
    };
    Some(change)
}

fn random_row(
    rng: &mut StdRng,
    config: &FuzzConfig,
    structure: &TableStructure,
    timestamps: &mut Vec<Timestamp>,
) -> FuzzRow {
    let reused = timestamps
        .choose(rng)
        .copied()
        .filter(|_| rng.gen_bool(config.equal_timestamp));
    let ts = match reused {
        Some(ts) => ts,
        None => {
            let ts = Timestamp::from_micros(rng.gen_range(0..config.hours * HOUR));
            timestamps.push(ts);
            ts
        }
    };

    let mut values = Vec::new();
    for (_, meta) in structure.visible_columns() {
        if rng.gen_bool(config.unset_value) {
            continue;
        }
        let value = if rng.gen_bool(config.null_value) {
            ColumnValue::Null
        } else {
            random_value(rng, meta.column_type)
        };
        values.push((meta.name.clone(), value));
    }

    FuzzRow {
        ts,
        values,
        cancelled: rng.gen_bool(config.cancel_row),
    }
}

fn random_value(rng: &mut StdRng, column_type: ColumnType) -> ColumnValue {
    match column_type {
        ColumnType::Boolean => ColumnValue::Bool(rng.gen()),
        ColumnType::Int => ColumnValue::Int(rng.gen_range(-1_000..1_000)),
        ColumnType::Long => ColumnValue::Long(rng.gen_range(-1_000_000..1_000_000)),
        ColumnType::Double => ColumnValue::Double(f64::from(rng.gen_range(-10_000i32..10_000)) / 4.0),
        ColumnType::Symbol => ColumnValue::Str(format!("s{}", rng.gen_range(0..16))),
        ColumnType::Varchar => ColumnValue::Str(format!("v{}", rng.gen_range(0..100_000))),
        ColumnType::Timestamp => ColumnValue::Timestamp(Timestamp::from_micros(rng.gen_range(0..HOUR * 24))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_is_deterministic() {
        let config = FuzzConfig::new(7).with_structure_change(0.3);
        let a = FuzzPlan::generate(&config);
        let b = FuzzPlan::generate(&config);
        assert_eq!(a.txns.len(), 60);
        assert_eq!(format!("{:?}", a.txns), format!("{:?}", b.txns));
    }

    #[test]
    fn test_phases_end_at_barriers() {
        let plan = FuzzPlan::generate(&FuzzConfig::new(11).with_structure_change(0.3));
        let phases = plan.phases();
        let barriers = plan.txns.iter().filter(|t| t.is_barrier()).count();
        assert_eq!(phases.len(), barriers + 1);
        assert!(phases.last().unwrap().1.is_none());
        let total: usize = phases
            .iter()
            .map(|(data, barrier)| data.len() + usize::from(barrier.is_some()))
            .sum();
        assert_eq!(total, plan.txns.len());
    }

    #[test]
    fn test_model_follows_structure_changes() {
        let structure = TableStructure::builder("ts", PartitionBy::Day)
            .column("a", ColumnType::Int)
            .build()
            .unwrap();
        let row = |ts: i64, v: i32| FuzzRow {
            ts: Timestamp::from_micros(ts),
            values: vec![("a".to_string(), ColumnValue::Int(v))],
            cancelled: false,
        };
        let mut model = Model::new(structure);
        model.apply(&FuzzTxn::Data {
            rows: vec![row(2, 20), row(1, 10)],
            rollback: false,
        });
        model.apply(&FuzzTxn::Data {
            rows: vec![row(0, 99)],
            rollback: true,
        });
        model.apply(&FuzzTxn::Alter(StructureChange::ChangeColumnType {
            name: "a".to_string(),
            column_type: ColumnType::Long,
        }));
        model.apply(&FuzzTxn::Alter(StructureChange::AddColumn {
            name: "b".to_string(),
            column_type: ColumnType::Varchar,
        }));

        assert_eq!(
            model.rows(),
            vec![
                (Timestamp::from_micros(1), vec![ColumnValue::Long(10), ColumnValue::Null]),
                (Timestamp::from_micros(2), vec![ColumnValue::Long(20), ColumnValue::Null]),
            ]
        );

        model.apply(&FuzzTxn::Alter(StructureChange::DropColumn { name: "a".to_string() }));
        model.apply(&FuzzTxn::Truncate);
        assert!(model.rows().is_empty());
    }
}
