//! Background jobs run by the worker pool.

use std::sync::Arc;
use std::time::Duration;

use crate::apply::PassOutcome;
use crate::engine::Engine;
use crate::error::EngineResult;

/// What one run of a job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Something was done; run again soon.
    DidWork,
    /// Nothing to do.
    Idle,
}

/// A unit of background work.
pub trait Job: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Minimum time between runs. Zero runs the job on every worker loop.
    fn interval(&self) -> Duration {
        Duration::ZERO
    }

    /// Runs the job once.
    fn run_once(&self) -> EngineResult<JobOutcome>;
}

/// Applies the next queued table.
pub struct ApplyJob {
    engine: Arc<Engine>,
}

impl ApplyJob {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl Job for ApplyJob {
    fn name(&self) -> &'static str {
        "apply"
    }

    fn run_once(&self) -> EngineResult<JobOutcome> {
        Ok(match self.engine.apply_next() {
            None => JobOutcome::Idle,
            Some(PassOutcome::Applied { .. }) => JobOutcome::DidWork,
            // Popped something without progress; let the worker back off.
            Some(_) => JobOutcome::Idle,
        })
    }
}

/// Finds tables with unapplied transactions and checks their consistency.
pub struct CheckTxnJob {
    engine: Arc<Engine>,
}

impl CheckTxnJob {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl Job for CheckTxnJob {
    fn name(&self) -> &'static str {
        "check-txns"
    }

    fn interval(&self) -> Duration {
        self.engine.config().purge.check_interval()
    }

    fn run_once(&self) -> EngineResult<JobOutcome> {
        let queued = self.engine.check_txns()?;
        Ok(if queued > 0 {
            JobOutcome::DidWork
        } else {
            JobOutcome::Idle
        })
    }
}

/// Deletes WAL segments no pending transaction needs, and dropped tables.
pub struct WalPurgeJob {
    engine: Arc<Engine>,
}

impl WalPurgeJob {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl Job for WalPurgeJob {
    fn name(&self) -> &'static str {
        "wal-purge"
    }

    fn interval(&self) -> Duration {
        self.engine.config().purge.wal_purge_interval()
    }

    fn run_once(&self) -> EngineResult<JobOutcome> {
        let removed = self.engine.purge_wal()? + self.engine.purge_dropped()?;
        Ok(if removed > 0 {
            JobOutcome::DidWork
        } else {
            JobOutcome::Idle
        })
    }
}

/// Deletes superseded partition versions no reader uses.
pub struct PartitionPurgeJob {
    engine: Arc<Engine>,
}

impl PartitionPurgeJob {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl Job for PartitionPurgeJob {
    fn name(&self) -> &'static str {
        "partition-purge"
    }

    fn interval(&self) -> Duration {
        self.engine.config().purge.partition_purge_interval()
    }

    fn run_once(&self) -> EngineResult<JobOutcome> {
        let removed = self.engine.purge_partitions()?;
        Ok(if removed > 0 {
            JobOutcome::DidWork
        } else {
            JobOutcome::Idle
        })
    }
}

/// The standard job set of an engine.
pub fn default_jobs(engine: &Arc<Engine>) -> Vec<Arc<dyn Job>> {
    vec![
        Arc::new(ApplyJob::new(Arc::clone(engine))),
        Arc::new(CheckTxnJob::new(Arc::clone(engine))),
        Arc::new(WalPurgeJob::new(Arc::clone(engine))),
        Arc::new(PartitionPurgeJob::new(Arc::clone(engine))),
    ]
}
