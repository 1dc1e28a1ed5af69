//! Worker threads running the engine's background jobs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::WorkerConfig;
use crate::error::{EngineError, EngineResult};
use crate::jobs::{Job, JobOutcome};

/// A job plus the earliest time it may run again. Shared by all workers so
/// that periodic jobs run once per interval, not once per worker.
struct JobSlot {
    job: Arc<dyn Job>,
    next_due: Mutex<Instant>,
}

impl JobSlot {
    /// Claims the slot if its interval has passed.
    fn claim(&self, now: Instant) -> bool {
        let interval = self.job.interval();
        if interval.is_zero() {
            return true;
        }
        let Some(mut next_due) = self.next_due.try_lock() else {
            return false;
        };
        if now < *next_due {
            return false;
        }
        *next_due = now + interval;
        true
    }
}

/// Worker statistics.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Job runs that did work.
    pub runs: AtomicU64,
    /// Job runs that failed.
    pub failures: AtomicU64,
}

/// Pool of threads looping over a shared job list.
///
/// Dropping the pool signals shutdown and waits for the threads.
pub struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    /// Starts `config.worker_count` threads.
    pub fn start(jobs: Vec<Arc<dyn Job>>, config: &WorkerConfig) -> EngineResult<Self> {
        config.validate().map_err(EngineError::config_error)?;
        let slots: Arc<[JobSlot]> = jobs
            .into_iter()
            .map(|job| JobSlot {
                job,
                next_due: Mutex::new(Instant::now()),
            })
            .collect();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(WorkerStats::default());
        let idle = Duration::from_millis(config.idle_sleep_ms);
        let max_idle = Duration::from_millis(config.max_idle_sleep_ms);

        let mut pool = Self {
            shutdown: Arc::clone(&shutdown),
            threads: Vec::with_capacity(config.worker_count),
            stats: Arc::clone(&stats),
        };
        for index in 0..config.worker_count {
            let slots = Arc::clone(&slots);
            let shutdown = Arc::clone(&shutdown);
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("meridian-worker-{index}"))
                .spawn(move || worker_loop(index, &slots, &shutdown, &stats, idle, max_idle))
                .map_err(|err| EngineError::Spawn(err.to_string()))?;
            pool.threads.push(handle);
        }
        info!(workers = config.worker_count, jobs = slots.len(), "started worker pool");
        Ok(pool)
    }

    /// Asks the workers to stop after their current job.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Returns true once shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Pool statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Stops the workers and waits for them.
    pub fn join(mut self) -> EngineResult<()> {
        self.shutdown();
        self.join_threads()
    }

    fn join_threads(&mut self) -> EngineResult<()> {
        let mut panicked = 0;
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(EngineError::Spawn(format!("{panicked} worker thread(s) panicked")));
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        if let Err(err) = self.join_threads() {
            error!(error = %err, "worker pool shut down with errors");
        }
    }
}

fn worker_loop(
    index: usize,
    slots: &[JobSlot],
    shutdown: &AtomicBool,
    stats: &WorkerStats,
    idle: Duration,
    max_idle: Duration,
) {
    debug!(worker = index, "worker started");
    let mut sleep = idle;
    while !shutdown.load(Ordering::Acquire) {
        let now = Instant::now();
        let mut did_work = false;
        for slot in slots {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            if !slot.claim(now) {
                continue;
            }
            match slot.job.run_once() {
                Ok(JobOutcome::DidWork) => {
                    did_work = true;
                    stats.runs.fetch_add(1, Ordering::Relaxed);
                }
                Ok(JobOutcome::Idle) => {}
                Err(err) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    error!(worker = index, job = slot.job.name(), error = %err, "job failed");
                }
            }
        }
        if did_work {
            sleep = idle;
        } else {
            thread::sleep(sleep);
            sleep = (sleep * 2).min(max_idle);
        }
    }
    debug!(worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        calls: AtomicUsize,
        limit: usize,
        interval: Duration,
    }

    impl Job for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn run_once(&self) -> EngineResult<JobOutcome> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if calls < self.limit {
                JobOutcome::DidWork
            } else {
                JobOutcome::Idle
            })
        }
    }

    fn config(workers: usize) -> WorkerConfig {
        WorkerConfig {
            worker_count: workers,
            idle_sleep_ms: 1,
            max_idle_sleep_ms: 5,
        }
    }

    #[test]
    fn test_runs_jobs_until_shutdown() {
        let job = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            limit: 10,
            interval: Duration::ZERO,
        });
        let pool = WorkerPool::start(vec![job.clone() as Arc<dyn Job>], &config(2)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while job.calls.load(Ordering::SeqCst) < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        pool.join().unwrap();
        assert!(job.calls.load(Ordering::SeqCst) >= 10);
    }

    #[test]
    fn test_interval_is_shared_between_workers() {
        let job = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            limit: usize::MAX,
            interval: Duration::from_secs(3600),
        });
        let pool = WorkerPool::start(vec![job.clone() as Arc<dyn Job>], &config(4)).unwrap();
        thread::sleep(Duration::from_millis(50));
        drop(pool);
        assert_eq!(job.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(WorkerPool::start(Vec::new(), &config(0)).is_err());
    }
}
