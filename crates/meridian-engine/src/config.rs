//! Engine configuration.
//!
//! `EngineConfig` aggregates the configuration of every component and is
//! loaded from and saved to TOML. Durations are stored as integer
//! milliseconds.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

use meridian_sequencer::SequencerConfig;
use meridian_storage::StorageConfig;
use meridian_wal::{CommitMode, WalConfig};

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,

    /// Backoff before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Upper bound of the backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 5,
            max_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff after failed attempt number `attempt` (starting at 1), with
    /// up to 50% random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1 << exp)
            .min(self.max_backoff_ms);
        let jitter = if base > 1 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Validates the policy.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("Retry attempts must be positive".to_string());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("Initial backoff exceeds maximum backoff".to_string());
        }
        Ok(())
    }
}

/// Configuration of the apply job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// A pass applies at most this many transactions, then re-queues the table.
    pub max_txns_per_pass: usize,

    /// Consecutive data transactions are published together until the batch
    /// holds this many rows.
    pub max_batch_rows: usize,

    /// Retries of transient failures inside a pass.
    pub retry: RetryPolicy,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_txns_per_pass: 1024,
            max_batch_rows: 1_000_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl ApplyConfig {
    /// Sets the transactions applied per pass.
    #[must_use]
    pub fn with_max_txns_per_pass(mut self, max: usize) -> Self {
        self.max_txns_per_pass = max;
        self
    }

    /// Sets the rows per published batch.
    #[must_use]
    pub fn with_max_batch_rows(mut self, max: usize) -> Self {
        self.max_batch_rows = max;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_txns_per_pass == 0 {
            return Err("Transactions per pass must be positive".to_string());
        }
        if self.max_batch_rows == 0 {
            return Err("Batch rows must be positive".to_string());
        }
        self.retry.validate()
    }
}

/// Schedule of the background jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeConfig {
    /// Interval of the WAL purge job, in milliseconds.
    pub wal_purge_interval_ms: u64,

    /// Interval of the partition version purge job, in milliseconds.
    pub partition_purge_interval_ms: u64,

    /// Interval of the transaction check job, in milliseconds.
    pub check_interval_ms: u64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            wal_purge_interval_ms: 1_000,
            partition_purge_interval_ms: 1_000,
            check_interval_ms: 5_000,
        }
    }
}

impl PurgeConfig {
    /// WAL purge interval.
    pub fn wal_purge_interval(&self) -> Duration {
        Duration::from_millis(self.wal_purge_interval_ms)
    }

    /// Partition purge interval.
    pub fn partition_purge_interval(&self) -> Duration {
        Duration::from_millis(self.partition_purge_interval_ms)
    }

    /// Check job interval.
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Configuration of the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker threads.
    pub worker_count: usize,

    /// Sleep after a round in which no job had work, in milliseconds.
    pub idle_sleep_ms: u64,

    /// The idle sleep doubles on consecutive idle rounds up to this, in
    /// milliseconds.
    pub max_idle_sleep_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            idle_sleep_ms: 1,
            max_idle_sleep_ms: 100,
        }
    }
}

impl WorkerConfig {
    /// Sets the number of workers.
    #[must_use]
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("Worker count must be positive".to_string());
        }
        if self.idle_sleep_ms > self.max_idle_sleep_ms {
            return Err("Idle sleep exceeds maximum idle sleep".to_string());
        }
        Ok(())
    }
}

/// Configuration of an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// WAL segments.
    pub wal: WalConfig,

    /// Table sequencers.
    pub sequencer: SequencerConfig,

    /// Table storage.
    pub storage: StorageConfig,

    /// Apply job.
    pub apply: ApplyConfig,

    /// Writer commits retry transient sequencer failures with this policy.
    pub commit_retry: RetryPolicy,

    /// Background job schedule.
    pub purge: PurgeConfig,

    /// Worker pool.
    pub workers: WorkerConfig,
}

impl EngineConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Saves configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Converts configuration to TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), String> {
        self.wal.validate()?;
        self.sequencer.validate()?;
        self.storage.validate()?;
        self.apply.validate()?;
        self.commit_retry.validate()?;
        self.workers.validate()
    }

    /// Creates a builder for configuration.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

/// Builder for engine configuration.
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the WAL configuration.
    pub fn wal(mut self, wal: WalConfig) -> Self {
        self.config.wal = wal;
        self
    }

    /// Sets the sequencer configuration.
    pub fn sequencer(mut self, sequencer: SequencerConfig) -> Self {
        self.config.sequencer = sequencer;
        self
    }

    /// Sets the storage configuration.
    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    /// Sets the apply configuration.
    pub fn apply(mut self, apply: ApplyConfig) -> Self {
        self.config.apply = apply;
        self
    }

    /// Sets the commit retry policy.
    pub fn commit_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.commit_retry = retry;
        self
    }

    /// Sets the job schedule.
    pub fn purge(mut self, purge: PurgeConfig) -> Self {
        self.config.purge = purge;
        self
    }

    /// Sets the worker pool configuration.
    pub fn workers(mut self, workers: WorkerConfig) -> Self {
        self.config.workers = workers;
        self
    }

    /// Sets the WAL commit mode.
    pub fn commit_mode(mut self, mode: CommitMode) -> Self {
        self.config.wal.commit_mode = mode;
        self
    }

    /// Turns every fsync on or off at once.
    pub fn sync(mut self, sync: bool) -> Self {
        self.config.wal.commit_mode = if sync { CommitMode::Sync } else { CommitMode::NoSync };
        self.config.sequencer.sync_on_append = sync;
        self.config.storage.sync_writes = sync;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.wal.commit_mode, CommitMode::Sync);
        assert!(config.sequencer.sync_on_append);
        assert_eq!(config.apply.max_txns_per_pass, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::builder()
            .sync(false)
            .apply(ApplyConfig::default().with_max_batch_rows(10))
            .workers(WorkerConfig::default().with_worker_count(4))
            .build();

        assert_eq!(config.wal.commit_mode, CommitMode::NoSync);
        assert!(!config.sequencer.sync_on_append);
        assert!(!config.storage.sync_writes);
        assert_eq!(config.apply.max_batch_rows, 10);
        assert_eq!(config.workers.worker_count, 4);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf").join("meridian.toml");

        let config = EngineConfig::builder()
            .commit_mode(CommitMode::NoSync)
            .apply(ApplyConfig::default().with_max_txns_per_pass(7))
            .build();
        config.save(&path).unwrap();

        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("meridian.toml");
        std::fs::write(&path, "[apply]\nmax_batch_rows = 42\n").unwrap();

        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.apply.max_batch_rows, 42);
        assert_eq!(loaded.apply.max_txns_per_pass, 1024);
        assert_eq!(loaded.workers, WorkerConfig::default());
    }

    #[test]
    fn test_validate() {
        let mut config = EngineConfig::default();
        config.apply.max_txns_per_pass = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.commit_retry.initial_backoff_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 4,
            max_backoff_ms: 32,
        };
        assert!(policy.backoff(1) >= Duration::from_millis(4));
        assert!(policy.backoff(1) <= Duration::from_millis(6));
        assert!(policy.backoff(9) >= Duration::from_millis(32));
        assert!(policy.backoff(9) <= Duration::from_millis(48));
    }
}
