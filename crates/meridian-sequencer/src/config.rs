//! Sequencer configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for table sequencers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Fsync the commit log and structure log on every append.
    pub sync_on_append: bool,

    /// Maximum number of records returned by one log read.
    pub read_batch_size: usize,

    /// How long a committer waits for the commit log lock before giving up
    /// with a retryable error, in milliseconds.
    pub lock_timeout_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            sync_on_append: true,
            read_batch_size: 1024,
            lock_timeout_ms: 1_000,
        }
    }
}

impl SequencerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether appends are fsynced.
    #[must_use]
    pub fn with_sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    /// Sets the read batch size.
    #[must_use]
    pub fn with_read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size;
        self
    }

    /// Sets the lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Returns the lock timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.read_batch_size == 0 {
            return Err("Read batch size must be positive".to_string());
        }
        if self.lock_timeout_ms == 0 {
            return Err("Lock timeout must be positive".to_string());
        }
        Ok(())
    }
}
