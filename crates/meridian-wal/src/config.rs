//! WAL configuration.
//!
//! This module provides configuration options for WAL segments.

use serde::{Deserialize, Serialize};

use meridian_common::constants::MAX_WAL_EVENT_SIZE;

/// Durability of commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Fsync the data event before the commit returns (safest, slowest).
    #[default]
    Sync,
    /// Leave flushing to the OS (fast, may lose the tail on power loss).
    NoSync,
}

impl CommitMode {
    /// Returns true if commits are fsynced.
    pub const fn is_sync(self) -> bool {
        matches!(self, Self::Sync)
    }
}

/// Configuration for WAL segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// A writer rolls over to a new segment once its segment reaches this size.
    pub segment_rollover_bytes: u64,

    /// A writer rolls over to a new segment once its segment holds this many rows.
    pub segment_rollover_rows: u64,

    /// Maximum size of a single WAL event.
    pub max_event_size: usize,

    /// Durability of data events.
    pub commit_mode: CommitMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_rollover_bytes: 64 * 1024 * 1024,
            segment_rollover_rows: 1_000_000,
            max_event_size: MAX_WAL_EVENT_SIZE,
            commit_mode: CommitMode::default(),
        }
    }
}

impl WalConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the segment rollover size.
    #[must_use]
    pub fn with_segment_rollover_bytes(mut self, bytes: u64) -> Self {
        self.segment_rollover_bytes = bytes;
        self
    }

    /// Sets the segment rollover row count.
    #[must_use]
    pub fn with_segment_rollover_rows(mut self, rows: u64) -> Self {
        self.segment_rollover_rows = rows;
        self
    }

    /// Sets the maximum event size.
    #[must_use]
    pub fn with_max_event_size(mut self, size: usize) -> Self {
        self.max_event_size = size;
        self
    }

    /// Sets the commit mode.
    #[must_use]
    pub fn with_commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = mode;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.segment_rollover_bytes < 4096 {
            return Err("Segment rollover size must be at least 4 KB".to_string());
        }

        if self.segment_rollover_rows == 0 {
            return Err("Segment rollover rows must be positive".to_string());
        }

        if self.max_event_size < 1024 {
            return Err("Max event size must be at least 1 KB".to_string());
        }

        if self.max_event_size > MAX_WAL_EVENT_SIZE {
            return Err(format!(
                "Max event size must be at most {} bytes",
                MAX_WAL_EVENT_SIZE
            ));
        }

        Ok(())
    }
}
