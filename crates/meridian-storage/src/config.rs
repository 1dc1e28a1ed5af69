//! Storage configuration.

use serde::{Deserialize, Serialize};

/// Configuration for table storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Fsync partition versions and the table state file on publish.
    pub sync_writes: bool,

    /// Out-of-order merges rewrite at most this many existing rows per
    /// partition in one go; larger partitions are merged in chunks.
    pub o3_merge_chunk_rows: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sync_writes: true,
            o3_merge_chunk_rows: 1 << 20,
        }
    }
}

impl StorageConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether writes are fsynced.
    #[must_use]
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Sets the out-of-order merge chunk size.
    #[must_use]
    pub fn with_o3_merge_chunk_rows(mut self, rows: usize) -> Self {
        self.o3_merge_chunk_rows = rows;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.o3_merge_chunk_rows == 0 {
            return Err("O3 merge chunk size must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(StorageConfig::default().validate().is_ok());
        assert!(StorageConfig::new().with_o3_merge_chunk_rows(0).validate().is_err());
    }
}
