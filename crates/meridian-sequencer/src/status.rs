//! Persisted suspension status (`txn_seq/_status.json`).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use meridian_common::constants::{STATUS_FILE, TEMP_SUFFIX};
use meridian_common::types::TxnId;
use meridian_common::ErrorClass;

use crate::error::SequencerResult;

/// Why a table was suspended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendReason {
    /// Transaction that could not be applied.
    pub txn: TxnId,
    /// Error class name (see [`ErrorClass::as_str`]).
    pub class: String,
    /// Error message.
    pub message: String,
}

impl SuspendReason {
    /// Creates a reason from an error class and message.
    pub fn new(txn: TxnId, class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            txn,
            class: class.as_str().to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn {} ({}): {}", self.txn, self.class, self.message)
    }
}

/// Contents of the status file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspendStatus {
    pub suspended: bool,
    pub reason: Option<SuspendReason>,
}

impl SuspendStatus {
    /// Loads the status from `dir`. A missing file means not suspended.
    pub fn load(dir: &Path) -> SequencerResult<Self> {
        let path = dir.join(STATUS_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically replaces the status file in `dir`.
    pub fn save(&self, dir: &Path, sync: bool) -> SequencerResult<()> {
        let path = dir.join(STATUS_FILE);
        let tmp_path = dir.join(format!("{STATUS_FILE}{TEMP_SUFFIX}"));

        let json = serde_json::to_vec_pretty(self)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&json)?;
        if sync {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp_path, &path)?;
        if sync {
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_not_suspended() {
        let tmp = TempDir::new().unwrap();
        let status = SuspendStatus::load(tmp.path()).unwrap();
        assert!(!status.suspended);
        assert!(status.reason.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let status = SuspendStatus {
            suspended: true,
            reason: Some(SuspendReason::new(TxnId::new(3), ErrorClass::Fatal, "segment missing")),
        };
        status.save(tmp.path(), true).unwrap();
        assert_eq!(SuspendStatus::load(tmp.path()).unwrap(), status);
        assert!(!tmp.path().join(format!("{STATUS_FILE}{TEMP_SUFFIX}")).exists());

        let reason = status.reason.unwrap();
        assert_eq!(reason.to_string(), "txn 3 (fatal): segment missing");
    }

    #[test]
    fn test_garbage_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(STATUS_FILE), b"{not json").unwrap();
        assert!(SuspendStatus::load(tmp.path()).unwrap_err().is_corruption());
    }
}
