//! The table state file (`_txn`).
//!
//! Records what readers see: the applied watermark, the structure version
//! and the promoted version of every partition with its row count. Replacing
//! this file is the commit point of every publish.
//!
//! ```text
//! +-----------+-------------+-----------------+---------------------+
//! | magic (4) | version (4) | applied_txn (8) | structure_ver (8)   |
//! +-----------+-------------+-----------------+---------------------+
//! | next_version (8) | count (4) | entries (40 each) ... | crc32 (4) |
//! +------------------+-----------+-----------------------+-----------+
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use meridian_common::constants::{FORMAT_VERSION, TABLE_STATE_FILE, TABLE_STATE_MAGIC, TEMP_SUFFIX};
use meridian_common::types::{PartitionKey, StructureVersion, Timestamp, TxnId};

use crate::error::{StorageError, StorageResult};

const FIXED_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 4;
const ENTRY_SIZE: usize = 40;

/// Promoted version of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    pub key: PartitionKey,
    pub version: u64,
    pub rows: u64,
    pub min_ts: Timestamp,
    pub max_ts: Timestamp,
}

/// Durable state of a table's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableState {
    pub applied_txn: TxnId,
    pub structure_version: StructureVersion,
    /// Next partition version number to hand out.
    pub next_version: u64,
    /// Sorted by partition key.
    pub partitions: Vec<PartitionEntry>,
}

impl TableState {
    /// State of a freshly created table.
    pub fn new(structure_version: StructureVersion) -> Self {
        Self {
            applied_txn: TxnId::NONE,
            structure_version,
            next_version: 1,
            partitions: Vec::new(),
        }
    }

    /// Serializes the state, checksum included.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FIXED_SIZE + self.partitions.len() * ENTRY_SIZE + 4);
        buf.put_u32(TABLE_STATE_MAGIC);
        buf.put_u32(FORMAT_VERSION);
        buf.put_u64(self.applied_txn.get());
        buf.put_u64(self.structure_version.get());
        buf.put_u64(self.next_version);
        buf.put_u32(self.partitions.len() as u32);
        for entry in &self.partitions {
            buf.put_i64(entry.key.get());
            buf.put_u64(entry.version);
            buf.put_u64(entry.rows);
            buf.put_i64(entry.min_ts.as_micros());
            buf.put_i64(entry.max_ts.as_micros());
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);
        buf
    }

    /// Deserializes a state read from `path`.
    pub fn decode(path: &Path, bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < FIXED_SIZE + 4 {
            return Err(StorageError::corrupted(path, "table state truncated"));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32fast::hash(body) != stored {
            return Err(StorageError::corrupted(path, "table state checksum mismatch"));
        }

        let mut buf = body;
        let magic = buf.get_u32();
        if magic != TABLE_STATE_MAGIC {
            return Err(StorageError::InvalidMagic {
                path: path.to_path_buf(),
                expected: TABLE_STATE_MAGIC,
                found: magic,
            });
        }
        let version = buf.get_u32();
        if version != FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: version,
            });
        }
        let applied_txn = TxnId::new(buf.get_u64());
        let structure_version = StructureVersion::new(buf.get_u64());
        let next_version = buf.get_u64();
        let count = buf.get_u32() as usize;
        if buf.remaining() != count * ENTRY_SIZE {
            return Err(StorageError::corrupted(path, "table state entry count mismatch"));
        }
        let partitions = (0..count)
            .map(|_| PartitionEntry {
                key: PartitionKey::new(buf.get_i64()),
                version: buf.get_u64(),
                rows: buf.get_u64(),
                min_ts: Timestamp::from_micros(buf.get_i64()),
                max_ts: Timestamp::from_micros(buf.get_i64()),
            })
            .collect();

        Ok(Self {
            applied_txn,
            structure_version,
            next_version,
            partitions,
        })
    }

    /// Loads the state of the table in `dir`; `None` if there is none.
    pub fn load(dir: &Path) -> StorageResult<Option<Self>> {
        let path = dir.join(TABLE_STATE_FILE);
        match fs::read(&path) {
            Ok(bytes) => Self::decode(&path, &bytes).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically replaces the state file in `dir`.
    pub fn save(&self, dir: &Path, sync: bool) -> StorageResult<()> {
        let path = dir.join(TABLE_STATE_FILE);
        let tmp_path = dir.join(format!("{TABLE_STATE_FILE}{TEMP_SUFFIX}"));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&self.encode())?;
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

    fn sample() -> TableState {
        TableState {
            applied_txn: TxnId::new(12),
            structure_version: StructureVersion::new(2),
            next_version: 5,
            partitions: vec![
                PartitionEntry {
                    key: PartitionKey::new(0),
                    version: 1,
                    rows: 10,
                    min_ts: Timestamp::from_micros(5),
                    max_ts: Timestamp::from_micros(50),
                },
                PartitionEntry {
                    key: PartitionKey::new(86_400_000_000),
                    version: 4,
                    rows: 3,
                    min_ts: Timestamp::from_micros(86_400_000_001),
                    max_ts: Timestamp::from_micros(86_400_000_009),
                },
            ],
        }
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(TableState::load(tmp.path()).unwrap(), None);

        let state = sample();
        state.save(tmp.path(), true).unwrap();
        assert_eq!(TableState::load(tmp.path()).unwrap(), Some(state));

        let empty = TableState::new(StructureVersion::INITIAL);
        empty.save(tmp.path(), false).unwrap();
        assert_eq!(TableState::load(tmp.path()).unwrap(), Some(empty));
    }

    #[test]
    fn test_damage_is_detected() {
        let tmp = TempDir::new().unwrap();
        sample().save(tmp.path(), false).unwrap();
        let path = tmp.path().join(TABLE_STATE_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[20] ^= 0x40;
        std::fs::write(&path, &bytes).unwrap();
        assert!(TableState::load(tmp.path()).unwrap_err().is_corruption());
    }
}
