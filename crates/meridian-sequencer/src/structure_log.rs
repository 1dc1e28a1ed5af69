//! The sequencer structure log (`txn_seq/_meta`).
//!
//! Header (magic, format version, reserved) followed by length-prefixed,
//! checksummed records `{version, kind, body}`. Version 0 is the create
//! record holding the full initial structure; every later record holds one
//! [`StructureChange`]. The log is replayed at open, so every historical
//! structure version can be served.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;

use meridian_common::constants::{FORMAT_VERSION, STRUCTURE_LOG_MAGIC};
use meridian_common::types::{StructureChange, StructureVersion, TableStructure};

use crate::error::{SequencerError, SequencerResult};

const HEADER_SIZE: usize = 16;
const RECORD_HEADER_SIZE: usize = 8;
const KIND_CREATE: u8 = 0;
const KIND_CHANGE: u8 = 1;

/// Versioned structure history of one table.
#[derive(Debug)]
pub struct StructureLog {
    path: PathBuf,
    file: File,
    sync: bool,
    /// Structure at every version, indexed by version.
    structures: Vec<Arc<TableStructure>>,
    /// Change that produced each version (`None` for version 0).
    changes: Vec<Option<StructureChange>>,
    /// File offset of each version's record.
    offsets: Vec<u64>,
    /// End of the last record.
    len: u64,
}

impl StructureLog {
    /// Creates the log with its create record.
    pub fn create(path: impl AsRef<Path>, structure: &TableStructure, sync: bool) -> SequencerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut buf = BytesMut::with_capacity(256);
        buf.put_u32(STRUCTURE_LOG_MAGIC);
        buf.put_u32(FORMAT_VERSION);
        buf.put_u64(0); // reserved

        let mut body = BytesMut::new();
        body.put_u64(StructureVersion::INITIAL.get());
        body.put_u8(KIND_CREATE);
        structure.encode(&mut body);
        put_record(&mut buf, &body);

        file.write_all(&buf)?;
        file.sync_all()?;

        let initial = decode_create(&body[9..], &path)?;

        Ok(Self {
            path,
            file,
            sync,
            structures: vec![Arc::new(initial)],
            changes: vec![None],
            offsets: vec![HEADER_SIZE as u64],
            len: buf.len() as u64,
        })
    }

    /// Opens and replays an existing log. A torn last record is cut off.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> SequencerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = std::fs::read(&path)?;
        if bytes.len() < HEADER_SIZE {
            return Err(SequencerError::corrupted(&path, 0, "structure log header truncated"));
        }
        let mut header = &bytes[..HEADER_SIZE];
        let magic = header.get_u32();
        if magic != STRUCTURE_LOG_MAGIC {
            return Err(SequencerError::InvalidMagic {
                path,
                expected: STRUCTURE_LOG_MAGIC,
                found: magic,
            });
        }
        let version = header.get_u32();
        if version != FORMAT_VERSION {
            return Err(SequencerError::UnsupportedVersion { path, found: version });
        }

        let mut structures: Vec<Arc<TableStructure>> = Vec::new();
        let mut changes = Vec::new();
        let mut offsets = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset < bytes.len() {
            let Some(body) = read_record(&bytes, offset) else {
                if offset + RECORD_HEADER_SIZE + record_len(&bytes, offset) < bytes.len() {
                    return Err(SequencerError::corrupted(&path, offset as u64, "record checksum mismatch"));
                }
                warn!(path = %path.display(), offset, "cutting torn tail of structure log");
                break;
            };

            let mut cursor = body;
            if cursor.remaining() < 9 {
                return Err(SequencerError::corrupted(&path, offset as u64, "record too short"));
            }
            let version = StructureVersion::new(cursor.get_u64());
            let kind = cursor.get_u8();
            if version.get() != structures.len() as u64 {
                return Err(SequencerError::corrupted(
                    &path,
                    offset as u64,
                    format!("expected version {}, found {version}", structures.len()),
                ));
            }

            match (kind, structures.last().cloned()) {
                (KIND_CREATE, None) => {
                    structures.push(Arc::new(decode_create(cursor, &path)?));
                    changes.push(None);
                }
                (KIND_CHANGE, Some(current)) => {
                    let change = StructureChange::decode(&mut cursor)
                        .map_err(|e| SequencerError::decode(&path, offset as u64, e))?;
                    let next = current.apply(&change).map_err(|e| {
                        SequencerError::corrupted(&path, offset as u64, format!("invalid change: {e}"))
                    })?;
                    structures.push(Arc::new(next));
                    changes.push(Some(change));
                }
                _ => {
                    return Err(SequencerError::corrupted(&path, offset as u64, "unexpected record kind"));
                }
            }
            offsets.push(offset as u64);
            offset += RECORD_HEADER_SIZE + body.len();
        }

        if structures.is_empty() {
            return Err(SequencerError::corrupted(&path, HEADER_SIZE as u64, "missing create record"));
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if offset != bytes.len() {
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            file,
            sync,
            structures,
            changes,
            offsets,
            len: offset as u64,
        })
    }

    /// Current structure.
    pub fn current(&self) -> Arc<TableStructure> {
        // Never empty: the create record is always present.
        Arc::clone(&self.structures[self.structures.len() - 1])
    }

    /// Current structure version.
    pub fn version(&self) -> StructureVersion {
        StructureVersion::new(self.structures.len() as u64 - 1)
    }

    /// Structure at `version`.
    pub fn structure_at(&self, version: StructureVersion) -> Option<Arc<TableStructure>> {
        usize::try_from(version.get())
            .ok()
            .and_then(|v| self.structures.get(v))
            .cloned()
    }

    /// Change that produced `version`.
    pub fn change_at(&self, version: StructureVersion) -> Option<&StructureChange> {
        usize::try_from(version.get())
            .ok()
            .and_then(|v| self.changes.get(v))
            .and_then(Option::as_ref)
    }

    /// Validates and appends `change`, returning the new structure.
    pub fn append(&mut self, change: &StructureChange) -> SequencerResult<Arc<TableStructure>> {
        let next = Arc::new(self.current().apply(change)?);

        let mut body = BytesMut::new();
        body.put_u64(next.version().get());
        body.put_u8(KIND_CHANGE);
        change.encode(&mut body);
        let mut buf = BytesMut::with_capacity(body.len() + RECORD_HEADER_SIZE);
        put_record(&mut buf, &body);

        let offset = self.len;
        let end = offset + buf.len() as u64;
        let result = self
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&buf))
            .and_then(|()| self.file.set_len(end))
            .and_then(|()| if self.sync { self.file.sync_data() } else { Ok(()) });
        if let Err(err) = result {
            let _ = self.file.set_len(offset);
            return Err(err.into());
        }

        self.len = end;
        self.offsets.push(offset);
        self.structures.push(Arc::clone(&next));
        self.changes.push(Some(change.clone()));
        Ok(next)
    }

    /// Drops every version above `version`. Used to undo an append whose
    /// commit record never made it, and at open to drop versions the commit
    /// log does not know.
    pub fn truncate_to(&mut self, version: StructureVersion) -> SequencerResult<()> {
        let keep = version.get() as usize + 1;
        if keep >= self.structures.len() {
            return Ok(());
        }
        let offset = self.offsets[keep];
        // Memory first: a later append overwrites whatever the file still holds.
        self.structures.truncate(keep);
        self.changes.truncate(keep);
        self.offsets.truncate(keep);
        self.len = offset;
        self.file.set_len(offset)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Returns the path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn put_record(buf: &mut BytesMut, body: &[u8]) {
    buf.put_u32(body.len() as u32);
    buf.put_u32(crc32fast::hash(body));
    buf.put_slice(body);
}

fn record_len(bytes: &[u8], offset: usize) -> usize {
    let mut header = bytes.get(offset..offset + RECORD_HEADER_SIZE).unwrap_or(&[]);
    if header.len() < RECORD_HEADER_SIZE {
        return 0;
    }
    header.get_u32() as usize
}

/// Returns the body of the record at `offset` if it is complete and intact.
fn read_record(bytes: &[u8], offset: usize) -> Option<&[u8]> {
    let mut header = bytes.get(offset..offset + RECORD_HEADER_SIZE)?;
    let len = header.get_u32() as usize;
    let checksum = header.get_u32();
    let start = offset + RECORD_HEADER_SIZE;
    let body = bytes.get(start..start.checked_add(len)?)?;
    (crc32fast::hash(body) == checksum).then_some(body)
}

fn decode_create(mut body: &[u8], path: &Path) -> SequencerResult<TableStructure> {
    let structure = TableStructure::decode(&mut body).map_err(|e| SequencerError::decode(path, 0, e))?;
    if structure.version() != StructureVersion::INITIAL {
        return Err(SequencerError::corrupted(path, 0, "create record is not version 0"));
    }
    Ok(structure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::types::{ColumnType, PartitionBy};
    use tempfile::TempDir;

    fn initial() -> TableStructure {
        TableStructure::builder("ts", PartitionBy::Day)
            .column("a", ColumnType::Int)
            .build()
            .unwrap()
    }

    fn add(name: &str) -> StructureChange {
        StructureChange::AddColumn {
            name: name.into(),
            column_type: ColumnType::Long,
        }
    }

    #[test]
    fn test_create_and_append() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_meta");
        let mut log = StructureLog::create(&path, &initial(), true).unwrap();
        assert_eq!(log.version(), StructureVersion::INITIAL);

        let s1 = log.append(&add("b")).unwrap();
        assert_eq!(s1.version(), StructureVersion::new(1));
        assert_eq!(log.change_at(StructureVersion::new(1)), Some(&add("b")));
        assert!(log.change_at(StructureVersion::INITIAL).is_none());

        assert!(log.append(&add("b")).is_err());
        assert_eq!(log.version(), StructureVersion::new(1));
    }

    #[test]
    fn test_replay() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_meta");
        {
            let mut log = StructureLog::create(&path, &initial(), false).unwrap();
            log.append(&add("b")).unwrap();
            log.append(&StructureChange::DropColumn { name: "a".into() }).unwrap();
        }
        let log = StructureLog::open(&path, false).unwrap();
        assert_eq!(log.version(), StructureVersion::new(2));
        assert_eq!(log.current().column_index("a"), None);
        assert_eq!(
            log.structure_at(StructureVersion::new(1)).unwrap().column_index("a"),
            Some(0)
        );
        assert!(log.structure_at(StructureVersion::new(3)).is_none());
    }

    #[test]
    fn test_truncate_to() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_meta");
        {
            let mut log = StructureLog::create(&path, &initial(), false).unwrap();
            log.append(&add("b")).unwrap();
            log.append(&add("c")).unwrap();
            log.truncate_to(StructureVersion::new(1)).unwrap();
            assert_eq!(log.version(), StructureVersion::new(1));
            log.append(&add("d")).unwrap();
        }
        let log = StructureLog::open(&path, false).unwrap();
        assert_eq!(log.version(), StructureVersion::new(2));
        assert!(log.current().column_index("d").is_some());
        assert!(log.current().column_index("c").is_none());
    }

    #[test]
    fn test_torn_tail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_meta");
        {
            let mut log = StructureLog::create(&path, &initial(), false).unwrap();
            log.append(&add("b")).unwrap();
        }
        let full = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();
        drop(file);

        let log = StructureLog::open(&path, false).unwrap();
        assert_eq!(log.version(), StructureVersion::INITIAL);
    }
}
