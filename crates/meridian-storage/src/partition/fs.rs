//! On-disk partition store.
//!
//! ```text
//! data/
//!   2024-01-05.3/
//!     ts.d      designated timestamps, 8 bytes per row
//!     0.d       column 0, length-tagged values
//!     1.d       ...
//! ```
//!
//! Timestamps are fixed width, so the committed end of `ts.d` is a
//! multiplication away. Value files are variable width; their committed end
//! is cached after every append and found by scanning otherwise. Reads
//! remember where they stopped, so a partition read in consecutive chunks
//! is decoded once.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use meridian_common::constants::TEMP_SUFFIX;
use meridian_common::types::{ColumnBatch, ColumnValue, DecodeError, PartitionBy, Timestamp};

use super::{PartitionStore, VersionRef};
use crate::error::{StorageError, StorageResult};

const TIMESTAMP_FILE: &str = "ts.d";
const TIMESTAMP_WIDTH: u64 = 8;
const READ_CHUNK: usize = 64 * 1024;

/// A row boundary in a value file: `rows` values end at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileEnd {
    rows: u64,
    offset: u64,
}

/// Column-per-file partition store under a table's `data/` directory.
#[derive(Debug)]
pub struct FsPartitionStore {
    data_dir: PathBuf,
    partition_by: PartitionBy,
    ends: Mutex<HashMap<PathBuf, FileEnd>>,
    /// Where the last read of each value file stopped.
    cursors: Mutex<HashMap<PathBuf, FileEnd>>,
}

impl FsPartitionStore {
    /// Opens the store, creating `data_dir` if needed.
    pub fn open(data_dir: impl AsRef<Path>, partition_by: PartitionBy) -> StorageResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            partition_by,
            ends: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        })
    }

    /// Directory of a version.
    pub fn version_dir(&self, version: VersionRef) -> PathBuf {
        self.data_dir.join(format!(
            "{}.{}",
            self.partition_by.partition_name(version.partition),
            version.version
        ))
    }

    fn parse_dir_name(&self, name: &str) -> Option<VersionRef> {
        let (partition, version) = name.rsplit_once('.')?;
        let partition = self.partition_by.parse_partition_name(partition)?;
        Some(VersionRef::new(partition, version.parse().ok()?))
    }

    fn existing_dir(&self, version: VersionRef) -> StorageResult<PathBuf> {
        let dir = self.version_dir(version);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(StorageError::VersionNotFound(version))
        }
    }

    /// Finds the committed end of a value file, scanning if it is not cached.
    fn value_file_end(&self, path: &Path, committed_rows: u64) -> StorageResult<FileEnd> {
        if let Some(end) = self.ends.lock().get(path) {
            if end.rows == committed_rows {
                return Ok(*end);
            }
        }
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let mut rows = 0;
        let mut offset = 0;
        while rows < committed_rows && offset < bytes.len() {
            let mut buf = &bytes[offset..];
            // A torn value ends the committed part.
            if ColumnValue::decode(&mut buf).is_err() {
                break;
            }
            offset = bytes.len() - buf.remaining();
            rows += 1;
        }
        let offset = offset as u64;
        Ok(FileEnd { rows, offset })
    }

    /// Decodes values `lo..hi` of a value file, starting from the closest
    /// known row boundary at or before `lo`. Stops early at end of file.
    fn read_values(&self, path: &Path, lo: u64, hi: u64) -> StorageResult<Vec<ColumnValue>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let start = {
            let cursors = self.cursors.lock();
            let ends = self.ends.lock();
            [cursors.get(path), ends.get(path)]
                .into_iter()
                .flatten()
                .filter(|known| known.rows <= lo)
                .max_by_key(|known| known.rows)
                .copied()
                .unwrap_or(FileEnd { rows: 0, offset: 0 })
        };
        file.seek(SeekFrom::Start(start.offset))?;

        let mut values = Vec::with_capacity((hi - lo) as usize);
        let mut pending = BytesMut::new();
        let mut chunk = vec![0; READ_CHUNK];
        let mut row = start.rows;
        let mut offset = start.offset;
        while row < hi {
            let mut buf = &pending[..];
            match ColumnValue::decode(&mut buf) {
                Ok(value) => {
                    let used = pending.len() - buf.remaining();
                    pending.advance(used);
                    offset += used as u64;
                    if row >= lo {
                        values.push(value);
                    }
                    row += 1;
                }
                Err(DecodeError::Truncated { .. }) => {
                    let n = file.read(&mut chunk)?;
                    if n == 0 {
                        if !pending.is_empty() {
                            return Err(StorageError::corrupted(path, format!("row {row}: torn value")));
                        }
                        break;
                    }
                    pending.extend_from_slice(&chunk[..n]);
                }
                Err(e) => return Err(StorageError::corrupted(path, format!("row {row}: {e}"))),
            }
        }
        self.cursors.lock().insert(path.to_path_buf(), FileEnd { rows: row, offset });
        Ok(values)
    }
}

fn open_for_append(path: &Path, len: u64) -> io::Result<File> {
    let mut file = OpenOptions::new().write(true).create(true).open(path)?;
    file.set_len(len)?;
    file.seek(SeekFrom::Start(len))?;
    Ok(file)
}

impl PartitionStore for FsPartitionStore {
    fn create_version(&self, version: VersionRef) -> StorageResult<()> {
        let dir = self.version_dir(version);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StorageError::VersionExists(version));
            }
            Err(err) => return Err(err.into()),
        }
        File::create(dir.join(TIMESTAMP_FILE))?;
        Ok(())
    }

    fn append_rows(&self, version: VersionRef, committed_rows: u64, rows: &ColumnBatch) -> StorageResult<()> {
        let dir = self.existing_dir(version)?;

        let ts_path = dir.join(TIMESTAMP_FILE);
        let stored = fs::metadata(&ts_path)?.len() / TIMESTAMP_WIDTH;
        if stored < committed_rows {
            return Err(StorageError::MissingRows {
                version,
                stored,
                expected: committed_rows,
            });
        }
        let mut buf = BytesMut::with_capacity(rows.len() * TIMESTAMP_WIDTH as usize);
        for ts in rows.timestamps() {
            buf.put_i64(ts.as_micros());
        }
        open_for_append(&ts_path, committed_rows * TIMESTAMP_WIDTH)?.write_all(&buf)?;

        for index in 0..rows.column_count() {
            let path = dir.join(format!("{index}.d"));
            let end = self.value_file_end(&path, committed_rows)?;

            buf.clear();
            for _ in end.rows..committed_rows {
                ColumnValue::Null.encode(&mut buf);
            }
            for value in rows.column(index).unwrap_or_default() {
                value.encode(&mut buf);
            }
            open_for_append(&path, end.offset)?.write_all(&buf)?;

            self.ends.lock().insert(
                path,
                FileEnd {
                    rows: committed_rows + rows.len() as u64,
                    offset: end.offset + buf.len() as u64,
                },
            );
        }
        Ok(())
    }

    fn sync_version(&self, version: VersionRef) -> StorageResult<()> {
        let dir = self.existing_dir(version)?;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                File::open(entry.path())?.sync_all()?;
            }
        }
        File::open(&dir)?.sync_all()?;
        File::open(&self.data_dir)?.sync_all()?;
        Ok(())
    }

    fn read_rows(&self, version: VersionRef, lo: u64, hi: u64, column_count: usize) -> StorageResult<ColumnBatch> {
        let dir = self.existing_dir(version)?;
        let lo = lo.min(hi);
        let count = (hi - lo) as usize;

        let mut ts_file = File::open(dir.join(TIMESTAMP_FILE))?;
        let stored = ts_file.metadata()?.len() / TIMESTAMP_WIDTH;
        if stored < hi {
            return Err(StorageError::MissingRows {
                version,
                stored,
                expected: hi,
            });
        }
        let mut ts_bytes = vec![0; count * TIMESTAMP_WIDTH as usize];
        ts_file.seek(SeekFrom::Start(lo * TIMESTAMP_WIDTH))?;
        ts_file.read_exact(&mut ts_bytes)?;
        let mut buf = &ts_bytes[..];
        let timestamps: Vec<Timestamp> = (0..count).map(|_| Timestamp::from_micros(buf.get_i64())).collect();

        let mut columns = Vec::with_capacity(column_count);
        for index in 0..column_count {
            let mut column = self.read_values(&dir.join(format!("{index}.d")), lo, hi)?;
            // Column added after these rows were written.
            column.resize(count, ColumnValue::Null);
            columns.push(column);
        }

        ColumnBatch::from_columns(timestamps, columns)
            .ok_or_else(|| StorageError::corrupted(&dir, "column lengths differ"))
    }

    fn remove_version(&self, version: VersionRef) -> StorageResult<()> {
        let dir = self.version_dir(version);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.ends.lock().retain(|path, _| !path.starts_with(&dir));
        self.cursors.lock().retain(|path, _| !path.starts_with(&dir));
        debug!(dir = %dir.display(), "removed partition version");
        Ok(())
    }

    fn list_versions(&self) -> StorageResult<Vec<VersionRef>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            match self.parse_dir_name(&name) {
                Some(version) => versions.push(version),
                None => warn!(dir = %entry.path().display(), "ignoring unknown directory in partition store"),
            }
        }
        versions.sort();
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::types::PartitionKey;
    use tempfile::TempDir;

    fn batch(rows: &[(i64, i32)]) -> ColumnBatch {
        let mut batch = ColumnBatch::new(1);
        for &(ts, v) in rows {
            batch.push_row(Timestamp::from_micros(ts), [ColumnValue::Int(v)]);
        }
        batch
    }

    fn day(y: i64, m: u32, d: u32) -> PartitionKey {
        PartitionBy::Day.partition_of(Timestamp::from_ymd_hms(y, m, d, 0, 0, 0))
    }

    #[test]
    fn test_create_append_read() {
        let tmp = TempDir::new().unwrap();
        let store = FsPartitionStore::open(tmp.path().join("data"), PartitionBy::Day).unwrap();
        let v = VersionRef::new(day(2024, 1, 5), 1);

        store.create_version(v).unwrap();
        assert!(matches!(store.create_version(v), Err(StorageError::VersionExists(_))));
        assert!(tmp.path().join("data/2024-01-05.1/ts.d").exists());

        store.append_rows(v, 0, &batch(&[(1, 10), (2, 20)])).unwrap();
        store.append_rows(v, 2, &batch(&[(3, 30)])).unwrap();
        store.sync_version(v).unwrap();

        let rows = store.read_rows(v, 1, 3, 1).unwrap();
        assert_eq!(rows, batch(&[(2, 20), (3, 30)]));
        assert_eq!(store.list_versions().unwrap(), vec![v]);

        store.remove_version(v).unwrap();
        assert!(store.list_versions().unwrap().is_empty());
        assert!(matches!(store.read_rows(v, 0, 1, 1), Err(StorageError::VersionNotFound(_))));
    }

    #[test]
    fn test_uncommitted_tail_is_cut() {
        let tmp = TempDir::new().unwrap();
        let store = FsPartitionStore::open(tmp.path(), PartitionBy::Day).unwrap();
        let v = VersionRef::new(day(2024, 1, 5), 1);
        store.create_version(v).unwrap();
        store.append_rows(v, 0, &batch(&[(1, 10), (2, 20)])).unwrap();
        // A publish that never completed.
        store.append_rows(v, 2, &batch(&[(3, 30), (4, 40)])).unwrap();

        // A fresh store has no cached ends and must scan.
        let store = FsPartitionStore::open(tmp.path(), PartitionBy::Day).unwrap();
        store.append_rows(v, 2, &batch(&[(5, 50)])).unwrap();
        assert_eq!(store.read_rows(v, 0, 3, 1).unwrap(), batch(&[(1, 10), (2, 20), (5, 50)]));
        assert_eq!(
            std::fs::metadata(store.version_dir(v).join(TIMESTAMP_FILE)).unwrap().len(),
            3 * TIMESTAMP_WIDTH
        );
    }

    #[test]
    fn test_added_column_reads_and_pads_nulls() {
        let tmp = TempDir::new().unwrap();
        let store = FsPartitionStore::open(tmp.path(), PartitionBy::Day).unwrap();
        let v = VersionRef::new(day(2024, 1, 5), 1);
        store.create_version(v).unwrap();
        store.append_rows(v, 0, &batch(&[(1, 10)])).unwrap();

        let read = store.read_rows(v, 0, 1, 2).unwrap();
        assert_eq!(read.column(1).unwrap(), &[ColumnValue::Null]);

        let mut wide = ColumnBatch::new(2);
        wide.push_row(Timestamp::from_micros(2), [ColumnValue::Int(20), ColumnValue::from("x")]);
        store.append_rows(v, 1, &wide).unwrap();

        let read = store.read_rows(v, 0, 2, 2).unwrap();
        assert_eq!(read.column(1).unwrap(), &[ColumnValue::Null, ColumnValue::from("x")]);
    }

    #[test]
    fn test_missing_rows() {
        let tmp = TempDir::new().unwrap();
        let store = FsPartitionStore::open(tmp.path(), PartitionBy::Day).unwrap();
        let v = VersionRef::new(day(2024, 1, 5), 1);
        store.create_version(v).unwrap();
        store.append_rows(v, 0, &batch(&[(1, 10)])).unwrap();
        let err = store.append_rows(v, 5, &batch(&[(2, 20)])).unwrap_err();
        assert!(err.is_corruption());
        assert!(store.read_rows(v, 0, 2, 1).unwrap_err().is_corruption());
    }

    #[test]
    fn test_list_ignores_unknown_dirs() {
        let tmp = TempDir::new().unwrap();
        let store = FsPartitionStore::open(tmp.path(), PartitionBy::Day).unwrap();
        std::fs::create_dir(tmp.path().join("junk")).unwrap();
        std::fs::create_dir(tmp.path().join("2024-01-05.x")).unwrap();
        let v = VersionRef::new(day(2024, 1, 5), 7);
        store.create_version(v).unwrap();
        assert_eq!(store.list_versions().unwrap(), vec![v]);
    }

    #[test]
    fn test_chunked_reads_resume_where_the_last_stopped() {
        let tmp = TempDir::new().unwrap();
        let store = FsPartitionStore::open(tmp.path(), PartitionBy::Day).unwrap();
        let v = VersionRef::new(day(2024, 1, 5), 1);
        store.create_version(v).unwrap();
        let rows: Vec<(i64, i32)> = (0..10).map(|i| (i, i as i32 * 10)).collect();
        store.append_rows(v, 0, &batch(&rows)).unwrap();

        // A fresh store has no cached offsets.
        let store = FsPartitionStore::open(tmp.path(), PartitionBy::Day).unwrap();
        let mut chunked = ColumnBatch::new(1);
        for lo in (0..10).step_by(3) {
            let hi = (lo + 3).min(10);
            for (ts, values) in store.read_rows(v, lo, hi, 1).unwrap().rows() {
                chunked.push_row(ts, values);
            }
        }
        assert_eq!(chunked, batch(&rows));

        // The next chunk starts from the cached offset, not from the first
        // value: damage before it goes unnoticed.
        store.read_rows(v, 0, 6, 1).unwrap();
        let path = store.version_dir(v).join("0.d");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = 0xff;
        std::fs::write(&path, bytes).unwrap();
        assert_eq!(store.read_rows(v, 6, 10, 1).unwrap(), batch(&rows[6..]));
        assert!(store.read_rows(v, 0, 1, 1).unwrap_err().is_corruption());
        let fresh = FsPartitionStore::open(tmp.path(), PartitionBy::Day).unwrap();
        assert!(fresh.read_rows(v, 6, 10, 1).unwrap_err().is_corruption());
    }
}

