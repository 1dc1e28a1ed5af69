//! WAL segment reader.
//!
//! This module provides the reader the apply engine uses to fetch the rows
//! of committed data events:
//! - Reading and validating every event of a segment
//! - Indexing data events by their segment txn
//! - Tolerating a torn tail left by an interrupted append

use std::path::{Path, PathBuf};

use tracing::warn;

use meridian_common::types::DecodeError;

use crate::error::{WalError, WalResult};
use crate::record::header::EventHeader;
use crate::record::payload::{DataPayload, SealPayload, SegmentHeaderPayload};
use crate::record::types::WalEvent;

/// All events of one segment, loaded into memory.
#[derive(Debug)]
pub struct SegmentReader {
    /// Path to the events file.
    path: PathBuf,
    /// Segment header.
    header: SegmentHeaderPayload,
    /// Data events, indexed by segment txn.
    data: Vec<DataPayload>,
    /// Seal event, if the segment is sealed.
    seal: Option<SealPayload>,
    /// Length of the valid prefix of the file.
    valid_len: u64,
}

impl SegmentReader {
    /// Reads and validates a segment's events file.
    ///
    /// An incomplete or damaged last event is ignored: it can only be the
    /// remains of an append that never returned. Damage followed by more
    /// events is reported as corruption.
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = std::fs::read(&path)?;

        let mut offset = 0usize;
        let mut header = None;
        let mut data = Vec::new();
        let mut seal = None;

        while offset < bytes.len() {
            let event = match Self::read_event(&bytes, offset) {
                Ok(event) => event,
                Err(err) => {
                    if Self::is_tail(&bytes, offset) {
                        warn!(
                            path = %path.display(),
                            offset,
                            error = %err,
                            "ignoring torn tail of WAL segment"
                        );
                        break;
                    }
                    return Err(WalError::segment_corrupted(&path, offset as u64, err.to_string()));
                }
            };
            let (event, size) = event;

            if seal.is_some() {
                return Err(WalError::segment_corrupted(&path, offset as u64, "event after seal"));
            }

            match event {
                WalEvent::SegmentHeader(payload) => {
                    if header.is_some() || offset != 0 {
                        return Err(WalError::segment_corrupted(
                            &path,
                            offset as u64,
                            "segment header in the middle of a segment",
                        ));
                    }
                    payload.validate()?;
                    header = Some(payload);
                }
                WalEvent::Data(payload) => {
                    if header.is_none() {
                        return Err(WalError::segment_corrupted(&path, 0, "missing segment header"));
                    }
                    if payload.segment_txn != data.len() as u64 {
                        return Err(WalError::segment_corrupted(
                            &path,
                            offset as u64,
                            format!(
                                "data event out of sequence: expected {}, found {}",
                                data.len(),
                                payload.segment_txn
                            ),
                        ));
                    }
                    data.push(payload);
                }
                WalEvent::Seal(payload) => seal = Some(payload),
            }
            offset += size;
        }

        let header = header.ok_or_else(|| WalError::segment_corrupted(&path, 0, "missing segment header"))?;

        Ok(Self {
            path,
            header,
            data,
            seal,
            valid_len: offset as u64,
        })
    }

    /// Decodes the event starting at `offset`, returning it and its size.
    fn read_event(bytes: &[u8], offset: usize) -> WalResult<(WalEvent, usize)> {
        let header = EventHeader::from_bytes(&bytes[offset..])?;
        let start = offset + EventHeader::SIZE;
        let end = start + header.payload_length as usize;
        if end > bytes.len() {
            return Err(WalError::Decode(DecodeError::Truncated {
                needed: end - offset,
                available: bytes.len() - offset,
            }));
        }

        let payload = &bytes[start..end];
        if !header.verify_checksum(payload) {
            return Err(WalError::checksum_mismatch(
                offset as u64,
                header.checksum,
                header.compute_checksum(payload),
            ));
        }

        Ok((WalEvent::from_payload(&header, payload)?, header.total_size()))
    }

    /// Returns true if the event at `offset` is the last thing in the file,
    /// judged by its declared length.
    fn is_tail(bytes: &[u8], offset: usize) -> bool {
        match EventHeader::from_bytes(&bytes[offset..]) {
            Ok(header) => offset + header.total_size() >= bytes.len(),
            Err(_) => bytes.len() - offset <= EventHeader::SIZE,
        }
    }

    /// Returns the segment header.
    pub fn header(&self) -> &SegmentHeaderPayload {
        &self.header
    }

    /// Returns all data events in order.
    pub fn data_events(&self) -> &[DataPayload] {
        &self.data
    }

    /// Returns the data event with the given segment txn.
    pub fn event(&self, segment_txn: u64) -> Option<&DataPayload> {
        usize::try_from(segment_txn).ok().and_then(|i| self.data.get(i))
    }

    /// Returns the data event referenced by a commit, checking its row range.
    pub fn committed_event(&self, segment_txn: u64, row_lo: u64, row_hi: u64) -> WalResult<&DataPayload> {
        let event = self.event(segment_txn).ok_or(WalError::EventNotFound {
            wal_id: self.header.wal_id,
            segment_id: self.header.segment_id,
            segment_txn,
        })?;
        if event.row_lo != row_lo || event.row_hi != row_hi {
            return Err(WalError::RowRangeMismatch {
                segment_txn,
                lo: row_lo,
                hi: row_hi,
                event_lo: event.row_lo,
                event_hi: event.row_hi,
            });
        }
        Ok(event)
    }

    /// Returns the seal event, if present.
    pub fn seal(&self) -> Option<&SealPayload> {
        self.seal.as_ref()
    }

    /// Returns true if the segment is sealed.
    pub fn is_sealed(&self) -> bool {
        self.seal.is_some()
    }

    /// Returns the length of the valid prefix of the file.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Returns the path of the events file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use crate::segment::WalSegment;
    use meridian_common::types::{
        ColumnBatch, ColumnValue, SegmentId, StructureVersion, TableId, Timestamp, WalId,
    };
    use std::io::Write;
    use tempfile::TempDir;

    fn rows(values: &[i64]) -> ColumnBatch {
        let mut batch = ColumnBatch::new(1);
        for v in values {
            batch.push_row(Timestamp::from_micros(*v), [ColumnValue::Long(*v)]);
        }
        batch
    }

    fn write_segment(tmp: &TempDir) -> WalSegment {
        let segment = WalSegment::create(
            tmp.path().join("0"),
            TableId::new(1),
            WalId::new(1),
            SegmentId::new(0),
        )
        .unwrap();
        let config = WalConfig::default();
        segment.append_data(StructureVersion::INITIAL, rows(&[1, 2]), &config).unwrap();
        segment.append_data(StructureVersion::new(1), rows(&[3]), &config).unwrap();
        segment
    }

    #[test]
    fn test_read_segment() {
        let tmp = TempDir::new().unwrap();
        let segment = write_segment(&tmp);

        let reader = SegmentReader::open(segment.path()).unwrap();
        assert_eq!(reader.header().wal_id, WalId::new(1));
        assert_eq!(reader.data_events().len(), 2);
        assert!(!reader.is_sealed());

        let event = reader.committed_event(1, 2, 3).unwrap();
        assert_eq!(event.structure_version, StructureVersion::new(1));
        assert_eq!(event.rows.timestamps(), &[Timestamp::from_micros(3)]);

        assert!(matches!(
            reader.committed_event(1, 0, 1),
            Err(WalError::RowRangeMismatch { .. })
        ));
        assert!(matches!(
            reader.committed_event(5, 0, 1),
            Err(WalError::EventNotFound { segment_txn: 5, .. })
        ));
    }

    #[test]
    fn test_read_sealed_segment() {
        let tmp = TempDir::new().unwrap();
        let segment = write_segment(&tmp);
        segment.seal().unwrap();

        let reader = SegmentReader::open(segment.path()).unwrap();
        let seal = reader.seal().unwrap();
        assert_eq!(seal.event_count, 2);
        assert_eq!(seal.row_count, 3);
        assert_eq!(reader.valid_len(), segment.write_position());
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let segment = write_segment(&tmp);
        let valid = segment.write_position();

        let mut file = std::fs::OpenOptions::new().append(true).open(segment.path()).unwrap();
        file.write_all(&[0, 0, 1, 0, 0xAB, 0xCD]).unwrap();
        drop(file);

        let reader = SegmentReader::open(segment.path()).unwrap();
        assert_eq!(reader.data_events().len(), 2);
        assert_eq!(reader.valid_len(), valid);
    }

    #[test]
    fn test_corruption_in_the_middle() {
        let tmp = TempDir::new().unwrap();
        let segment = write_segment(&tmp);
        segment.seal().unwrap();

        let mut bytes = std::fs::read(segment.path()).unwrap();
        // Flip a byte inside the first data event's payload.
        let first_data = EventHeader::SIZE + SegmentHeaderPayload::SIZE + EventHeader::SIZE + 2;
        bytes[first_data] ^= 0xFF;
        std::fs::write(segment.path(), &bytes).unwrap();

        let err = SegmentReader::open(segment.path()).unwrap_err();
        assert!(err.is_corruption());
    }
}
