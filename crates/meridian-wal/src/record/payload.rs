//! WAL event payloads.
//!
//! This module defines the payload structures for different WAL event types.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use meridian_common::constants::{FORMAT_VERSION, WAL_SEGMENT_MAGIC};
use meridian_common::types::{
    ensure_remaining, ColumnBatch, SegmentId, StructureVersion, TableId, Timestamp, WalId,
};

use crate::error::{WalError, WalResult};

/// Trait for serializable payloads.
pub trait Payload: Sized {
    /// Serializes the payload to bytes.
    fn serialize(&self) -> WalResult<Bytes>;
    /// Deserializes the payload from bytes.
    fn deserialize(bytes: &[u8]) -> WalResult<Self>;
}

/// Segment header payload, the first event of every segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeaderPayload {
    /// Magic number.
    pub magic: u32,
    /// Format version.
    pub version: u32,
    /// Owning table.
    pub table_id: TableId,
    /// Writer directory.
    pub wal_id: WalId,
    /// Segment within the writer directory.
    pub segment_id: SegmentId,
    /// Creation time.
    pub created_at: Timestamp,
}

impl SegmentHeaderPayload {
    /// Size of the serialized payload.
    pub const SIZE: usize = 4 + 4 + 4 + 4 + 4 + 8;

    /// Creates a new segment header payload.
    pub fn new(table_id: TableId, wal_id: WalId, segment_id: SegmentId) -> Self {
        Self {
            magic: WAL_SEGMENT_MAGIC,
            version: FORMAT_VERSION,
            table_id,
            wal_id,
            segment_id,
            created_at: Timestamp::now(),
        }
    }

    /// Validates magic and version.
    pub fn validate(&self) -> WalResult<()> {
        if self.magic != WAL_SEGMENT_MAGIC {
            return Err(WalError::InvalidMagic {
                expected: WAL_SEGMENT_MAGIC,
                found: self.magic,
            });
        }
        if self.version != FORMAT_VERSION {
            return Err(WalError::UnsupportedVersion {
                expected: FORMAT_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

impl Payload for SegmentHeaderPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32(self.magic);
        buf.put_u32(self.version);
        buf.put_u32(self.table_id.get());
        buf.put_u32(self.wal_id.get());
        buf.put_u32(self.segment_id.get());
        buf.put_i64(self.created_at.as_micros());
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut buf = bytes;
        ensure_remaining(&buf, Self::SIZE)?;
        Ok(Self {
            magic: buf.get_u32(),
            version: buf.get_u32(),
            table_id: TableId::new(buf.get_u32()),
            wal_id: WalId::new(buf.get_u32()),
            segment_id: SegmentId::new(buf.get_u32()),
            created_at: Timestamp::from_micros(buf.get_i64()),
        })
    }
}

/// Data event payload: the rows of one commit.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPayload {
    /// Index of this data event within its segment, starting at 0.
    pub segment_txn: u64,
    /// Structure version the rows were written against.
    pub structure_version: StructureVersion,
    /// First row (segment-relative).
    pub row_lo: u64,
    /// One past the last row (segment-relative).
    pub row_hi: u64,
    /// Smallest designated timestamp.
    pub min_ts: Timestamp,
    /// Largest designated timestamp.
    pub max_ts: Timestamp,
    /// Rows, column-major.
    pub rows: ColumnBatch,
}

impl DataPayload {
    /// Creates a data payload. The row range starts at `row_lo`.
    pub fn new(
        segment_txn: u64,
        structure_version: StructureVersion,
        row_lo: u64,
        rows: ColumnBatch,
    ) -> Self {
        Self {
            segment_txn,
            structure_version,
            row_lo,
            row_hi: row_lo + rows.len() as u64,
            min_ts: rows.min_timestamp().unwrap_or(Timestamp::EPOCH),
            max_ts: rows.max_timestamp().unwrap_or(Timestamp::EPOCH),
            rows,
        }
    }

    /// Number of rows.
    pub fn row_count(&self) -> u64 {
        self.row_hi - self.row_lo
    }
}

impl Payload for DataPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(48 + self.rows.len() * 16);
        buf.put_u64(self.segment_txn);
        buf.put_u64(self.structure_version.get());
        buf.put_u64(self.row_lo);
        buf.put_u64(self.row_hi);
        buf.put_i64(self.min_ts.as_micros());
        buf.put_i64(self.max_ts.as_micros());
        self.rows.encode(&mut buf);
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut buf = bytes;
        ensure_remaining(&buf, 48)?;
        let segment_txn = buf.get_u64();
        let structure_version = StructureVersion::new(buf.get_u64());
        let row_lo = buf.get_u64();
        let row_hi = buf.get_u64();
        let min_ts = Timestamp::from_micros(buf.get_i64());
        let max_ts = Timestamp::from_micros(buf.get_i64());
        let rows = ColumnBatch::decode(&mut buf)?;

        if row_hi < row_lo || row_hi - row_lo != rows.len() as u64 {
            return Err(WalError::RowRangeMismatch {
                segment_txn,
                lo: row_lo,
                hi: row_hi,
                event_lo: row_lo,
                event_hi: row_lo + rows.len() as u64,
            });
        }

        Ok(Self {
            segment_txn,
            structure_version,
            row_lo,
            row_hi,
            min_ts,
            max_ts,
            rows,
        })
    }
}

/// Seal payload: totals of a closed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealPayload {
    /// Number of data events in the segment.
    pub event_count: u64,
    /// Number of rows in the segment.
    pub row_count: u64,
}

impl Payload for SealPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(self.event_count);
        buf.put_u64(self.row_count);
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut buf = bytes;
        ensure_remaining(&buf, 16)?;
        Ok(Self {
            event_count: buf.get_u64(),
            row_count: buf.get_u64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::types::ColumnValue;

    #[test]
    fn test_segment_header_payload() {
        let payload = SegmentHeaderPayload::new(TableId::new(3), WalId::new(2), SegmentId::new(7));
        let bytes = payload.serialize().unwrap();
        assert_eq!(bytes.len(), SegmentHeaderPayload::SIZE);

        let decoded = SegmentHeaderPayload::deserialize(&bytes).unwrap();
        assert_eq!(decoded, payload);
        assert!(decoded.validate().is_ok());

        let mut bad = decoded;
        bad.magic = 0xDEAD_BEEF;
        assert!(matches!(bad.validate(), Err(WalError::InvalidMagic { .. })));
    }

    #[test]
    fn test_data_payload() {
        let mut rows = ColumnBatch::new(2);
        rows.push_row(Timestamp::from_micros(20), [ColumnValue::Long(1), ColumnValue::Null]);
        rows.push_row(Timestamp::from_micros(10), [ColumnValue::Long(2), ColumnValue::from("x")]);

        let payload = DataPayload::new(4, StructureVersion::new(2), 100, rows);
        assert_eq!(payload.row_hi, 102);
        assert_eq!(payload.min_ts, Timestamp::from_micros(10));
        assert_eq!(payload.max_ts, Timestamp::from_micros(20));

        let decoded = DataPayload::deserialize(&payload.serialize().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_data_payload_truncated() {
        let payload = DataPayload::new(0, StructureVersion::INITIAL, 0, ColumnBatch::new(0));
        let bytes = payload.serialize().unwrap();
        assert!(DataPayload::deserialize(&bytes[..20]).is_err());
    }

    #[test]
    fn test_seal_payload() {
        let payload = SealPayload {
            event_count: 3,
            row_count: 99,
        };
        assert_eq!(SealPayload::deserialize(&payload.serialize().unwrap()).unwrap(), payload);
    }
}
