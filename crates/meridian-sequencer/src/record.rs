//! Commit log records.
//!
//! Every record is exactly [`TxnRecord::SIZE`] bytes, so the record of txn
//! `n` lives at a fixed offset and the log can be read from any point
//! without an index.
//!
//! ```text
//! +---------+----------+--------+---------+-------------+
//! | txn (8) | sv (8)   | wal(4) | seg (4) | seg_txn (8) |
//! +---------+----------+--------+---------+-------------+
//! | row_lo (8) | row_hi (8) | commit_ts (8) | flags (2) |
//! +------------+------------+---------------+-----------+
//! | reserved (2) | crc32 (4) |
//! +--------------+-----------+
//! ```

use bytes::{Buf, BufMut};

use meridian_common::types::{SegmentId, StructureVersion, Timestamp, TxnId, WalId};

bitflags::bitflags! {
    /// Flags of a commit record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxnFlags: u16 {
        /// The transaction occupies its slot but carries nothing to apply.
        const ROLLBACK = 0b0000_0001;
        /// Everything before must be published before this record applies.
        const BARRIER = 0b0000_0010;
        /// Every earlier txn must be durably applied first, and the result is
        /// published right after.
        const WAIT_ALL_DONE = 0b0000_0100;
        /// The record bumps the structure version.
        const STRUCTURE = 0b0000_1000;
        /// The record removes all rows of the table.
        const TRUNCATE = 0b0001_0000;
    }
}

/// What a commit record does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnKind {
    /// Rows in a WAL segment.
    Data,
    /// Structure change; the change itself is in the structure log.
    Structure,
    /// Removes all rows.
    Truncate,
}

impl std::fmt::Display for TxnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Data => "data",
            Self::Structure => "structure",
            Self::Truncate => "truncate",
        })
    }
}

/// One record of the commit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnRecord {
    /// Assigned transaction id.
    pub txn: TxnId,
    /// For data records, the structure version the rows were written
    /// against; for structure records, the version they produce.
    pub structure_version: StructureVersion,
    /// Writer directory of the data ([`WalId::METADATA`] for non-data records).
    pub wal_id: WalId,
    /// Segment of the data.
    pub segment_id: SegmentId,
    /// Data event within the segment.
    pub segment_txn: u64,
    /// First row (segment-relative).
    pub row_lo: u64,
    /// One past the last row.
    pub row_hi: u64,
    /// Wall clock time of the commit.
    pub commit_ts: Timestamp,
    /// Record flags.
    pub flags: TxnFlags,
}

impl TxnRecord {
    /// Size of a serialized record.
    pub const SIZE: usize = 64;

    /// Returns what the record does.
    pub fn kind(&self) -> TxnKind {
        if self.flags.contains(TxnFlags::STRUCTURE) {
            TxnKind::Structure
        } else if self.flags.contains(TxnFlags::TRUNCATE) {
            TxnKind::Truncate
        } else {
            TxnKind::Data
        }
    }

    /// Returns true if the record carries nothing to apply.
    pub fn is_rollback(&self) -> bool {
        self.flags.contains(TxnFlags::ROLLBACK)
    }

    /// Returns true if the record is a synchronization barrier.
    pub fn is_barrier(&self) -> bool {
        self.flags.contains(TxnFlags::BARRIER)
    }

    /// Returns true if all earlier txns must be applied first.
    pub fn wait_all_done(&self) -> bool {
        self.flags.contains(TxnFlags::WAIT_ALL_DONE)
    }

    /// Returns true if the record references WAL rows to apply.
    pub fn has_rows(&self) -> bool {
        self.kind() == TxnKind::Data && !self.is_rollback() && self.wal_id.is_data()
    }

    /// Number of rows referenced.
    pub fn row_count(&self) -> u64 {
        self.row_hi.saturating_sub(self.row_lo)
    }

    /// Serializes the record, checksum included.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u64(self.txn.get());
        cursor.put_u64(self.structure_version.get());
        cursor.put_u32(self.wal_id.get());
        cursor.put_u32(self.segment_id.get());
        cursor.put_u64(self.segment_txn);
        cursor.put_u64(self.row_lo);
        cursor.put_u64(self.row_hi);
        cursor.put_i64(self.commit_ts.as_micros());
        cursor.put_u16(self.flags.bits());
        cursor.put_u16(0); // reserved
        let checksum = crc32fast::hash(&buf[..Self::SIZE - 4]);
        buf[Self::SIZE - 4..].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// Deserializes a record. Returns `None` if the checksum does not match.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Option<Self> {
        let stored = u32::from_be_bytes([bytes[60], bytes[61], bytes[62], bytes[63]]);
        if crc32fast::hash(&bytes[..Self::SIZE - 4]) != stored {
            return None;
        }
        let mut buf = &bytes[..];
        let txn = TxnId::new(buf.get_u64());
        let structure_version = StructureVersion::new(buf.get_u64());
        let wal_id = WalId::new(buf.get_u32());
        let segment_id = SegmentId::new(buf.get_u32());
        let segment_txn = buf.get_u64();
        let row_lo = buf.get_u64();
        let row_hi = buf.get_u64();
        let commit_ts = Timestamp::from_micros(buf.get_i64());
        let flags = TxnFlags::from_bits_truncate(buf.get_u16());
        Some(Self {
            txn,
            structure_version,
            wal_id,
            segment_id,
            segment_txn,
            row_lo,
            row_hi,
            commit_ts,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_record() -> TxnRecord {
        TxnRecord {
            txn: TxnId::new(7),
            structure_version: StructureVersion::new(2),
            wal_id: WalId::new(3),
            segment_id: SegmentId::new(1),
            segment_txn: 4,
            row_lo: 10,
            row_hi: 15,
            commit_ts: Timestamp::from_micros(1_700_000_000_000_000),
            flags: TxnFlags::empty(),
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let record = data_record();
        let bytes = record.to_bytes();
        assert_eq!(TxnRecord::from_bytes(&bytes), Some(record));
        assert_eq!(record.kind(), TxnKind::Data);
        assert!(record.has_rows());
        assert_eq!(record.row_count(), 5);
    }

    #[test]
    fn test_checksum_detects_damage() {
        let mut bytes = data_record().to_bytes();
        bytes[20] ^= 0x01;
        assert_eq!(TxnRecord::from_bytes(&bytes), None);
        assert_eq!(TxnRecord::from_bytes(&[0u8; TxnRecord::SIZE]), None);
    }

    #[test]
    fn test_kinds() {
        let mut record = data_record();
        record.flags = TxnFlags::STRUCTURE | TxnFlags::BARRIER;
        assert_eq!(record.kind(), TxnKind::Structure);
        assert!(record.is_barrier());
        assert!(!record.has_rows());

        record.flags = TxnFlags::TRUNCATE | TxnFlags::BARRIER | TxnFlags::WAIT_ALL_DONE;
        assert_eq!(record.kind(), TxnKind::Truncate);
        assert!(record.wait_all_done());

        record.flags = TxnFlags::ROLLBACK;
        assert!(record.is_rollback());
        assert!(!record.has_rows());
    }
}
