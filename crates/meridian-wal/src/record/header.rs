//! WAL event header.
//!
//! The header is a fixed 16-byte structure that precedes every WAL event.

use bytes::{Buf, BufMut};

use super::types::{EventFlags, EventType};
use crate::error::WalResult;
use meridian_common::types::ensure_remaining;

/// WAL event header (16 bytes).
///
/// Layout:
/// - payload_length: 4 bytes
/// - checksum: 4 bytes (CRC32 of type, flags, length and payload)
/// - event_type: 1 byte
/// - flags: 1 byte
/// - reserved: 6 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    /// Length of the payload in bytes.
    pub payload_length: u32,
    /// CRC32 checksum of header fields + payload.
    pub checksum: u32,
    /// Type of event.
    pub event_type: EventType,
    /// Event flags.
    pub flags: EventFlags,
}

impl EventHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 16;

    /// Creates a new event header.
    pub fn new(event_type: EventType, flags: EventFlags, payload_length: u32) -> Self {
        Self {
            payload_length,
            checksum: 0,
            event_type,
            flags,
        }
    }

    /// Serializes the header to bytes.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.payload_length);
        buf.put_u32(self.checksum);
        buf.put_u8(self.event_type.as_u8());
        buf.put_u8(self.flags.bits());
        buf.put_u16(0); // reserved
        buf.put_u32(0); // reserved
    }

    /// Serializes the header to a byte array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        self.serialize(&mut cursor);
        buf
    }

    /// Deserializes a header from bytes.
    pub fn deserialize(buf: &mut impl Buf) -> WalResult<Self> {
        ensure_remaining(buf, Self::SIZE)?;

        let payload_length = buf.get_u32();
        let checksum = buf.get_u32();
        let event_type = EventType::from_u8(buf.get_u8())?;
        let flags = EventFlags::from_bits_truncate(buf.get_u8());
        buf.advance(6);

        Ok(Self {
            payload_length,
            checksum,
            event_type,
            flags,
        })
    }

    /// Deserializes a header from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> WalResult<Self> {
        Self::deserialize(&mut &bytes[..])
    }

    /// Returns the total event size (header + payload).
    pub fn total_size(&self) -> usize {
        Self::SIZE + self.payload_length as usize
    }

    /// Computes the checksum for this header and the given payload.
    pub fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[self.event_type.as_u8(), self.flags.bits()]);
        hasher.update(&self.payload_length.to_be_bytes());
        hasher.update(payload);
        hasher.finalize()
    }

    /// Sets the checksum based on the payload.
    pub fn set_checksum(&mut self, payload: &[u8]) {
        self.checksum = self.compute_checksum(payload);
    }

    /// Verifies the checksum against the payload.
    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == self.compute_checksum(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        let header = EventHeader::new(EventType::Seal, EventFlags::empty(), 0);
        assert_eq!(header.to_bytes().len(), EventHeader::SIZE);
    }

    #[test]
    fn test_header_roundtrip() {
        let mut header = EventHeader::new(EventType::Data, EventFlags::TIME_ORDERED, 256);
        header.set_checksum(&[7u8; 256]);

        let decoded = EventHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_checksum() {
        let mut header = EventHeader::new(EventType::Data, EventFlags::empty(), 10);
        let payload = b"test data!";
        header.set_checksum(payload);

        assert!(header.verify_checksum(payload));
        assert!(!header.verify_checksum(b"wrong data"));

        let mut flipped = header;
        flipped.flags = EventFlags::TIME_ORDERED;
        assert!(!flipped.verify_checksum(payload));
    }

    #[test]
    fn test_unknown_type() {
        let mut bytes = EventHeader::new(EventType::Seal, EventFlags::empty(), 0).to_bytes();
        bytes[8] = 0xEE;
        assert!(EventHeader::from_bytes(&bytes).is_err());
    }
}
