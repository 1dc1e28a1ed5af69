//! WAL event types and flags.
//!
//! This module defines the event types and the main `WalEvent` enum.

use bytes::{Bytes, BytesMut};

use super::header::EventHeader;
use super::payload::{DataPayload, Payload, SealPayload, SegmentHeaderPayload};
use crate::error::{WalError, WalResult};
use meridian_common::types::DecodeError;

/// Event type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    /// Segment header (first event in each segment).
    SegmentHeader = 1,
    /// One committed batch of rows.
    Data = 2,
    /// Segment seal (last event of a closed segment).
    Seal = 3,
}

impl EventType {
    /// Converts the event type to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates an event type from a u8.
    pub fn from_u8(value: u8) -> WalResult<Self> {
        match value {
            1 => Ok(Self::SegmentHeader),
            2 => Ok(Self::Data),
            3 => Ok(Self::Seal),
            tag => Err(WalError::Decode(DecodeError::UnknownTag {
                what: "WAL event type",
                tag,
            })),
        }
    }
}

bitflags::bitflags! {
    /// Flags for WAL events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventFlags: u8 {
        /// Rows of a data event are already sorted by timestamp.
        const TIME_ORDERED = 0b0000_0001;
    }
}

/// A decoded WAL event.
#[derive(Debug, Clone, PartialEq)]
pub enum WalEvent {
    /// Segment header.
    SegmentHeader(SegmentHeaderPayload),
    /// Data event.
    Data(DataPayload),
    /// Seal marker.
    Seal(SealPayload),
}

impl WalEvent {
    /// Returns the event type.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::SegmentHeader(_) => EventType::SegmentHeader,
            Self::Data(_) => EventType::Data,
            Self::Seal(_) => EventType::Seal,
        }
    }

    /// Returns the flags written with the event.
    pub fn flags(&self) -> EventFlags {
        match self {
            Self::Data(data) if data.rows.is_time_ordered() => EventFlags::TIME_ORDERED,
            _ => EventFlags::empty(),
        }
    }

    /// Serializes the event (header + payload).
    pub fn serialize(&self) -> WalResult<Bytes> {
        let payload = match self {
            Self::SegmentHeader(p) => p.serialize()?,
            Self::Data(p) => p.serialize()?,
            Self::Seal(p) => p.serialize()?,
        };
        let mut header = EventHeader::new(self.event_type(), self.flags(), payload.len() as u32);
        header.set_checksum(&payload);

        let mut buf = BytesMut::with_capacity(EventHeader::SIZE + payload.len());
        header.serialize(&mut buf);
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Deserializes an event payload whose header has already been read and
    /// verified.
    pub fn from_payload(header: &EventHeader, payload: &[u8]) -> WalResult<Self> {
        Ok(match header.event_type {
            EventType::SegmentHeader => Self::SegmentHeader(SegmentHeaderPayload::deserialize(payload)?),
            EventType::Data => Self::Data(DataPayload::deserialize(payload)?),
            EventType::Seal => Self::Seal(SealPayload::deserialize(payload)?),
        })
    }
}
