//! Column types and column values.
//!
//! Values travel through WAL segments and partition column files in the
//! same tagged binary encoding: one tag byte followed by a big-endian
//! payload. Strings carry a `u32` length prefix.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::timestamps::Timestamp;

/// Error decoding a binary value or record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ended before the value did.
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// Unknown value or type tag.
    #[error("unknown tag {tag:#04x} for {what}")]
    UnknownTag {
        /// What was being decoded.
        what: &'static str,
        /// The tag found.
        tag: u8,
    },

    /// A string payload was not valid UTF-8.
    #[error("invalid utf-8 in string value")]
    InvalidUtf8,
}

/// Checks that `buf` holds at least `needed` bytes.
///
/// # Errors
///
/// Returns [`DecodeError::Truncated`] otherwise.
#[inline]
pub fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), DecodeError> {
    let available = buf.remaining();
    if available < needed {
        return Err(DecodeError::Truncated { needed, available });
    }
    Ok(())
}

/// Writes a length-prefixed UTF-8 string.
pub fn put_str(buf: &mut impl BufMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Reads a string written by [`put_str`].
///
/// # Errors
///
/// Fails on truncated input or invalid UTF-8.
pub fn get_str(buf: &mut impl Buf) -> Result<String, DecodeError> {
    ensure_remaining(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure_remaining(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
}

/// Type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// `true` / `false`.
    Boolean,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Long,
    /// 64-bit float.
    Double,
    /// Interned string. Stored like a varchar.
    Symbol,
    /// Variable length string.
    Varchar,
    /// Microsecond timestamp (non-designated).
    Timestamp,
}

impl ColumnType {
    /// Every column type, in code order.
    pub const ALL: [Self; 7] = [
        Self::Boolean,
        Self::Int,
        Self::Long,
        Self::Double,
        Self::Symbol,
        Self::Varchar,
        Self::Timestamp,
    ];

    /// Stable numeric code used in binary formats.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Boolean => 1,
            Self::Int => 2,
            Self::Long => 3,
            Self::Double => 4,
            Self::Symbol => 5,
            Self::Varchar => 6,
            Self::Timestamp => 7,
        }
    }

    /// Parses a code written by [`ColumnType::as_u8`].
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownTag`] for unknown codes.
    pub const fn from_u8(code: u8) -> Result<Self, DecodeError> {
        Ok(match code {
            1 => Self::Boolean,
            2 => Self::Int,
            3 => Self::Long,
            4 => Self::Double,
            5 => Self::Symbol,
            6 => Self::Varchar,
            7 => Self::Timestamp,
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "column type",
                    tag,
                })
            }
        })
    }

    /// Returns true for string-backed types.
    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(self, Self::Symbol | Self::Varchar)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boolean => "BOOLEAN",
            Self::Int => "INT",
            Self::Long => "LONG",
            Self::Double => "DOUBLE",
            Self::Symbol => "SYMBOL",
            Self::Varchar => "VARCHAR",
            Self::Timestamp => "TIMESTAMP",
        };
        f.write_str(name)
    }
}

/// A single column value. `Null` is valid for every column type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum ColumnValue {
    /// Absent value (also used for columns not set in a row).
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// Int value.
    Int(i32),
    /// Long value.
    Long(i64),
    /// Double value.
    Double(f64),
    /// Symbol or varchar value.
    Str(String),
    /// Timestamp value.
    Timestamp(Timestamp),
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_LONG: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_TIMESTAMP: u8 = 6;

impl ColumnValue {
    /// Returns true for [`ColumnValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true if the value can be stored as-is in a column of type `ty`.
    #[must_use]
    pub fn matches_type(&self, ty: ColumnType) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(_) => ty == ColumnType::Boolean,
            Self::Int(_) => ty == ColumnType::Int,
            Self::Long(_) => ty == ColumnType::Long,
            Self::Double(_) => ty == ColumnType::Double,
            Self::Str(_) => ty.is_string(),
            Self::Timestamp(_) => ty == ColumnType::Timestamp,
        }
    }

    /// Converts a value supplied by a writer into the representation of a
    /// column of type `ty`. Only lossless widening is accepted.
    ///
    /// Returns `None` when the value does not fit the column.
    #[must_use]
    pub fn coerce(self, ty: ColumnType) -> Option<Self> {
        if self.matches_type(ty) {
            return Some(self);
        }
        match (self, ty) {
            (Self::Int(v), ColumnType::Long) => Some(Self::Long(i64::from(v))),
            (Self::Int(v), ColumnType::Double) => Some(Self::Double(f64::from(v))),
            (Self::Long(v), ColumnType::Timestamp) => {
                Some(Self::Timestamp(Timestamp::from_micros(v)))
            }
            _ => None,
        }
    }

    /// Converts a stored value to another column type, as done when a
    /// column's type changes. Values that cannot be represented become null.
    #[must_use]
    pub fn cast(&self, ty: ColumnType) -> Self {
        if self.matches_type(ty) {
            return self.clone();
        }
        match (self, ty) {
            (Self::Null, _) => Self::Null,
            (v, ColumnType::Symbol | ColumnType::Varchar) => Self::Str(v.to_string()),
            (Self::Bool(b), ColumnType::Int) => Self::Int(i32::from(*b)),
            (Self::Bool(b), ColumnType::Long) => Self::Long(i64::from(*b)),
            (Self::Int(v), ColumnType::Long) => Self::Long(i64::from(*v)),
            (Self::Int(v), ColumnType::Double) => Self::Double(f64::from(*v)),
            (Self::Int(v), ColumnType::Boolean) => Self::Bool(*v != 0),
            (Self::Long(v), ColumnType::Int) => i32::try_from(*v).map_or(Self::Null, Self::Int),
            (Self::Long(v), ColumnType::Double) => Self::Double(*v as f64),
            (Self::Long(v), ColumnType::Timestamp) => {
                Self::Timestamp(Timestamp::from_micros(*v))
            }
            (Self::Long(v), ColumnType::Boolean) => Self::Bool(*v != 0),
            (Self::Double(v), ColumnType::Int) if v.is_finite() => {
                let t = v.trunc();
                if t >= f64::from(i32::MIN) && t <= f64::from(i32::MAX) {
                    Self::Int(t as i32)
                } else {
                    Self::Null
                }
            }
            (Self::Double(v), ColumnType::Long) if v.is_finite() => {
                let t = v.trunc();
                if t >= i64::MIN as f64 && t < i64::MAX as f64 {
                    Self::Long(t as i64)
                } else {
                    Self::Null
                }
            }
            (Self::Timestamp(ts), ColumnType::Long) => Self::Long(ts.as_micros()),
            (Self::Timestamp(ts), ColumnType::Double) => Self::Double(ts.as_micros() as f64),
            (Self::Str(s), ColumnType::Boolean) => match s.as_str() {
                "true" => Self::Bool(true),
                "false" => Self::Bool(false),
                _ => Self::Null,
            },
            (Self::Str(s), ColumnType::Int) => s.parse().map_or(Self::Null, Self::Int),
            (Self::Str(s), ColumnType::Long) => s.parse().map_or(Self::Null, Self::Long),
            (Self::Str(s), ColumnType::Double) => s.parse().map_or(Self::Null, Self::Double),
            (Self::Str(s), ColumnType::Timestamp) => s
                .parse::<i64>()
                .map_or(Self::Null, |v| Self::Timestamp(Timestamp::from_micros(v))),
            _ => Self::Null,
        }
    }

    /// Number of bytes [`ColumnValue::encode`] writes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 4,
            Self::Long(_) | Self::Double(_) | Self::Timestamp(_) => 8,
            Self::Str(s) => 4 + s.len(),
        }
    }

    /// Writes the tagged encoding of the value.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::Null => buf.put_u8(TAG_NULL),
            Self::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*b));
            }
            Self::Int(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i32(*v);
            }
            Self::Long(v) => {
                buf.put_u8(TAG_LONG);
                buf.put_i64(*v);
            }
            Self::Double(v) => {
                buf.put_u8(TAG_DOUBLE);
                buf.put_f64(*v);
            }
            Self::Str(s) => {
                buf.put_u8(TAG_STR);
                put_str(buf, s);
            }
            Self::Timestamp(ts) => {
                buf.put_u8(TAG_TIMESTAMP);
                buf.put_i64(ts.as_micros());
            }
        }
    }

    /// Reads a value written by [`ColumnValue::encode`].
    ///
    /// # Errors
    ///
    /// Fails on truncated input, unknown tags or invalid UTF-8.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure_remaining(buf, 1)?;
        let tag = buf.get_u8();
        let value = match tag {
            TAG_NULL => Self::Null,
            TAG_BOOL => {
                ensure_remaining(buf, 1)?;
                Self::Bool(buf.get_u8() != 0)
            }
            TAG_INT => {
                ensure_remaining(buf, 4)?;
                Self::Int(buf.get_i32())
            }
            TAG_LONG => {
                ensure_remaining(buf, 8)?;
                Self::Long(buf.get_i64())
            }
            TAG_DOUBLE => {
                ensure_remaining(buf, 8)?;
                Self::Double(buf.get_f64())
            }
            TAG_STR => Self::Str(get_str(buf)?),
            TAG_TIMESTAMP => {
                ensure_remaining(buf, 8)?;
                Self::Timestamp(Timestamp::from_micros(buf.get_i64()))
            }
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "column value",
                    tag,
                })
            }
        };
        Ok(value)
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
            Self::Timestamp(ts) => write!(f, "{}", ts.as_micros()),
        }
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Timestamp> for ColumnValue {
    fn from(v: Timestamp) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_value_codec() {
        let values = vec![
            ColumnValue::Null,
            ColumnValue::Bool(true),
            ColumnValue::Int(-7),
            ColumnValue::Long(1 << 40),
            ColumnValue::Double(2.5),
            ColumnValue::Str("héllo".into()),
            ColumnValue::Timestamp(Timestamp::from_micros(99)),
        ];
        let mut buf = BytesMut::new();
        for v in &values {
            v.encode(&mut buf);
        }
        assert_eq!(buf.len(), values.iter().map(ColumnValue::encoded_len).sum::<usize>());

        let mut read = buf.freeze();
        for v in &values {
            assert_eq!(&ColumnValue::decode(&mut read).unwrap(), v);
        }
        assert!(read.is_empty());
    }

    #[test]
    fn test_decode_errors() {
        let mut buf: &[u8] = &[TAG_LONG, 0, 1];
        assert!(matches!(
            ColumnValue::decode(&mut buf),
            Err(DecodeError::Truncated { needed: 8, .. })
        ));

        let mut buf: &[u8] = &[0xEE];
        assert!(matches!(
            ColumnValue::decode(&mut buf),
            Err(DecodeError::UnknownTag { tag: 0xEE, .. })
        ));

        let mut buf: &[u8] = &[TAG_STR, 0, 0, 0, 2, 0xFF, 0xFE];
        assert_eq!(ColumnValue::decode(&mut buf), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(ColumnValue::Int(3).coerce(ColumnType::Long), Some(ColumnValue::Long(3)));
        assert_eq!(ColumnValue::Null.coerce(ColumnType::Int), Some(ColumnValue::Null));
        assert_eq!(
            ColumnValue::from("x").coerce(ColumnType::Symbol),
            Some(ColumnValue::Str("x".into()))
        );
        assert_eq!(ColumnValue::Long(3).coerce(ColumnType::Int), None);
        assert_eq!(ColumnValue::Bool(true).coerce(ColumnType::Varchar), None);
    }

    #[test]
    fn test_cast() {
        assert_eq!(ColumnValue::Int(5).cast(ColumnType::Varchar), ColumnValue::Str("5".into()));
        assert_eq!(ColumnValue::Str("42".into()).cast(ColumnType::Long), ColumnValue::Long(42));
        assert_eq!(ColumnValue::Str("abc".into()).cast(ColumnType::Int), ColumnValue::Null);
        assert_eq!(ColumnValue::Long(1 << 40).cast(ColumnType::Int), ColumnValue::Null);
        assert_eq!(ColumnValue::Double(3.9).cast(ColumnType::Int), ColumnValue::Int(3));
        assert_eq!(ColumnValue::Double(f64::NAN).cast(ColumnType::Long), ColumnValue::Null);
        assert_eq!(ColumnValue::Null.cast(ColumnType::Double), ColumnValue::Null);
    }

    #[test]
    fn test_column_type_codes() {
        for ty in ColumnType::ALL {
            assert_eq!(ColumnType::from_u8(ty.as_u8()), Ok(ty));
        }
        assert!(ColumnType::from_u8(0).is_err());
    }
}
