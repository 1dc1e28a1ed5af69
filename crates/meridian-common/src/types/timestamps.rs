//! Timestamps and time partitioning.
//!
//! Rows carry a designated timestamp in microseconds since the Unix epoch.
//! A table is split into partitions of a fixed calendar width; each
//! partition is identified by the timestamp at which it starts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_HOUR: i64 = 3_600 * MICROS_PER_SECOND;
const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

/// A point in time, in microseconds since the Unix epoch.
///
/// # Example
///
/// ```rust
/// use meridian_common::types::Timestamp;
///
/// let ts = Timestamp::from_ymd_hms(2024, 1, 5, 10, 2, 0);
/// assert_eq!(ts.to_string(), "2024-01-05T10:02:00.000000Z");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Self = Self(0);

    /// Smallest representable timestamp.
    pub const MIN: Self = Self(i64::MIN);

    /// Largest representable timestamp.
    pub const MAX: Self = Self(i64::MAX);

    /// Creates a timestamp from microseconds since the Unix epoch.
    #[inline]
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Creates a timestamp from a UTC calendar date and time of day.
    #[must_use]
    pub fn from_ymd_hms(year: i64, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        let days = days_from_civil(year, month, day);
        Self(
            days * MICROS_PER_DAY
                + i64::from(hour) * MICROS_PER_HOUR
                + i64::from(min) * 60 * MICROS_PER_SECOND
                + i64::from(sec) * MICROS_PER_SECOND,
        )
    }

    /// Creates a timestamp from the current system time.
    #[must_use]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(i64::try_from(duration.as_micros()).unwrap_or(i64::MAX))
    }

    /// Returns microseconds since the Unix epoch.
    #[inline]
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Returns this timestamp shifted by `micros`.
    #[inline]
    #[must_use]
    pub const fn add_micros(self, micros: i64) -> Self {
        Self(self.0.saturating_add(micros))
    }

    fn days(self) -> i64 {
        self.0.div_euclid(MICROS_PER_DAY)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({self})")
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (y, m, d) = civil_from_days(self.days());
        let rem = self.0.rem_euclid(MICROS_PER_DAY);
        let hour = rem / MICROS_PER_HOUR;
        let min = (rem % MICROS_PER_HOUR) / (60 * MICROS_PER_SECOND);
        let sec = (rem % (60 * MICROS_PER_SECOND)) / MICROS_PER_SECOND;
        let micros = rem % MICROS_PER_SECOND;
        write!(
            f,
            "{y:04}-{m:02}-{d:02}T{hour:02}:{min:02}:{sec:02}.{micros:06}Z"
        )
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(micros: i64) -> Self {
        Self(micros)
    }
}

/// Width of a table's time partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionBy {
    /// A single partition holding the whole table.
    None,
    /// One partition per hour.
    Hour,
    /// One partition per day.
    Day,
    /// One partition per calendar month.
    Month,
    /// One partition per calendar year.
    Year,
}

impl PartitionBy {
    /// Returns the stable numeric code used in binary formats.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Hour => 1,
            Self::Day => 2,
            Self::Month => 3,
            Self::Year => 4,
        }
    }

    /// Parses a numeric code written by [`PartitionBy::as_u8`].
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Hour),
            2 => Some(Self::Day),
            3 => Some(Self::Month),
            4 => Some(Self::Year),
            _ => None,
        }
    }

    /// Returns the partition containing `ts`.
    #[must_use]
    pub fn partition_of(self, ts: Timestamp) -> PartitionKey {
        let micros = ts.as_micros();
        let floor = match self {
            Self::None => i64::MIN,
            Self::Hour => micros.div_euclid(MICROS_PER_HOUR) * MICROS_PER_HOUR,
            Self::Day => ts.days() * MICROS_PER_DAY,
            Self::Month => {
                let (y, m, _) = civil_from_days(ts.days());
                days_from_civil(y, m, 1) * MICROS_PER_DAY
            }
            Self::Year => {
                let (y, _, _) = civil_from_days(ts.days());
                days_from_civil(y, 1, 1) * MICROS_PER_DAY
            }
        };
        PartitionKey(floor)
    }

    /// Formats a partition key as a directory-friendly name.
    #[must_use]
    pub fn partition_name(self, key: PartitionKey) -> String {
        if self == Self::None {
            return "default".to_string();
        }
        let ts = Timestamp::from_micros(key.0);
        let (y, m, d) = civil_from_days(ts.days());
        match self {
            Self::Hour => {
                let hour = ts.as_micros().rem_euclid(MICROS_PER_DAY) / MICROS_PER_HOUR;
                format!("{y:04}-{m:02}-{d:02}T{hour:02}")
            }
            Self::Day => format!("{y:04}-{m:02}-{d:02}"),
            Self::Month => format!("{y:04}-{m:02}"),
            Self::Year => format!("{y:04}"),
            Self::None => unreachable!("handled above"),
        }
    }

    /// Parses a name produced by [`PartitionBy::partition_name`].
    #[must_use]
    pub fn parse_partition_name(self, name: &str) -> Option<PartitionKey> {
        fn num(s: &str) -> Option<i64> {
            s.parse::<i64>().ok()
        }
        let ts = match self {
            Self::None => return (name == "default").then_some(PartitionKey(i64::MIN)),
            Self::Hour => {
                let (date, hour) = name.split_once('T')?;
                let mut it = date.splitn(3, '-');
                let (y, m, d) = (num(it.next()?)?, num(it.next()?)?, num(it.next()?)?);
                Timestamp::from_ymd_hms(y, u32::try_from(m).ok()?, u32::try_from(d).ok()?, u32::try_from(num(hour)?).ok()?, 0, 0)
            }
            Self::Day => {
                let mut it = name.splitn(3, '-');
                let (y, m, d) = (num(it.next()?)?, num(it.next()?)?, num(it.next()?)?);
                Timestamp::from_ymd_hms(y, u32::try_from(m).ok()?, u32::try_from(d).ok()?, 0, 0, 0)
            }
            Self::Month => {
                let (y, m) = name.split_once('-')?;
                Timestamp::from_ymd_hms(num(y)?, u32::try_from(num(m)?).ok()?, 1, 0, 0, 0)
            }
            Self::Year => Timestamp::from_ymd_hms(num(name)?, 1, 1, 0, 0, 0),
        };
        let key = self.partition_of(ts);
        (self.partition_name(key) == name).then_some(key)
    }
}

impl fmt::Display for PartitionBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Hour => "HOUR",
            Self::Day => "DAY",
            Self::Month => "MONTH",
            Self::Year => "YEAR",
        };
        f.write_str(name)
    }
}

/// Identifies one time partition: the timestamp (micros) at which it starts.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PartitionKey(i64);

impl PartitionKey {
    /// Creates a key from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(floor_micros: i64) -> Self {
        Self(floor_micros)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionKey({})", self.0)
    }
}

// Howard Hinnant's civil calendar algorithms (proleptic Gregorian).
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = i64::from(m);
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}
