//! The TIME_OF_DAY and TIME_DIFFERENCE value types

use chrono::{Datelike, NaiveDate, TimeDelta};
use core::time::Duration;
use snafu::Snafu;

const MILLIS_PER_DAY: u64 = 86_400_000;

/// Only the low 28 bits of the milliseconds field are meaningful on the wire
const MS_MASK: u32 = 0x0FFF_FFFF;

/// Errors creating a [`TimeOfDay`] from calendar values
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum TimeCreateError {
    /// The provided time is before 1984-01-01 and cannot be represented
    PreEpoch,
    /// The provided time is too far in the future to fit a 16-bit day count
    OutOfRange,
    /// The provided calendar date does not exist
    InvalidDate,
}

/// A point in time, counted from the CANopen epoch of 1984-01-01
///
/// Stored as a day count plus milliseconds after midnight, which is also the
/// 6-byte wire layout. The CANopen epoch sits 14 years and 3 leap days after
/// the POSIX epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(TimeDifference);

impl TimeOfDay {
    /// The wire size of a TIME_OF_DAY value
    pub const SIZE: usize = 6;

    /// The CANopen epoch, 1984-01-01T00:00:00
    pub const EPOCH: TimeOfDay = TimeOfDay(TimeDifference::ZERO);

    const CHRONO_EPOCH: NaiveDate = match NaiveDate::from_ymd_opt(1984, 1, 1) {
        Some(d) => d,
        None => unreachable!(),
    };

    /// Seconds between the POSIX epoch (1970) and the CANopen epoch (1984)
    pub const POSIX_OFFSET_SECS: u64 = (14 * 365 + 3) * 24 * 60 * 60;

    /// Create a time from a day count since 1984-01-01 and milliseconds after
    /// midnight
    pub const fn new(days: u16, ms: u32) -> Self {
        Self(TimeDifference::new(days, ms))
    }

    /// Create a time from a calendar date and time of day
    pub fn from_ymd_hms_ms(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
        milli: u32,
    ) -> Result<Self, TimeCreateError> {
        let date = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_milli_opt(hour, min, sec, milli))
            .ok_or(TimeCreateError::InvalidDate)?;
        let delta = date.date() - Self::CHRONO_EPOCH;
        let days = delta.num_days();
        let ms = (date.time() - chrono::NaiveTime::MIN).num_milliseconds();
        if days < 0 {
            PreEpochSnafu.fail()
        } else if days > u16::MAX as i64 {
            OutOfRangeSnafu.fail()
        } else {
            Ok(Self::new(days as u16, ms as u32))
        }
    }

    /// Create a time from seconds + nanoseconds since the POSIX epoch
    pub fn from_posix(secs: u64, nanos: u32) -> Result<Self, TimeCreateError> {
        let secs = secs
            .checked_sub(Self::POSIX_OFFSET_SECS)
            .ok_or(TimeCreateError::PreEpoch)?;
        let days = secs / (24 * 60 * 60);
        if days > u16::MAX as u64 {
            return OutOfRangeSnafu.fail();
        }
        let ms = (secs % (24 * 60 * 60)) * 1000 + nanos as u64 / 1_000_000;
        Ok(Self::new(days as u16, ms as u32))
    }

    /// Decode from the 6-byte wire layout
    pub fn from_le_bytes(bytes: [u8; 6]) -> Self {
        Self(TimeDifference::from_le_bytes(bytes))
    }

    /// Encode to the 6-byte wire layout
    pub fn to_le_bytes(&self) -> [u8; 6] {
        self.0.to_le_bytes()
    }

    /// Days since 1984-01-01
    pub fn days(&self) -> u16 {
        self.0.days()
    }

    /// Milliseconds since midnight
    pub fn millis(&self) -> u32 {
        self.0.millis()
    }

    /// The calendar date as (year, month, day)
    pub fn date_ymd(&self) -> (i32, u32, u32) {
        let date = Self::CHRONO_EPOCH + TimeDelta::days(self.days() as i64);
        (date.year(), date.month(), date.day())
    }
}

/// A span of time, stored as days plus milliseconds
///
/// Shares the 6-byte wire layout of [`TimeOfDay`]. Ordering is lexicographic
/// on (days, ms).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeDifference {
    days: u16,
    ms: u32,
}

impl TimeDifference {
    /// The wire size of a TIME_DIFFERENCE value
    pub const SIZE: usize = 6;

    /// A zero-length span
    pub const ZERO: TimeDifference = TimeDifference { days: 0, ms: 0 };

    /// The largest representable span
    pub const MAX: TimeDifference = TimeDifference {
        days: u16::MAX,
        ms: MS_MASK,
    };

    /// Create a span from a day count and milliseconds
    pub const fn new(days: u16, ms: u32) -> Self {
        Self {
            days,
            ms: ms & MS_MASK,
        }
    }

    /// Decode from the 6-byte wire layout, masking the reserved bits
    pub fn from_le_bytes(bytes: [u8; 6]) -> Self {
        let ms = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) & MS_MASK;
        let days = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        Self::new(days, ms)
    }

    /// Encode to the 6-byte wire layout
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut bytes = [0; 6];
        bytes[0..4].copy_from_slice(&(self.ms & MS_MASK).to_le_bytes());
        bytes[4..6].copy_from_slice(&self.days.to_le_bytes());
        bytes
    }

    /// The day component
    pub fn days(&self) -> u16 {
        self.days
    }

    /// The millisecond component
    pub fn millis(&self) -> u32 {
        self.ms
    }

    /// The whole span in milliseconds
    pub fn total_millis(&self) -> u64 {
        self.days as u64 * MILLIS_PER_DAY + self.ms as u64
    }

    /// Convert to a [`Duration`]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.total_millis())
    }
}

impl PartialOrd for TimeDifference {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeDifference {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.days, self.ms).cmp(&(other.days, other.ms))
    }
}
