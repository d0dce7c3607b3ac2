use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt, time::Duration};

/// An exact time and date used to represent absolute timelocks.
///
/// Chains express lock times with a precision of seconds, hence so do we.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Timestamp(u32);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp::from(Utc::now())
    }

    pub fn plus(self, seconds: u32) -> Self {
        Self(self.0.saturating_add(seconds))
    }

    pub fn minus(self, seconds: u32) -> Self {
        Self(self.0.saturating_sub(seconds))
    }

    /// Time left from `self` until `later`, zero if `later` already passed.
    pub fn until(self, later: Timestamp) -> Duration {
        Duration::from_secs(u64::from(later.0.saturating_sub(self.0)))
    }

    pub fn has_passed(self, now: Timestamp) -> bool {
        self <= now
    }

    pub fn to_date_time(self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&NaiveDateTime::from(self))
    }
}

/// The u32 input is the number of seconds since epoch
impl From<u32> for Timestamp {
    fn from(item: u32) -> Self {
        Self(item)
    }
}

/// The u32 returned is the number of seconds since epoch
impl From<Timestamp> for u32 {
    fn from(item: Timestamp) -> Self {
        item.0
    }
}

/// The i64 returned is the number of seconds since epoch
impl From<Timestamp> for i64 {
    fn from(item: Timestamp) -> Self {
        i64::from(item.0)
    }
}

impl From<Timestamp> for NaiveDateTime {
    fn from(t: Timestamp) -> Self {
        NaiveDateTime::from_timestamp(i64::from(t), 0)
    }
}

/// Dates before the epoch or after 2106 saturate.
impl From<DateTime<Utc>> for Timestamp {
    fn from(date_time: DateTime<Utc>) -> Self {
        let seconds = date_time.timestamp().max(0);

        Timestamp(u32::try_from(seconds).unwrap_or(u32::MAX))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A duration used to represent a relative timelock
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RelativeTime(u32);

impl RelativeTime {
    pub const fn new(time_secs: u32) -> Self {
        RelativeTime(time_secs)
    }

    pub const fn from_hours(hours: u32) -> Self {
        RelativeTime(hours * 60 * 60)
    }

    pub fn as_secs(self) -> u32 {
        self.0
    }
}

/// The u32 returned is the duration in seconds
impl From<RelativeTime> for u32 {
    fn from(item: RelativeTime) -> Self {
        item.0
    }
}

/// The u32 input is the duration in seconds
impl From<u32> for RelativeTime {
    fn from(item: u32) -> Self {
        Self(item)
    }
}

impl fmt::Display for RelativeTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}
