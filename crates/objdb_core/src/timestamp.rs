//! Timestamp-based transaction identifiers.
//!
//! A TID packs a UTC timestamp into 64 bits:
//!
//! - the high 32 bits count minutes since 1900-01-01 using a 31-day month and
//!   12-month year: `((((y - 1900) * 12 + m - 1) * 31 + d - 1) * 24 + h) * 60 + min`
//! - the low 32 bits are the fraction of the minute, `seconds * 2^32 / 60`
//!
//! Ordering of TIDs therefore matches ordering of commit times. Two commits in
//! the same clock tick are separated by [`Tid::later_than`], which bumps the
//! low word.

use crate::types::Tid;
use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SECS_PER_DAY: u64 = 86_400;
const NANOS_PER_MINUTE: u128 = 60_000_000_000;

/// A broken-down UTC time decoded from a TID.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeStamp {
    /// Year, 1900 or later.
    pub year: u32,
    /// Month, 1-12.
    pub month: u32,
    /// Day of month, 1-31.
    pub day: u32,
    /// Hour, 0-23.
    pub hour: u32,
    /// Minute, 0-59.
    pub minute: u32,
    /// Seconds within the minute, with sub-second precision.
    pub seconds: f64,
}

impl TimeStamp {
    /// Decodes the timestamp carried by a TID.
    #[must_use]
    pub fn from_tid(tid: Tid) -> Self {
        let raw = tid.as_u64();
        let mut a = raw >> 32;
        let b = raw & 0xffff_ffff;
        let minute = (a % 60) as u32;
        a /= 60;
        let hour = (a % 24) as u32;
        a /= 24;
        let day = (a % 31) as u32 + 1;
        a /= 31;
        let month = (a % 12) as u32 + 1;
        let year = (a / 12) as u32 + 1900;
        let seconds = b as f64 * 60.0 / 4_294_967_296.0;
        Self {
            year,
            month,
            day,
            hour,
            minute,
            seconds,
        }
    }

    /// Seconds since the Unix epoch, or zero for times before it.
    #[must_use]
    pub fn unix_seconds(&self) -> f64 {
        let days = days_from_civil(i64::from(self.year), self.month, self.day);
        if days < 0 {
            return 0.0;
        }
        let whole = days as u64 * SECS_PER_DAY
            + u64::from(self.hour) * 3600
            + u64::from(self.minute) * 60;
        whole as f64 + self.seconds
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:09.6}",
            self.year, self.month, self.day, self.hour, self.minute, self.seconds
        )
    }
}

/// Builds the TID for a wall-clock instant.
#[must_use]
pub fn tid_from_system_time(time: SystemTime) -> Tid {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_epoch.as_secs();
    let (year, month, day) = civil_from_days((secs / SECS_PER_DAY) as i64);
    let rem = secs % SECS_PER_DAY;
    let hour = rem / 3600;
    let minute = rem % 3600 / 60;
    let second = rem % 60;

    let a = ((((year as u64 - 1900) * 12 + u64::from(month) - 1) * 31 + u64::from(day) - 1) * 24
        + hour)
        * 60
        + minute;
    let nanos = u128::from(second) * 1_000_000_000 + u128::from(since_epoch.subsec_nanos());
    let b = ((nanos << 32) / NANOS_PER_MINUTE) as u64;
    Tid::from_u64((a << 32) | (b & 0xffff_ffff))
}

/// Builds the TID for the current time minus `age`.
#[must_use]
pub fn tid_before_now(age: Duration) -> Tid {
    let now = SystemTime::now();
    tid_from_system_time(now.checked_sub(age).unwrap_or(UNIX_EPOCH))
}

/// Hands out strictly increasing TIDs based on the system clock.
#[derive(Debug, Default)]
pub struct TidAllocator {
    last: Mutex<Tid>,
}

impl TidAllocator {
    /// Creates an allocator that will only issue TIDs above `last`.
    #[must_use]
    pub fn new(last: Tid) -> Self {
        Self {
            last: Mutex::new(last),
        }
    }

    /// Returns a TID later than every TID issued or observed so far.
    pub fn new_tid(&self) -> Tid {
        let now = tid_from_system_time(SystemTime::now());
        let mut last = self.last.lock();
        let tid = now.later_than(*last);
        *last = tid;
        tid
    }

    /// Records a TID minted elsewhere so later TIDs sort after it.
    pub fn observe(&self, tid: Tid) {
        let mut last = self.last.lock();
        if tid > *last {
            *last = tid;
        }
    }

    /// Returns the latest TID issued or observed.
    pub fn last(&self) -> Tid {
        *self.last.lock()
    }
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = (if year >= 0 { year } else { year - 399 }) / 400;
    let yoe = year - era * 400;
    let m = i64::from(month);
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
