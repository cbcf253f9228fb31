//! Timestamp conversion.
//!
//! On disk every timestamp is an `i64` counting 100-nanosecond units since
//! 0001-01-01T00:00:00Z (proleptic Gregorian).  All readers and writers of a
//! file must agree on this epoch; it is part of the format.

use chrono::{DateTime, Utc};

/// 100-ns units per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Ticks at 1970-01-01T00:00:00Z.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Convert a UTC instant to ticks.  Sub-100ns precision is truncated.
pub fn from_datetime(dt: DateTime<Utc>) -> i64 {
    UNIX_EPOCH_TICKS
        + dt.timestamp() * TICKS_PER_SECOND
        + i64::from(dt.timestamp_subsec_nanos() / 100)
}

/// Convert ticks back to a UTC instant.  `None` if the value falls outside
/// the representable range.
pub fn to_datetime(ticks: i64) -> Option<DateTime<Utc>> {
    let rel = ticks - UNIX_EPOCH_TICKS;
    let secs = rel.div_euclid(TICKS_PER_SECOND);
    let nanos = (rel.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Current time in ticks.
pub fn now() -> i64 {
    from_datetime(Utc::now())
}
