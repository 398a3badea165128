use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Number of ticks in one second
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Number of ticks in one millisecond
pub const TICKS_PER_MILLISECOND: i64 = 10_000;

/// Tick count at the Unix epoch (1970-01-01 relative to the tick epoch
/// of 0001-01-01 00:00:00 UTC)
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Protocol timestamp: 100 ns intervals since 0001-01-01 00:00:00 UTC.
///
/// The epoch is a compile-time constant of the wire format, shared by base
/// time offsets and full-fidelity timestamps alike.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ticks(pub i64);

impl Ticks {
    /// Creates a tick count from whole seconds since the Unix epoch
    pub fn from_unix_seconds(seconds: i64) -> Self {
        Ticks(UNIX_EPOCH_TICKS + seconds * TICKS_PER_SECOND)
    }

    /// Returns whole milliseconds since the Unix epoch
    pub fn to_unix_milliseconds(self) -> i64 {
        (self.0 - UNIX_EPOCH_TICKS) / TICKS_PER_MILLISECOND
    }

    /// Converts to a calendar timestamp, if representable
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let unix_ticks = self.0.checked_sub(UNIX_EPOCH_TICKS)?;
        let seconds = unix_ticks.div_euclid(TICKS_PER_SECOND);
        let nanos = (unix_ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
        Utc.timestamp_opt(seconds, nanos).single()
    }

    /// Returns the raw tick count
    pub fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for Ticks {
    fn from(value: i64) -> Self {
        Ticks(value)
    }
}
