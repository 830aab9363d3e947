//! Wall-clock readings and their 8-byte wire form
//!
//! On the wire a timestamp is `{seconds: u32, fraction: u32}` big-endian,
//! counted from 1900-01-01 UTC with the fraction in units of 2^-32 s
//! (about 0.233 ns). Locally a [`Timestamp`] is a signed nanosecond count
//! from the Unix epoch. The 1900→1970 delta is applied exactly once in each
//! direction.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds from 1900-01-01 UTC to the Unix epoch
pub const EPOCH_DELTA: i64 = 2_208_988_800;

/// Seconds in one wire era (the 32-bit seconds field wraps in 2036)
pub const ERA_SECONDS: i64 = 1 << 32;

/// Encoded size
pub const WIRE_LEN: usize = 8;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A local wall-clock instant with nanosecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch
    pub const UNIX_EPOCH: Timestamp = Timestamp(0);

    /// Creates a timestamp from nanoseconds since the Unix epoch
    pub const fn from_nanos(nanos: i64) -> Self {
        Timestamp(nanos)
    }

    /// Nanoseconds since the Unix epoch
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Reads the system wall clock
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp(d.as_nanos() as i64),
            Err(e) => Timestamp(-(e.duration().as_nanos() as i64)),
        }
    }

    /// Whole seconds since the Unix epoch, rounded toward negative infinity
    pub fn secs(&self) -> i64 {
        self.0.div_euclid(NANOS_PER_SEC)
    }

    /// Nanoseconds past [`Timestamp::secs`], always in `0..1_000_000_000`
    pub fn subsec_nanos(&self) -> u32 {
        self.0.rem_euclid(NANOS_PER_SEC) as u32
    }

    /// Signed nanoseconds from `earlier` to `self`
    pub fn nanos_since(&self, earlier: Timestamp) -> i64 {
        self.0 - earlier.0
    }

    /// This instant shifted by a signed number of milliseconds
    pub fn offset_by_ms(&self, offset_ms: f64) -> Self {
        Timestamp(self.0.saturating_add((offset_ms * 1_000_000.0).round() as i64))
    }

    /// Converts to the wire representation
    pub fn to_wire(&self) -> WireTimestamp {
        let seconds = (self.secs() + EPOCH_DELTA).rem_euclid(ERA_SECONDS) as u32;
        let fraction = (((self.subsec_nanos() as u64) << 32) / NANOS_PER_SEC as u64) as u32;
        WireTimestamp { seconds, fraction }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::<chrono::Utc>::from_timestamp(self.secs(), self.subsec_nanos()) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.9f UTC")),
            None => write!(f, "{}ns", self.0),
        }
    }
}

/// The 8-byte fixed-point wire timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireTimestamp {
    /// Seconds since 1900-01-01 UTC, modulo one era
    pub seconds: u32,
    /// Fractional second in units of 2^-32 s
    pub fraction: u32,
}

impl WireTimestamp {
    pub fn from_bytes(bytes: [u8; WIRE_LEN]) -> Self {
        WireTimestamp {
            seconds: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            fraction: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; WIRE_LEN] {
        let mut out = [0u8; WIRE_LEN];
        out[..4].copy_from_slice(&self.seconds.to_be_bytes());
        out[4..].copy_from_slice(&self.fraction.to_be_bytes());
        out
    }

    /// Converts to a local timestamp, choosing the era closest to `pivot`.
    ///
    /// Assumes the timestamp lies within half an era (~68 years) of the pivot.
    pub fn to_timestamp_near(&self, pivot: Timestamp) -> Timestamp {
        let pivot_wire = pivot.secs() + EPOCH_DELTA;
        let mut wire_secs = pivot_wire.div_euclid(ERA_SECONDS) * ERA_SECONDS + self.seconds as i64;
        let diff = wire_secs - pivot_wire;
        if diff > ERA_SECONDS / 2 {
            wire_secs -= ERA_SECONDS;
        } else if diff < -(ERA_SECONDS / 2) {
            wire_secs += ERA_SECONDS;
        }

        // Round to the nearest nanosecond so encode/decode is an exact inverse
        let nanos = ((self.fraction as u64 * NANOS_PER_SEC as u64) + (1 << 31)) >> 32;
        Timestamp((wire_secs - EPOCH_DELTA) * NANOS_PER_SEC + nanos as i64)
    }
}

/// Reads the local clock
pub fn now() -> Timestamp {
    Timestamp::now()
}

/// Encodes a timestamp into its 8-byte wire form
pub fn encode(timestamp: Timestamp) -> [u8; WIRE_LEN] {
    timestamp.to_wire().to_bytes()
}

/// Decodes a wire timestamp relative to the current local clock
pub fn decode(bytes: [u8; WIRE_LEN]) -> Timestamp {
    decode_near(bytes, Timestamp::now())
}

/// Decodes a wire timestamp, resolving the era against `pivot`
pub fn decode_near(bytes: [u8; WIRE_LEN], pivot: Timestamp) -> Timestamp {
    WireTimestamp::from_bytes(bytes).to_timestamp_near(pivot)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2026-10-19T00:00:00Z
    const PIVOT: Timestamp = Timestamp::from_nanos(1_792_368_000 * NANOS_PER_SEC);

    #[test]
    fn test_epoch_delta_applied_once() {
        let wire = Timestamp::UNIX_EPOCH.to_wire();
        assert_eq!(wire.seconds as i64, EPOCH_DELTA);
        assert_eq!(wire.fraction, 0);
        assert_eq!(wire.to_timestamp_near(PIVOT), Timestamp::UNIX_EPOCH);
    }

    #[test]
    fn test_known_encoding() {
        // Half a second lands exactly on 2^31
        let ts = Timestamp::from_nanos(1_500_000_000);
        let bytes = encode(ts);
        assert_eq!(&bytes[..4], &((EPOCH_DELTA + 1) as u32).to_be_bytes());
        assert_eq!(&bytes[4..], &0x8000_0000u32.to_be_bytes());
    }

    #[test]
    fn test_round_trip_is_exact_to_the_nanosecond() {
        let base = PIVOT.as_nanos();
        let offsets = [
            0i64,
            1,
            2,
            3,
            233,
            999_999_999,
            1_000_000_001,
            123_456_789_012,
            -987_654_321,
            -3_600_000_000_123,
        ];
        for delta in offsets {
            let ts = Timestamp::from_nanos(base + delta);
            assert_eq!(decode_near(encode(ts), PIVOT), ts, "delta {delta}");
        }
        for sub in (0..1_000_000_000).step_by(999_983) {
            let ts = Timestamp::from_nanos(base + sub);
            assert_eq!(decode_near(encode(ts), PIVOT), ts);
        }
    }

    #[test]
    fn test_max_fraction_carries_into_next_second() {
        let wire = WireTimestamp {
            seconds: (EPOCH_DELTA + 10) as u32,
            fraction: u32::MAX,
        };
        let ts = wire.to_timestamp_near(PIVOT);
        assert_eq!(ts.as_nanos(), 11 * NANOS_PER_SEC);
    }

    #[test]
    fn test_era_rollover() {
        // 2036-02-07T06:28:16Z is the first second of era 1
        let rollover = Timestamp::from_nanos((ERA_SECONDS - EPOCH_DELTA) * NANOS_PER_SEC);
        let after = Timestamp::from_nanos(rollover.as_nanos() + 5 * NANOS_PER_SEC);
        let wire = after.to_wire();
        assert_eq!(wire.seconds, 5);
        assert_eq!(wire.to_timestamp_near(PIVOT), after);
        assert_eq!(wire.to_timestamp_near(rollover), after);

        let before = Timestamp::from_nanos(rollover.as_nanos() - NANOS_PER_SEC);
        assert_eq!(before.to_wire().seconds, u32::MAX);
        assert_eq!(before.to_wire().to_timestamp_near(after), before);
    }

    #[test]
    fn test_now_round_trips_through_decode() {
        let ts = now();
        assert_eq!(decode(encode(ts)), ts);
    }

    #[test]
    fn test_system_time_conversion() {
        let ts = Timestamp::from_nanos(-1_500_000_000);
        assert_eq!(ts.secs(), -2);
        assert_eq!(ts.subsec_nanos(), 500_000_000);
        let before_epoch = UNIX_EPOCH - std::time::Duration::from_millis(1500);
        assert_eq!(Timestamp::from_system_time(before_epoch), ts);
    }

    #[test]
    fn test_offset_and_display() {
        let ts = Timestamp::from_nanos(0).offset_by_ms(-0.15);
        assert_eq!(ts.as_nanos(), -150_000);
        assert_eq!(ts.nanos_since(Timestamp::UNIX_EPOCH), -150_000);
        assert_eq!(
            Timestamp::from_nanos(1_500_000_000).to_string(),
            "1970-01-01 00:00:01.500000000 UTC"
        );
    }
}
