//! Bidirectional timestamp transform between on-disk time and presented time.
//!
//! The shift is a fixed number of seconds: the distance between Jan 1 of the
//! configured epoch year and Jan 1 1970 in the proleptic Gregorian calendar.
//! It is a pure linear offset; leap seconds are ignored and both years are
//! assumed to follow the same calendar rules.

use rfuse3::Timestamp;

const SECONDS_PER_DAY: i64 = 24 * 3600;

/// Day count from the start of the proleptic Gregorian calendar to Jan 1 of
/// `year`, using the standard leap rule (divisible by 4 and not by 100,
/// unless divisible by 400). Matches the arithmetic of `timegm`-style
/// conversions for positive years.
fn days_to_year(year: i64) -> i64 {
    let leap_days = if year > 0 {
        (year + 3) / 4 - (year - 1) / 100 + (year - 1) / 400
    } else {
        0
    };
    year * 365 + leap_days
}

/// The epoch shift applied to every timestamp crossing the mount boundary.
///
/// `to_presented` is used when attributes are reported to the caller,
/// `to_physical` when caller-supplied timestamps are stored. The two are
/// exact inverses over the full `i64` domain (arithmetic wraps rather than
/// saturating, so the round-trip invariant holds even at the extremes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochShift {
    offset_secs: i64,
}

impl EpochShift {
    pub fn new(epoch_year: i32) -> Self {
        let offset_days = days_to_year(epoch_year as i64) - days_to_year(1970);
        Self {
            offset_secs: offset_days * SECONDS_PER_DAY,
        }
    }

    /// The shift in seconds added to on-disk time before it is reported.
    pub fn offset_secs(&self) -> i64 {
        self.offset_secs
    }

    /// On-disk time → time reported through the mount.
    pub fn to_presented(&self, physical_secs: i64) -> i64 {
        physical_secs.wrapping_add(self.offset_secs)
    }

    /// Caller-supplied time → time stored on disk.
    pub fn to_physical(&self, presented_secs: i64) -> i64 {
        presented_secs.wrapping_sub(self.offset_secs)
    }

    /// Shift the second component of a FUSE timestamp outward, keeping the
    /// nanosecond component untouched.
    pub fn present_timestamp(&self, sec: i64, nsec: u32) -> Timestamp {
        Timestamp::new(self.to_presented(sec), nsec)
    }

    /// Shift a caller-supplied FUSE timestamp back to on-disk time.
    pub fn store_timestamp(&self, ts: Timestamp) -> Timestamp {
        Timestamp::new(self.to_physical(ts.sec), ts.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Seconds between 1970-01-01 and 2000-01-01: 30 years, 7 leap days.
    const Y2000_OFFSET: i64 = 946_684_800;
    // Seconds between 1900-01-01 and 1970-01-01: 70 years, 17 leap days.
    const Y1900_OFFSET: i64 = -2_208_988_800;

    #[test]
    fn offset_for_2000_matches_known_constant() {
        let shift = EpochShift::new(2000);
        assert_eq!(shift.offset_secs(), Y2000_OFFSET);
        assert_eq!(shift.to_presented(0), Y2000_OFFSET);
    }

    #[test]
    fn offset_for_1900_is_negative() {
        let shift = EpochShift::new(1900);
        assert_eq!(shift.offset_secs(), Y1900_OFFSET);
    }

    #[test]
    fn epoch_1970_is_identity() {
        let shift = EpochShift::new(1970);
        assert_eq!(shift.offset_secs(), 0);
        for t in [i64::MIN, -1, 0, 1, 1_700_000_000, i64::MAX] {
            assert_eq!(shift.to_presented(t), t);
            assert_eq!(shift.to_physical(t), t);
        }
    }

    #[test]
    fn round_trip_holds_for_any_timestamp() {
        for year in [1, 1900, 1969, 1970, 2000, 2024, 9999] {
            let shift = EpochShift::new(year);
            for t in [
                i64::MIN,
                -2_208_988_800,
                -1,
                0,
                1,
                946_684_800,
                1_700_000_000,
                i64::MAX,
            ] {
                assert_eq!(shift.to_physical(shift.to_presented(t)), t);
                assert_eq!(shift.to_presented(shift.to_physical(t)), t);
            }
        }
    }

    #[test]
    fn timestamp_shift_keeps_nanoseconds() {
        let shift = EpochShift::new(2000);
        let presented = shift.present_timestamp(10, 999);
        assert_eq!(presented.sec, Y2000_OFFSET + 10);
        assert_eq!(presented.nsec, 999);

        let stored = shift.store_timestamp(presented);
        assert_eq!(stored.sec, 10);
        assert_eq!(stored.nsec, 999);
    }
}
