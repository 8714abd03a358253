//! NTP-style time tags
//!
//! A [`TimeTag`] is a 64-bit fixed point number: the upper 32 bits count
//! seconds since January 1, 1900, the lower 32 bits are the fraction of a
//! second. The same representation is used for block timestamps and for the
//! delivery time of scheduled session messages.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds between the NTP epoch (1900) and the UNIX epoch (1970)
const NTP_TO_UNIX_OFFSET: u64 = 2_208_988_800;

const FRACTION_SCALE: f64 = 4_294_967_296.0; // 2^32

/// 64-bit fixed point timestamp (seconds since 1900)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TimeTag(u64);

impl TimeTag {
    /// "Apply now" sentinel, identical to the OSC immediate time tag
    pub const IMMEDIATE: TimeTag = TimeTag(1);

    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Current wall clock time
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self::from_unix_duration(since_epoch)
    }

    pub fn from_unix_duration(duration: Duration) -> Self {
        let seconds = duration.as_secs() + NTP_TO_UNIX_OFFSET;
        let fraction = (duration.subsec_nanos() as u64 * (1u64 << 32)) / 1_000_000_000;
        Self((seconds << 32) | fraction)
    }

    pub fn to_unix_duration(self) -> Duration {
        let seconds = (self.0 >> 32).saturating_sub(NTP_TO_UNIX_OFFSET);
        let nanos = ((self.0 & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
        Duration::new(seconds, nanos as u32)
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        let d = self.to_unix_duration();
        DateTime::<Utc>::from_timestamp(d.as_secs() as i64, d.subsec_nanos()).unwrap_or_default()
    }

    /// Build a time tag from seconds since the NTP epoch
    pub fn from_seconds(seconds: f64) -> Self {
        if seconds <= 0.0 {
            return Self(0);
        }
        let whole = seconds.trunc();
        let fraction = ((seconds - whole) * FRACTION_SCALE) as u64;
        Self(((whole as u64) << 32) | (fraction & 0xFFFF_FFFF))
    }

    pub fn to_seconds(self) -> f64 {
        (self.0 >> 32) as f64 + (self.0 & 0xFFFF_FFFF) as f64 / FRACTION_SCALE
    }

    pub fn is_immediate(self) -> bool {
        self.0 <= Self::IMMEDIATE.0
    }

    /// Signed duration `to - from` in seconds
    pub fn duration(from: TimeTag, to: TimeTag) -> f64 {
        if to.0 >= from.0 {
            (to.0 - from.0) as f64 / FRACTION_SCALE
        } else {
            -((from.0 - to.0) as f64 / FRACTION_SCALE)
        }
    }

    /// Shift by a (possibly negative) number of seconds
    pub fn add_seconds(self, seconds: f64) -> Self {
        let delta = (seconds.abs() * FRACTION_SCALE) as u64;
        if seconds >= 0.0 {
            Self(self.0.saturating_add(delta))
        } else {
            Self(self.0.saturating_sub(delta))
        }
    }
}

impl fmt::Debug for TimeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_immediate() {
            write!(f, "TimeTag(immediate)")
        } else {
            write!(f, "TimeTag({:.6})", self.to_seconds())
        }
    }
}

impl fmt::Display for TimeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_immediate() {
            f.write_str("immediate")
        } else {
            write!(f, "{}", self.to_datetime().format("%H:%M:%S%.6f"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_after_2020() {
        // Jan 1, 2020 in NTP seconds
        assert!(TimeTag::now().raw() >> 32 > 3_786_825_600);
    }

    #[test]
    fn test_seconds_conversion() {
        let t = TimeTag::from_seconds(3_786_825_600.5);
        assert_eq!(t.raw() >> 32, 3_786_825_600);
        assert_eq!(t.raw() & 0xFFFF_FFFF, 0x8000_0000);
        assert!((t.to_seconds() - 3_786_825_600.5).abs() < 1e-6);
    }

    #[test]
    fn test_duration_is_signed() {
        let a = TimeTag::from_seconds(100.0);
        let b = a.add_seconds(0.25);
        assert!((TimeTag::duration(a, b) - 0.25).abs() < 1e-9);
        assert!((TimeTag::duration(b, a) + 0.25).abs() < 1e-9);
        assert_eq!(b.add_seconds(-0.25), a);
    }

    #[test]
    fn test_immediate() {
        assert!(TimeTag::IMMEDIATE.is_immediate());
        assert!(!TimeTag::now().is_immediate());
        assert_eq!(TimeTag::IMMEDIATE.to_string(), "immediate");
    }

    #[test]
    fn test_unix_roundtrip() {
        let d = Duration::new(1_700_000_000, 250_000_000);
        let back = TimeTag::from_unix_duration(d).to_unix_duration();
        assert_eq!(back.as_secs(), d.as_secs());
        assert!((back.subsec_nanos() as i64 - 250_000_000).abs() <= 1);
    }
}
