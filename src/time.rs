//! Declared durations as (magnitude, unit) pairs.
//!
//! Every duration in a policy descriptor is declared with an explicit unit and converted to a
//! whole number of milliseconds before any timer is built. Conversion is exact integer
//! arithmetic: sub-millisecond units truncate toward zero, overflow is a [`ConfigError`].

use crate::error::ConfigError;
use std::fmt;
use std::time::Duration;

/// Unit of a declared duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    /// Nanoseconds.
    Nanos,
    /// Microseconds.
    Micros,
    /// Milliseconds.
    Millis,
    /// Seconds.
    Seconds,
    /// Minutes.
    Minutes,
    /// Hours.
    Hours,
    /// Twelve hours.
    HalfDays,
    /// Twenty-four hours.
    Days,
}

impl TimeUnit {
    fn name(self) -> &'static str {
        match self {
            TimeUnit::Nanos => "nanos",
            TimeUnit::Micros => "micros",
            TimeUnit::Millis => "millis",
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::HalfDays => "half-days",
            TimeUnit::Days => "days",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A declared duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DurationSpec {
    /// Magnitude.
    pub amount: u64,
    /// Unit of `amount`.
    pub unit: TimeUnit,
}

impl DurationSpec {
    /// Declare a duration.
    pub const fn new(amount: u64, unit: TimeUnit) -> Self {
        Self { amount, unit }
    }

    /// Shorthand for a millisecond duration.
    pub const fn millis(amount: u64) -> Self {
        Self::new(amount, TimeUnit::Millis)
    }

    /// Shorthand for a second duration.
    pub const fn seconds(amount: u64) -> Self {
        Self::new(amount, TimeUnit::Seconds)
    }

    /// Zero milliseconds.
    pub const ZERO: DurationSpec = DurationSpec::millis(0);

    /// Absolute milliseconds.
    pub fn to_millis(&self) -> Result<u64, ConfigError> {
        let overflow =
            || ConfigError::DurationOverflow { amount: self.amount, unit: self.unit.name() };
        match self.unit {
            TimeUnit::Nanos => Ok(self.amount / 1_000_000),
            TimeUnit::Micros => Ok(self.amount / 1_000),
            TimeUnit::Millis => Ok(self.amount),
            TimeUnit::Seconds => self.amount.checked_mul(1_000).ok_or_else(overflow),
            TimeUnit::Minutes => self.amount.checked_mul(60_000).ok_or_else(overflow),
            TimeUnit::Hours => self.amount.checked_mul(3_600_000).ok_or_else(overflow),
            TimeUnit::HalfDays => self.amount.checked_mul(43_200_000).ok_or_else(overflow),
            TimeUnit::Days => self.amount.checked_mul(86_400_000).ok_or_else(overflow),
        }
    }

    /// Millisecond-precision [`Duration`].
    pub fn to_duration(&self) -> Result<Duration, ConfigError> {
        self.to_millis().map(Duration::from_millis)
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_each_unit() {
        assert_eq!(DurationSpec::new(1_500_000, TimeUnit::Nanos).to_millis(), Ok(1));
        assert_eq!(DurationSpec::new(2_999, TimeUnit::Micros).to_millis(), Ok(2));
        assert_eq!(DurationSpec::millis(7).to_millis(), Ok(7));
        assert_eq!(DurationSpec::seconds(2).to_millis(), Ok(2_000));
        assert_eq!(DurationSpec::new(3, TimeUnit::Minutes).to_millis(), Ok(180_000));
        assert_eq!(DurationSpec::new(1, TimeUnit::Hours).to_millis(), Ok(3_600_000));
        assert_eq!(DurationSpec::new(1, TimeUnit::HalfDays).to_millis(), Ok(43_200_000));
        assert_eq!(DurationSpec::new(2, TimeUnit::Days).to_millis(), Ok(172_800_000));
    }

    #[test]
    fn overflow_is_a_config_error() {
        let err = DurationSpec::new(u64::MAX, TimeUnit::Seconds).to_millis().unwrap_err();
        assert!(matches!(err, ConfigError::DurationOverflow { unit: "seconds", .. }));
    }

    #[test]
    fn large_values_stay_exact() {
        // 2^53 + 1 is not representable as f64; integer conversion must keep it.
        let amount = (1u64 << 53) + 1;
        assert_eq!(DurationSpec::millis(amount).to_millis(), Ok(amount));
        assert_eq!(DurationSpec::new(amount * 1_000, TimeUnit::Micros).to_millis(), Ok(amount));
    }
}
