//! Delay computation between retry attempts.
//!
//! Attempt semantics: attempt `0` is the initial call (no delay); retries start at `attempt = 1`.
//! The constant strategy is the default; the exponential strategy multiplies the base delay by
//! `factor` per retry and never exceeds `max_delay`. Jitter is applied on top by the retry layer.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use faultline::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100), 2, Duration::from_secs(1));
//! assert_eq!(backoff.delay(0), Duration::ZERO); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(400));
//! assert_eq!(backoff.delay(9), Duration::from_secs(1)); // capped
//! ```

use crate::error::ConfigError;
use std::time::Duration;

/// Backoff strategy between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Constant {
        /// Delay before each retry.
        delay: Duration,
    },
    /// `base * factor^(attempt - 1)`, capped at `max_delay`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Growth factor per retry.
        factor: u32,
        /// Upper bound on any single delay.
        max_delay: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::constant(Duration::ZERO)
    }
}

impl Backoff {
    /// Create a constant backoff strategy
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Create an exponential backoff strategy
    pub fn exponential(base: Duration, factor: u32, max_delay: Duration) -> Self {
        Backoff::Exponential { base, factor, max_delay }
    }

    /// Delay before the first retry.
    pub fn base(&self) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, .. } => *base,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if let Backoff::Exponential { base, factor, max_delay } = self {
            if *factor < 1 {
                return Err(ConfigError::invalid("retry", "factor", "must be >= 1"));
            }
            if max_delay < base {
                return Err(ConfigError::invalid(
                    "retry",
                    "max_delay",
                    format!("{max_delay:?} is shorter than the base delay {base:?}"),
                ));
            }
        }
        Ok(())
    }

    /// Calculate the delay for a given attempt number (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, factor, max_delay } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = u128::from(*factor).saturating_pow(exponent);
                let nanos = base.as_nanos().saturating_mul(multiplier).min(max_delay.as_nanos());
                Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_backoff_returns_same_delay() {
        let backoff = Backoff::constant(Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_grows_by_factor() {
        let backoff = Backoff::exponential(Duration::from_millis(100), 3, Duration::from_secs(60));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(300));
        assert_eq!(backoff.delay(3), Duration::from_millis(900));
    }

    #[test]
    fn exponential_backoff_saturates_at_max() {
        let backoff = Backoff::exponential(Duration::from_secs(1), 2, Duration::from_secs(30));
        assert_eq!(backoff.delay(1_000_000_000), Duration::from_secs(30));
        assert_eq!(backoff.delay(usize::MAX), Duration::from_secs(30));
    }

    #[test]
    fn validation_rejects_bad_exponential() {
        let zero_factor = Backoff::exponential(Duration::from_millis(10), 0, Duration::from_secs(1));
        assert!(zero_factor.validate().is_err());
        let inverted = Backoff::exponential(Duration::from_secs(2), 2, Duration::from_secs(1));
        assert!(inverted.validate().is_err());
        assert!(Backoff::constant(Duration::ZERO).validate().is_ok());
    }
}
