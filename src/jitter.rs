//! Random jitter added to retry delays
//!
//! Jitter is symmetric: with a bound of `j` each delay is shifted by a value drawn uniformly
//! from `[-j, +j]`, and the result never drops below zero. A zero bound means no randomness,
//! which keeps tests and tightly controlled workflows deterministic.
//!
//! Notes:
//! - RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//!   `apply_with_rng`.
//! - Precision: millisecond arithmetic saturates instead of overflowing.
//!
//! Example:
//! ```rust
//! use faultline::Jitter;
//! use std::time::Duration;
//!
//! let jitter = Jitter::random(Duration::from_millis(200));
//! let delay = jitter.apply(Duration::from_millis(1000));
//! assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Uniform offset in `[-max, +max]`
    Random {
        /// Largest offset in either direction
        max: Duration,
    },
}

impl Jitter {
    /// Symmetric random jitter; a zero bound yields [`Jitter::None`].
    pub fn random(max: Duration) -> Self {
        if max.is_zero() {
            Jitter::None
        } else {
            Jitter::Random { max }
        }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Random { max } => {
                let base = as_millis_saturated(delay);
                let bound = as_millis_saturated(*max);
                let offset = rng.random_range(0..=bound.saturating_mul(2));
                // base + (offset - bound), clamped at zero
                let shifted = base.saturating_add(offset).saturating_sub(bound);
                Duration::from_millis(shifted)
            }
        }
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
