//! Backoff schedule for the retry engine.
//!
//! Attempt semantics: attempt `0` is the initial call (no delay); retries start at `attempt = 1`.
//! The exponential schedule is `base * 2^(attempt - 1)`; the constant schedule is `base`.
//! Jitter is added before the cap, so a jittered delay never exceeds `max`:
//!
//! ```rust
//! use std::time::Duration;
//! use vetcare_net::{Backoff, Jitter};
//!
//! let backoff = Backoff::exponential(Duration::from_millis(1_000))
//!     .with_max(Duration::from_millis(30_000))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(5), Duration::from_millis(16_000));
//! assert_eq!(backoff.delay(9), Duration::from_millis(30_000)); // capped
//! let jittered = backoff.jittered(5, &Jitter::additive());
//! assert!(jittered >= Duration::from_millis(16_000) && jittered < Duration::from_millis(17_000));
//! ```
//!
//! Computations that would overflow saturate to [`MAX_BACKOFF`].

use crate::Jitter;
use rand::Rng;
use std::time::Duration;

/// Ceiling used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    Constant,
    Exponential,
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    growth: Growth,
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(base: Duration) -> Self {
        Self { growth: Growth::Constant, base, max: None }
    }

    /// Doubling delay: `base`, `2 * base`, `4 * base`, ...
    pub fn exponential(base: Duration) -> Self {
        Self { growth: Growth::Exponential, base, max: None }
    }

    /// Cap every delay (jitter included) at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    pub fn is_exponential(&self) -> bool {
        self.growth == Growth::Exponential
    }

    /// Un-jittered delay before `attempt`, capped at `max`.
    pub fn delay(&self, attempt: usize) -> Duration {
        self.cap(self.raw(attempt))
    }

    /// Delay before `attempt` with jitter drawn from the thread-local RNG.
    pub fn jittered(&self, attempt: usize, jitter: &Jitter) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.cap(self.raw(attempt).saturating_add(jitter.sample()))
    }

    /// Delay before `attempt` with jitter drawn from `rng`.
    pub fn jittered_with_rng<R: Rng>(&self, attempt: usize, jitter: &Jitter, rng: &mut R) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.cap(self.raw(attempt).saturating_add(jitter.sample_with_rng(rng)))
    }

    fn raw(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.growth {
            Growth::Constant => self.base,
            Growth::Exponential => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = 2u128.saturating_pow(exponent);
                let nanos = self.base.as_nanos().saturating_mul(multiplier);
                Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
            }
        }
    }

    fn cap(&self, delay: Duration) -> Duration {
        let capped = self.max.map(|m| delay.min(m)).unwrap_or(delay);
        capped.min(MAX_BACKOFF)
    }
}
