//! Jitter added on top of backoff delays so that clients which failed together do not retry
//! together.
//!
//! - `None`: no randomisation. Only useful for deterministic tests.
//! - `Additive`: a uniformly random extra in `[0, ceiling)`, added to the backoff delay. The
//!   default ceiling is one second.
//!
//! RNG: `rand`'s thread-local generator by default; seeded generators can be injected through
//! [`Jitter::sample_with_rng`].

use rand::{rng, Rng};
use std::time::Duration;

/// Default upper bound (exclusive) of the additive jitter.
pub const DEFAULT_JITTER_CEILING: Duration = Duration::from_millis(1_000);

/// Randomisation applied to retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter.
    None,
    /// Uniform extra delay in `[0, ceiling)`.
    Additive { ceiling: Duration },
}

impl Jitter {
    /// Additive jitter with the default one second ceiling.
    pub fn additive() -> Self {
        Jitter::Additive { ceiling: DEFAULT_JITTER_CEILING }
    }

    /// Additive jitter with a custom ceiling.
    pub fn up_to(ceiling: Duration) -> Self {
        Jitter::Additive { ceiling }
    }

    /// Draw an extra delay from the thread-local RNG.
    pub fn sample(&self) -> Duration {
        let mut rng = rng();
        self.sample_with_rng(&mut rng)
    }

    /// Draw an extra delay from the given RNG.
    pub fn sample_with_rng<R: Rng>(&self, rng: &mut R) -> Duration {
        match self {
            Jitter::None => Duration::ZERO,
            Jitter::Additive { ceiling } => {
                let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
                if ceiling_ms == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..ceiling_ms))
            }
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::additive()
    }
}
