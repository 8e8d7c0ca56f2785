//! Reconnect delay calculation
//!
//! `delay(n, base) = base * 2^(n-1) + uniform(0, base * 2^(n-1) / 2)`.
//! The exponential term keeps a failing client from spinning, the jitter
//! spreads a fleet that lost the same server across the retry window.
//! There is no cap: the caller bounds total retry time with max attempts.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Unjittered delay for `attempt` (attempts start at 1; 0 is treated as 1).
///
/// Saturates at `u64::MAX` nanoseconds instead of overflowing.
pub fn base_delay(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.max(1) - 1;
    let factor = if exponent >= 128 {
        u128::MAX
    } else {
        1u128 << exponent
    };
    let nanos = base.as_nanos().saturating_mul(factor);
    clamp_nanos(nanos)
}

/// Jittered delay drawn from `[lower, lower + lower / 2]` with `lower = base_delay(attempt, base)`
pub fn delay<R: Rng + ?Sized>(attempt: u32, base: Duration, rng: &mut R) -> Duration {
    let lower = base_delay(attempt, base).as_nanos();
    let jitter = if lower < 2 {
        0
    } else {
        rng.gen_range(0..=lower / 2)
    };
    clamp_nanos(lower.saturating_add(jitter))
}

fn clamp_nanos(nanos: u128) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Backoff policy bound to a base interval and its own random source
#[derive(Debug)]
pub struct BackoffPolicy {
    base: Duration,
    rng: Mutex<StdRng>,
}

impl BackoffPolicy {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic policy for tests
    pub fn with_seed(base: Duration, seed: u64) -> Self {
        Self {
            base,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        delay(attempt, self.base, &mut *rng)
    }

    /// Sum of the smallest possible delays for attempts `1..=attempts`
    pub fn minimum_total(&self, attempts: u32) -> Duration {
        (1..=attempts).fold(Duration::ZERO, |total, attempt| {
            total.saturating_add(base_delay(attempt, self.base))
        })
    }
}
