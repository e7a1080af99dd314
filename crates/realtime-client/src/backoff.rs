//! Reconnect backoff policy
//!
//! `delay = min(base * 2^attempt, cap)` plus a uniform jitter in
//! `[0, jitter_ratio * delay]`. The random source is injectable so tests can
//! seed it.

use std::time::Duration;

use rand::Rng;

use realtime_common::ReconnectConfig;

/// Default ceiling for the exponential component
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default jitter fraction
pub const DEFAULT_JITTER_RATIO: f64 = 0.25;

/// Exponential backoff with a cap and proportional jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    max_delay: Duration,
    jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_delay: DEFAULT_MAX_DELAY,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy. `jitter_ratio` is clamped to `[0, 1]`.
    pub fn new(max_delay: Duration, jitter_ratio: f64) -> Self {
        let jitter_ratio = if jitter_ratio.is_nan() {
            0.0
        } else {
            jitter_ratio.clamp(0.0, 1.0)
        };
        Self {
            max_delay,
            jitter_ratio,
        }
    }

    /// Policy without jitter
    pub fn without_jitter(max_delay: Duration) -> Self {
        Self::new(max_delay, 0.0)
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.max_delay(), config.jitter_ratio)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    /// Largest value `compute_delay_with` can return
    pub fn upper_bound(&self) -> Duration {
        self.max_delay.mul_f64(1.0 + self.jitter_ratio)
    }

    /// The capped exponential component, without jitter
    pub fn exponential(&self, attempt: u32, base: Duration) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(0);
        if factor == 0 {
            return self.max_delay;
        }
        base.checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay before the next attempt, using the thread-local RNG for jitter
    pub fn compute_delay(&self, attempt: u32, base: Duration) -> Duration {
        self.compute_delay_with(attempt, base, &mut rand::thread_rng())
    }

    /// Delay before the next attempt, drawing jitter from `rng`
    pub fn compute_delay_with<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        base: Duration,
        rng: &mut R,
    ) -> Duration {
        let delay = self.exponential(attempt, base);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter = delay.mul_f64(self.jitter_ratio * rng.gen_range(0.0..=1.0));
        delay + jitter
    }
}
