//! Backoff strategies for message retries and outbox redelivery.

use rand::Rng;
use std::time::Duration;

/// Fixed replay ladder for dead-letter deliveries.
///
/// The tier is keyed by the delivery's replay attempt: the first replay
/// waits one minute, later ones stretch out and cap at thirty minutes.
/// Out-of-range attempts (including negative counts from malformed
/// headers) fall back to the first tier.
pub fn dlq_replay_delay(attempt: i64) -> Duration {
    match attempt {
        i64::MIN..=1 => Duration::from_secs(60),
        2 => Duration::from_secs(5 * 60),
        3 => Duration::from_secs(15 * 60),
        _ => Duration::from_secs(30 * 60),
    }
}

/// Exponential backoff with a cap and optional additive jitter.
///
/// `delay(n)` for the nth failure (1-indexed) is
/// `min(max, initial * 2^(n-1))`, plus `delay * jitter_factor * U[0,1)`
/// when a jitter factor is set.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter_factor: f64,
}

impl Backoff {
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self { initial, max, jitter_factor: 0.0 }
    }

    /// Additive jitter as a fraction of the computed delay. Values are
    /// clamped to `[0.0, 1.0]`.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Deterministic delay for a given attempt number (1-indexed), before
    /// jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = 2u32.saturating_pow(exponent);
        self.initial
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX)
            .min(self.max)
    }

    /// Delay with jitter applied using the thread RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Delay with jitter applied using a caller-supplied RNG (for tests).
    pub fn delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_factor == 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter_factor * rng.random_range(0.0..1.0);
        base + Duration::from_secs_f64(spread)
    }
}
