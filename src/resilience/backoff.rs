//! Exponential backoff with optional jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
/// plus up to `jitter_ratio` of that as random jitter, capped at `max`.
///
/// Non-decreasing in `attempt` for any `jitter_ratio <= 1`.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration, jitter_ratio: f64) -> Duration {
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;

    let exponential = 2u64.saturating_pow(attempt);
    let delay_ms = base_ms.saturating_mul(exponential);

    let jitter_range = (delay_ms.min(max_ms) as f64 * jitter_ratio.clamp(0.0, 1.0)) as u64;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(delay_ms.saturating_add(jitter).min(max_ms))
}

/// Punitive backoff after `consecutive_failures` failures:
/// `multiplier ^ consecutive_failures` seconds, capped at `max_secs`.
pub fn failure_backoff(consecutive_failures: u32, multiplier: f64, max_secs: f64) -> Duration {
    let exponent = consecutive_failures.min(i32::MAX as u32) as i32;
    let secs = multiplier.powi(exponent).min(max_secs);
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}
