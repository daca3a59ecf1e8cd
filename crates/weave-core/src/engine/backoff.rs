//! Exponential, capped, jittered backoff.

use std::time::Duration;

use crate::models::workflow::RetryPolicy;

/// Delay before retry number `failed_attempts` (1 after the first failure).
///
/// The exponential delay `base * 2^(n-1)` is capped at `cap`, then up to
/// `jitter` of it is randomly shaved off so that retries of many steps do
/// not line up.
pub fn delay(policy: &RetryPolicy, failed_attempts: u32) -> Duration {
    let exp = failed_attempts.saturating_sub(1).min(32);
    let raw = policy
        .backoff_base_ms
        .saturating_mul(1u64 << exp)
        .min(policy.backoff_cap_ms);
    let jitter = policy.jitter.clamp(0.0, 1.0);
    let shaved = (raw as f64 * jitter * random_unit()) as u64;
    Duration::from_millis(raw.saturating_sub(shaved))
}

/// Uniform sample in `[0, 1)`; falls back to 0.5 if the OS RNG is unavailable.
fn random_unit() -> f64 {
    let mut buf = [0u8; 8];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => (u64::from_le_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64,
        Err(_) => 0.5,
    }
}
