//! Exponential backoff with symmetric jitter.

use std::time::Duration;

use genrelay_config::RetryConfig;
use rand::Rng;

/// Delay before transient retry number `retry` (1-based).
///
/// Doubles from `base_delay`, capped at `max_delay`, then jittered
/// uniformly within ±`jitter_factor`. A provider-supplied `retry_after`
/// is authoritative and bypasses both the cap and the jitter.
pub fn backoff_delay(config: &RetryConfig, retry: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(hint) = retry_after {
        return hint;
    }

    let exponent = retry.saturating_sub(1).min(16);
    let computed = config
        .base_delay()
        .saturating_mul(1u32 << exponent)
        .min(config.max_delay());

    apply_jitter(computed, config.jitter_factor)
}

fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let spread = delay.as_secs_f64() * factor;
    let low = (delay.as_secs_f64() - spread).max(0.0);
    let high = delay.as_secs_f64() + spread;
    Duration::from_secs_f64(rand::rng().random_range(low..=high))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, max_ms: u64, jitter: f64) -> RetryConfig {
        RetryConfig {
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
            jitter_factor: jitter,
            ..Default::default()
        }
    }

    #[test]
    fn test_doubles_without_jitter() {
        let c = config(100, 10_000, 0.0);
        assert_eq!(backoff_delay(&c, 1, None), Duration::from_millis(100));
        assert_eq!(backoff_delay(&c, 2, None), Duration::from_millis(200));
        assert_eq!(backoff_delay(&c, 3, None), Duration::from_millis(400));
        assert_eq!(backoff_delay(&c, 4, None), Duration::from_millis(800));
    }

    #[test]
    fn test_capped_at_max_delay() {
        let c = config(100, 500, 0.0);
        assert_eq!(backoff_delay(&c, 10, None), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let c = config(1000, 60_000, 0.25);
        for retry in 1..=4 {
            let nominal = 1000u64 << (retry - 1);
            let d = backoff_delay(&c, retry, None).as_millis() as u64;
            let low = nominal - nominal / 4;
            let high = nominal + nominal / 4;
            assert!(
                (low..=high).contains(&d),
                "retry {retry}: {d}ms outside [{low}, {high}]"
            );
        }
    }

    #[test]
    fn test_retry_after_overrides_everything() {
        let c = config(100, 500, 0.5);
        assert_eq!(
            backoff_delay(&c, 1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_large_retry_number_does_not_overflow() {
        let c = config(100, 5_000, 0.0);
        assert_eq!(backoff_delay(&c, u32::MAX, None), Duration::from_millis(5_000));
    }
}
