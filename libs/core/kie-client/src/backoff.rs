//! Retry delay policy for provider calls.

use rand::RngExt;
use std::time::Duration;

/// Exponential backoff for attempt `attempt` (1-based), capped at `max_delay`,
/// with uniform jitter in `[0, base_delay)`. A 429 doubles the delay once
/// more before the cap.
pub fn backoff_delay(attempt: u32, status: Option<u16>, base_delay: f64, max_delay: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let mut delay = (base_delay * 2f64.powi(exponent as i32)).min(max_delay);
    if status == Some(429) {
        delay = (delay * 2.0).min(max_delay);
    }
    let jitter = if base_delay > 0.0 {
        rand::rng().random_range(0.0..base_delay)
    } else {
        0.0
    };
    Duration::from_secs_f64(delay + jitter)
}

/// Whether a failed exchange should be retried: network errors (status 0),
/// 429, and 5xx.
pub fn should_retry(status: u16) -> bool {
    status == 0 || status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_matrix() {
        assert!(should_retry(0));
        assert!(should_retry(429));
        assert!(should_retry(500));
        assert!(should_retry(599));
        assert!(!should_retry(200));
        assert!(!should_retry(401));
        assert!(!should_retry(404));
        assert!(!should_retry(422));
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        // Jitter is in [0, base), so delay(n) is in [base*2^(n-1), base*2^(n-1) + base)
        for attempt in 1..=4u32 {
            let delay = backoff_delay(attempt, None, 1.0, 60.0).as_secs_f64();
            let expected = 2f64.powi(attempt as i32 - 1);
            assert!(delay >= expected, "attempt {attempt}: {delay} < {expected}");
            assert!(delay < expected + 1.0, "attempt {attempt}: {delay} jitter too large");
        }
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let delay = backoff_delay(12, None, 1.0, 60.0).as_secs_f64();
        assert!(delay < 61.0);
    }

    #[test]
    fn test_rate_limit_doubles_once_more() {
        let plain = backoff_delay(2, None, 1.0, 60.0).as_secs_f64();
        let limited = backoff_delay(2, Some(429), 1.0, 60.0).as_secs_f64();
        // plain is in [2, 3), limited in [4, 5)
        assert!(plain < 3.0);
        assert!(limited >= 4.0);
    }
}
