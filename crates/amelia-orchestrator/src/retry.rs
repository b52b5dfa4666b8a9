//! Retry policy for transient node failures (spec.md §4.2, §6.5).

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter: `base * 2^k` capped at `max_delay`,
/// for up to `max_retries` attempts beyond the first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs_f64(1.0),
            max_delay: Duration::from_secs_f64(60.0),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry attempt `k` (1-based: the first retry is k=1).
    /// Jitter is +/-20% to avoid a thundering herd of retrying runners.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
        let capped = base.min(self.max_delay.as_secs_f64());

        let mut rng = rand::thread_rng();
        let jitter_range = capped * 0.2;
        let jittered = (capped + rng.gen_range(-jitter_range..=jitter_range)).max(0.0);
        Duration::from_secs_f64(jittered)
    }

    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_has_no_delay() {
        assert_eq!(RetryPolicy::default().delay_for(0), Duration::ZERO);
    }

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(100));
        let d1 = policy.delay_for(1).as_secs_f64();
        let d2 = policy.delay_for(2).as_secs_f64();
        assert!((0.8..=1.2).contains(&d1));
        assert!((1.6..=2.4).contains(&d2));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5));
        let d = policy.delay_for(10);
        assert!(d.as_secs_f64() <= 6.0);
    }

    #[test]
    fn attempts_remaining_respects_max_retries() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10));
        assert!(policy.has_attempts_remaining(3));
        assert!(!policy.has_attempts_remaining(4));
    }
}
