//! Backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;

/// Un-jittered delay before retry number `attempt` (1-based).
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

impl RetryPolicy {
    /// Delay before retry number `attempt`, jittered into `[d/2, d]` so
    /// workers that failed together do not retry in lockstep.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = backoff_delay(self.base_delay, self.max_delay, attempt);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        if spread == 0 {
            return ceiling;
        }
        half + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, max, 5), max);
        assert_eq!(backoff_delay(base, max, 200), max);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };
        for attempt in 1..=6 {
            let ceiling = backoff_delay(policy.base_delay, policy.max_delay, attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay <= ceiling, "{delay:?} > {ceiling:?}");
                assert!(delay >= ceiling / 2, "{delay:?} < half of {ceiling:?}");
            }
        }
    }

    #[test]
    fn test_exhausted() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));

        let zero = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(zero.exhausted(1));
    }
}
