//! Exponential backoff for submission retries and publish retries.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// `backoff_for` plus up to 10% random jitter, still capped.
    pub fn jittered_backoff_for(&self, attempt: u32) -> Duration {
        let base = self.backoff_for(attempt);
        let jitter_ms = (base.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        (base + jitter).min(self.max_backoff)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(20));
        assert_eq!(policy.backoff_for(20), Duration::from_secs(300));
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.jittered_backoff_for(2);
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(11));
        }
    }

    #[test]
    fn exhaustion() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }
}
