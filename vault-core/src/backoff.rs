//! Retry schedules.
//!
//! Backoff uses full jitter: the delay before retry `n` is drawn uniformly
//! from `[0, ceiling(n)]`, where the ceiling grows geometrically and is capped.
//! This is pure schedule arithmetic; the async retry loop lives in
//! `keyrelay-client`.

use std::time::Duration;

/// Bounded exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first (at least 1)
    pub max_attempts: u32,
    /// Ceiling for the first retry delay
    pub starting_delay: Duration,
    /// Growth factor applied per attempt (at least 1.0)
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Create a policy. `max_attempts` is clamped to at least 1 and
    /// `multiplier` to at least 1.0.
    pub fn new(
        max_attempts: u32,
        starting_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            starting_delay,
            multiplier: if multiplier.is_finite() {
                multiplier.max(1.0)
            } else {
                1.0
            },
            max_delay,
        }
    }

    /// Short schedule for user-facing writes.
    pub fn interactive_publish() -> Self {
        Self::new(
            3,
            Duration::from_millis(250),
            2.0,
            Duration::from_secs(2),
        )
    }

    /// Longer schedule for reads that can afford to wait.
    pub fn background_query() -> Self {
        Self::new(
            6,
            Duration::from_millis(500),
            2.0,
            Duration::from_secs(15),
        )
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// Maximum delay after the given zero-based failed attempt.
    ///
    /// `min(max_delay, starting_delay * multiplier^attempt)`
    pub fn ceiling(&self, attempt: u32) -> Duration {
        if self.starting_delay.is_zero() {
            return Duration::ZERO;
        }
        let max_nanos = self.max_delay.as_nanos() as f64;
        // powi saturates to infinity for large exponents, so min() still caps
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.starting_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        Duration::from_nanos(raw.min(max_nanos).round() as u64)
    }

    /// Jittered delay after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let ceiling_us = ceiling.as_micros().min(u64::MAX as u128) as u64;
        if ceiling_us == 0 {
            return ceiling;
        }
        match random_u64() {
            Some(random) => Duration::from_micros(random % (ceiling_us + 1)),
            // No entropy: fall back to the deterministic ceiling
            None => ceiling,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            4,
            Duration::from_millis(300),
            2.0,
            Duration::from_secs(5),
        )
    }
}

fn random_u64() -> Option<u64> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).ok()?;
    Some(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(5, Duration::from_millis(100), 2.0, Duration::from_secs(1))
    }

    #[test]
    fn ceiling_grows_geometrically() {
        let p = policy();
        assert_eq!(p.ceiling(0), Duration::from_millis(100));
        assert_eq!(p.ceiling(1), Duration::from_millis(200));
        assert_eq!(p.ceiling(2), Duration::from_millis(400));
        assert_eq!(p.ceiling(3), Duration::from_millis(800));
    }

    #[test]
    fn ceiling_is_capped() {
        let p = policy();
        assert_eq!(p.ceiling(4), Duration::from_secs(1));
        assert_eq!(p.ceiling(50), Duration::from_secs(1));
        assert_eq!(p.ceiling(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn delay_stays_within_ceiling() {
        let p = policy();
        for attempt in 0..8 {
            for _ in 0..50 {
                assert!(p.delay(attempt) <= p.ceiling(attempt));
            }
        }
    }

    #[test]
    fn jitter_creates_variance() {
        let p = BackoffPolicy::new(5, Duration::from_secs(10), 1.0, Duration::from_secs(10));
        let delays: Vec<Duration> = (0..20).map(|_| p.delay(0)).collect();
        let first = delays[0];
        assert!(
            delays.iter().any(|d| *d != first),
            "full jitter should vary delays across calls"
        );
    }

    #[test]
    fn sub_millisecond_ceiling_is_still_jittered() {
        let p = BackoffPolicy::new(5, Duration::from_micros(800), 1.0, Duration::from_millis(1));
        let delays: Vec<Duration> = (0..50).map(|_| p.delay(0)).collect();
        assert!(delays.iter().all(|d| *d <= Duration::from_micros(800)));
        assert!(delays.iter().any(|d| *d < Duration::from_micros(800)));
    }

    #[test]
    fn zero_ceiling_means_zero_delay() {
        let p = BackoffPolicy::no_retry();
        assert_eq!(p.delay(0), Duration::ZERO);
        assert!(!p.allows_retry(1));
    }

    #[test]
    fn constructor_clamps_degenerate_values() {
        let p = BackoffPolicy::new(0, Duration::from_millis(10), 0.5, Duration::from_secs(1));
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.multiplier, 1.0);
        assert_eq!(p.ceiling(10), Duration::from_millis(10));

        let nan =
            BackoffPolicy::new(2, Duration::from_millis(10), f64::NAN, Duration::from_secs(1));
        assert_eq!(nan.multiplier, 1.0);
    }

    #[test]
    fn presets() {
        let publish = BackoffPolicy::interactive_publish();
        assert_eq!(publish.max_attempts, 3);
        assert_eq!(publish.max_delay, Duration::from_secs(2));

        let query = BackoffPolicy::background_query();
        assert_eq!(query.max_attempts, 6);
        assert!(query.max_delay > publish.max_delay);

        let default = BackoffPolicy::default();
        assert_eq!(default.max_attempts, 4);
    }

    #[test]
    fn allows_retry_counts_total_attempts() {
        let p = policy();
        assert!(p.allows_retry(1));
        assert!(p.allows_retry(4));
        assert!(!p.allows_retry(5));
    }
}
