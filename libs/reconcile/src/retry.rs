//! Bounded retry bookkeeping.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// A policy that never waits. Useful in tests.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = jitter_sample(delay * self.jitter);
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Pseudo random value in `[-range, range]` seeded from the clock.
fn jitter_sample(range: f64) -> f64 {
    if range <= 0.0 {
        return 0.0;
    }
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = seed.wrapping_mul(6364136223846793005).wrapping_add(1) as f64;
    ((random / u64::MAX as f64) * 2.0 - 1.0) * range
}

// =============================================================================
// Retry Tracker
// =============================================================================

/// Counts failures per key inside a sliding window.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_retries: u32,
    window: Duration,
    /// key -> (count, first failure in the current window)
    failures: BTreeMap<String, (u32, Instant)>,
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)
    }
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Records a failure. Returns true once retries are exhausted.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    pub fn is_exhausted(&self, key: &str) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };
        if Instant::now().duration_since(*first) > self.window {
            return false;
        }
        *count > self.max_retries
    }

    /// Number of failures counted in the current window.
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    /// Forgets a key after a success.
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Drops entries whose window has passed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert!(!tracker.record_failure("tcp://one"));
        assert!(!tracker.record_failure("tcp://one"));
        assert!(!tracker.record_failure("tcp://one"));
        assert!(tracker.record_failure("tcp://one"));

        assert!(tracker.is_exhausted("tcp://one"));
        assert!(!tracker.is_exhausted("tcp://two"));
        assert_eq!(tracker.failures("tcp://one"), 4);

        tracker.clear("tcp://one");
        assert!(!tracker.is_exhausted("tcp://one"));
    }

    #[test]
    fn test_retry_window_resets() {
        let mut tracker = RetryTracker::new(0, Duration::ZERO);
        assert!(tracker.record_failure("a"));
        std::thread::sleep(Duration::from_millis(2));
        assert!(!tracker.is_exhausted("a"));
        tracker.prune();
        assert_eq!(tracker.failures("a"), 0);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = BackoffPolicy::default();
        for attempt in 0..8 {
            let delay = policy.delay(attempt).as_millis() as f64;
            let nominal = (100.0 * 2.0_f64.powi(attempt as i32)).min(30_000.0);
            assert!(delay <= nominal * 1.25 + 1.0);
            assert!(delay >= nominal * 0.75 - 1.0);
        }
    }

    #[test]
    fn test_immediate_policy() {
        assert_eq!(BackoffPolicy::immediate().delay(5), Duration::ZERO);
    }
}
