//! Retry policy with exponential backoff for broker calls.
//!
//! Retries always reuse the original client order id: a call that timed out
//! may have succeeded broker-side, and the registry's replay check depends
//! on the key staying stable across attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry configuration for broker calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts including the first (default: 3).
    pub max_attempts: u32,
    /// Initial backoff (default: 200ms).
    pub initial_backoff: Duration,
    /// Backoff cap (default: 5s).
    pub max_backoff: Duration,
    /// Exponential growth factor (default: 2.0).
    pub multiplier: f64,
    /// Jitter factor, +/- fraction of the base delay (default: 0.2).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries, for tests and chase replaces.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(0),
            max_backoff: Duration::from_millis(0),
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

/// Stateful backoff sequence for one logical request.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    policy: RetryPolicy,
}

impl Backoff {
    /// Start a backoff sequence under a policy.
    #[must_use]
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            policy: policy.clone(),
        }
    }

    /// Delay before the next retry, or `None` once attempts are exhausted.
    ///
    /// The first call accounts for the initial attempt, so a policy with
    /// `max_attempts = 3` yields two delays.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.policy.max_attempts {
            return None;
        }

        let base = self.policy.initial_backoff.as_millis() as f64
            * self.policy.multiplier.powi(self.attempt as i32 - 1);
        let capped = base.min(self.policy.max_backoff.as_millis() as f64);
        Some(Duration::from_millis(apply_jitter(capped, self.policy.jitter)))
    }

    /// Attempts consumed so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}

fn apply_jitter(delay_ms: f64, jitter: f64) -> u64 {
    if jitter <= 0.0 || delay_ms <= 0.0 {
        return delay_ms as u64;
    }
    let spread = delay_ms * jitter;
    let min = (delay_ms - spread).max(0.0);
    let max = delay_ms + spread;
    rand::rng().random_range(min..=max) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            jitter: 0.0,
            ..Default::default()
        };
        let mut backoff = Backoff::new(&policy);

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn delays_grow_exponentially_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
        };
        let mut backoff = Backoff::new(&policy);

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn delays_capped_at_max_backoff() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
            multiplier: 10.0,
            jitter: 0.0,
        };
        let mut backoff = Backoff::new(&policy);

        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 50,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 1.0,
            jitter: 0.2,
        };
        let mut backoff = Backoff::new(&policy);

        while let Some(delay) = backoff.next_delay() {
            let ms = delay.as_millis() as u64;
            assert!((80..=120).contains(&ms), "jittered delay {ms}ms out of bounds");
        }
    }

    #[test]
    fn none_policy_never_retries() {
        let mut backoff = Backoff::new(&RetryPolicy::none());
        assert!(backoff.next_delay().is_none());
    }
}
