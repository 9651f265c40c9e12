//! Exponential backoff shared by process restarts and listener reconnects.

use crate::config::{ReconnectConfig, SupervisorConfig};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub ceiling: Duration,
    /// Retries allowed before giving up
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), capped at the ceiling.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.ceiling.as_nanos() as f64 {
            self.ceiling
        } else {
            Duration::from_nanos(scaled.round() as u64)
        }
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

impl From<&ReconnectConfig> for BackoffPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier,
            ceiling: Duration::from_millis(cfg.max_delay_ms),
            max_attempts: cfg.max_attempts,
        }
    }
}

impl From<&SupervisorConfig> for BackoffPolicy {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.backoff_base_ms),
            multiplier: 2.0,
            ceiling: Duration::from_millis(cfg.backoff_max_ms),
            max_attempts: cfg.max_restarts as u32,
        }
    }
}

/// Attempt counter over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Register a failure. Returns the delay before the next attempt, or
    /// `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.policy.allows(self.attempt) {
            Some(self.policy.delay_for(self.attempt))
        } else {
            None
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            ceiling: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }

    #[test]
    fn test_delays_grow_then_cap() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1000));
        assert_eq!(p.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_budget_is_exhausted() {
        let mut backoff = Backoff::new(policy());
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();

        assert_eq!(delays.len(), 5);
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }
}
