//! Retry policy: error classification + exponential backoff with jitter.
//!
//! Delay on attempt k (1-indexed):
//! `min(max_delay, base_delay * multiplier^(k-1)) * jitter`,
//! jitter sampled uniformly from [0.5, 1.5).

use std::time::Duration;

use rand::Rng;

use crate::types::ErrorKind;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Disable for deterministic tests.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Retry policy. Classification delegates to [`ErrorKind::is_retryable`]
/// so the executor and the policy can never disagree.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries + 1
    }

    /// Whether another attempt is allowed after attempt `attempt`
    /// (1-indexed) failed with `kind`.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        kind.is_retryable() && attempt < self.max_attempts()
    }

    /// Backoff before retry number `attempt` (1-indexed: the delay
    /// after the first failure uses `attempt = 1`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let scaled = self.config.base_delay.as_secs_f64() * self.config.multiplier.powi(exp as i32);
        let capped = scaled.min(self.config.max_delay.as_secs_f64());
        let factor = if self.config.jitter {
            rand::thread_rng().gen_range(0.5..1.5)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            jitter,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn test_classification() {
        let p = policy(false);
        assert!(p.should_retry(ErrorKind::Timeout, 1));
        assert!(p.should_retry(ErrorKind::NonceTooLow, 2));
        assert!(p.should_retry(ErrorKind::GasAllowanceExceeded, 3));
        assert!(!p.should_retry(ErrorKind::Reverted, 1));
        assert!(!p.should_retry(ErrorKind::InsufficientFunds, 1));
        assert!(!p.should_retry(ErrorKind::InvalidAddress, 1));
        assert!(!p.should_retry(ErrorKind::Unauthorized, 1));
    }

    #[test]
    fn test_attempt_bound() {
        // No signal causes more than max_retries + 1 attempts.
        let p = policy(false);
        assert_eq!(p.max_attempts(), 4);
        assert!(p.should_retry(ErrorKind::Timeout, 3));
        assert!(!p.should_retry(ErrorKind::Timeout, 4));
        assert!(!p.should_retry(ErrorKind::Timeout, 5));
    }

    #[test]
    fn test_exponential_schedule_without_jitter() {
        let p = policy(false);
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(4), Duration::from_secs(8));
        // Capped at max_delay.
        assert_eq!(p.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = policy(true);
        for _ in 0..200 {
            let d = p.delay_for(2).as_secs_f64();
            // base 2s, jitter in [0.5, 1.5)
            assert!(d >= 1.0, "delay {d} below jitter floor");
            assert!(d < 3.0, "delay {d} above jitter ceiling");
        }
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let p = policy(false);
        assert_eq!(p.delay_for(1_000), Duration::from_secs(30));
    }
}
