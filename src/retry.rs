//! Retry bookkeeping with exponential backoff for connection dialing
//!
//! A [`DialLimit`] bounds how many dial attempts may fail, and [`RetryState`]
//! tracks progress and computes the delay before the next attempt. Delays grow
//! as `base_delay * 2^n`, capped at `max_delay`, so they never decrease.
//!
//! # Example
//!
//! ```
//! use command_provider::retry::{DialLimit, RetryConfig, RetryState};
//! use std::time::Duration;
//!
//! let config = RetryConfig::new(Duration::from_millis(500), Duration::from_secs(8));
//! let limit = DialLimit::from_setting(3);
//! let mut state = RetryState::new();
//!
//! // First attempt failed
//! state.record_failure();
//! assert!(state.should_retry(limit));
//! assert_eq!(state.calculate_delay(&config), Duration::from_millis(500));
//! ```

use std::fmt;
use std::time::Duration;
use tracing::debug;

/// How many failed dials are tolerated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialLimit {
    /// Keep dialing until the call is cancelled
    Unlimited,
    /// Give up once this many attempts have failed (at least one attempt is made)
    Attempts(u32),
}

impl DialLimit {
    /// Interpret a `dialErrorLimit` setting: any negative value is unlimited
    pub fn from_setting(limit: i32) -> Self {
        if limit < 0 {
            DialLimit::Unlimited
        } else {
            DialLimit::Attempts((limit as u32).max(1))
        }
    }
}

impl fmt::Display for DialLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialLimit::Unlimited => write!(f, "inf"),
            DialLimit::Attempts(n) => write!(f, "{}", n),
        }
    }
}

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Maximum delay cap to prevent excessive waiting
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Default dial backoff (500ms base, 8s max)
    pub fn default_config() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(8))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Progress of one retry loop
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Number of attempts that have failed so far
    pub failures: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self { failures: 0 }
    }

    /// Whether another attempt is allowed after the failures recorded so far
    pub fn should_retry(&self, limit: DialLimit) -> bool {
        match limit {
            DialLimit::Unlimited => true,
            DialLimit::Attempts(n) => self.failures < n,
        }
    }

    /// Delay before the next attempt
    ///
    /// Formula: delay = base_delay * 2^(failures - 1), capped at max_delay.
    pub fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(31);
        let base = config.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let exponential = base.saturating_mul(1u64 << exponent);
        let capped = Duration::from_millis(exponential).min(config.max_delay);

        debug!(
            "Calculated dial backoff: {:?} after {} failure(s)",
            capped, self.failures
        );

        capped
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_limit_from_setting() {
        assert_eq!(DialLimit::from_setting(-1), DialLimit::Unlimited);
        assert_eq!(DialLimit::from_setting(-7), DialLimit::Unlimited);
        assert_eq!(DialLimit::from_setting(0), DialLimit::Attempts(1));
        assert_eq!(DialLimit::from_setting(10), DialLimit::Attempts(10));
        assert_eq!(DialLimit::Unlimited.to_string(), "inf");
        assert_eq!(DialLimit::Attempts(3).to_string(), "3");
    }

    #[test]
    fn test_should_retry_bounded() {
        let limit = DialLimit::Attempts(3);
        let mut state = RetryState::new();

        assert!(state.should_retry(limit));
        state.record_failure();
        assert!(state.should_retry(limit));
        state.record_failure();
        assert!(state.should_retry(limit));

        // Third failure exhausts the limit
        state.record_failure();
        assert!(!state.should_retry(limit));
    }

    #[test]
    fn test_should_retry_unlimited() {
        let mut state = RetryState::new();
        for _ in 0..1000 {
            state.record_failure();
        }
        assert!(state.should_retry(DialLimit::Unlimited));
    }

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig::default();
        let mut state = RetryState::new();

        state.record_failure();
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(500));
        state.record_failure();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(1));
        state.record_failure();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(2));
        state.record_failure();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(4));
        state.record_failure();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(8));

        // Capped
        state.record_failure();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_is_monotonic() {
        let config = RetryConfig::new(Duration::from_millis(300), Duration::from_secs(5));
        let mut state = RetryState::new();
        let mut previous = Duration::ZERO;
        for _ in 0..40 {
            state.record_failure();
            let delay = state.calculate_delay(&config);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_overflow_protection() {
        let config = RetryConfig::new(Duration::from_secs(1), Duration::from_secs(3600));
        let state = RetryState { failures: u32::MAX };

        // Should not panic or overflow
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(3600));
    }
}
