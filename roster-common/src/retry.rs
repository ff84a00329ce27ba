//! # Retry
//!
//! Backoff schedule for balance jobs that failed with a transient error.
use std::time;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Multiplies the interval once per past attempt.
    pub backoff_coefficient: u32,
    /// Wait before the first retry.
    pub initial_interval: time::Duration,
    /// Upper bound for any wait, if set.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Wait before retrying after `attempt` (1-based) failed.
    /// Saturates at `Duration::MAX` when the backoff no longer fits.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(maximum) => candidate.min(maximum),
            None => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();

        for attempt in 1..=3 {
            assert_eq!(
                retry_policy.retry_interval(attempt),
                time::Duration::from_secs(2)
            );
        }
    }

    #[test]
    fn test_retry_interval_grows_until_maximum() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(1))
            .maximum_interval(time::Duration::from_secs(5))
            .provide();

        let intervals: Vec<u64> = (1..=5)
            .map(|attempt| retry_policy.retry_interval(attempt).as_secs())
            .collect();

        assert_eq!(intervals, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_retry_interval_never_overflows() {
        let retry_policy = RetryPolicy::build(10, time::Duration::from_secs(60)).provide();

        assert_eq!(retry_policy.retry_interval(u32::MAX), time::Duration::MAX);
        // 10^9 still fits in a u32 factor, 10^10 does not.
        assert_eq!(
            retry_policy.retry_interval(10),
            time::Duration::from_secs(60 * 1_000_000_000)
        );
        assert_eq!(retry_policy.retry_interval(11), time::Duration::MAX);
    }

    #[test]
    fn test_overflowing_backoff_is_capped_by_maximum() {
        let retry_policy = RetryPolicy::build(10, time::Duration::from_secs(60))
            .maximum_interval(time::Duration::from_secs(3600))
            .provide();

        assert_eq!(
            retry_policy.retry_interval(u32::MAX),
            time::Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_zeroth_attempt_uses_initial_interval() {
        let retry_policy = RetryPolicy::default();

        assert_eq!(retry_policy.retry_interval(0), time::Duration::from_secs(1));
    }
}
