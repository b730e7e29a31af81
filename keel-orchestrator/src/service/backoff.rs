//! Retry and polling backoff policies

use std::time::Duration;

/// Bounded exponential backoff between stage attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per stage, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `attempt` failed before the next one
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential(self.initial_delay, self.max_delay, attempt.saturating_sub(1))
    }
}

/// Health polling schedule for the VerifyingHealth stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Give up and fail the stage with a timeout after this long
    pub deadline: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl HealthPolicy {
    /// Interval to wait after the `poll`-th health check (1-based)
    pub fn interval_for(&self, poll: u32) -> Duration {
        exponential(
            self.initial_interval,
            self.max_interval,
            poll.saturating_sub(1),
        )
    }
}

fn exponential(initial: Duration, max: Duration, exponent: u32) -> Duration {
    let factor = 2u32.saturating_pow(exponent.min(16));
    initial.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_until_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn test_health_interval_is_bounded() {
        let policy = HealthPolicy {
            deadline: Duration::from_secs(10),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(4),
        };
        assert_eq!(policy.interval_for(1), Duration::from_secs(1));
        assert_eq!(policy.interval_for(3), Duration::from_secs(4));
        assert_eq!(policy.interval_for(u32::MAX), Duration::from_secs(4));
    }
}
