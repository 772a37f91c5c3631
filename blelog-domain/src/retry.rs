use std::time::Duration;

/// Exponential backoff with a cap. `max_attempts: None` never gives up.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: Some(max_attempts.max(1)),
            ..RetryPolicy::default()
        }
    }

    pub fn unbounded(initial_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: None,
            initial_delay,
            max_delay,
            multiplier: 2,
        }
    }

    /// Wait before attempt `attempt + 1`, given that `attempt` (1-based) just
    /// failed. `None` means no further attempt is allowed.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && attempt >= max
        {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        Some(
            self.initial_delay
                .saturating_mul(factor)
                .min(self.max_delay),
        )
    }
}
