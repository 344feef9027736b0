use std::time::Duration;

/// Backoff applied by the queue when a delivery is rejected and handed back.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Multiplies the interval once per past attempt.
    backoff_coefficient: u32,
    /// Wait before the first redelivery.
    initial_interval: Duration,
    maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Delay before redelivering a message that just failed its `attempt`-th try.
    pub fn time_until_next_retry(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let candidate = self
            .backoff_coefficient
            .checked_pow(exponent)
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(Duration::MAX);

        match self.maximum_interval {
            Some(maximum) => candidate.min(maximum),
            None => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}
