use std::time::Duration;

/// How often a sleeping retry loop checks its abort condition
pub(super) const ABORT_CHECK_INTERVAL: Duration = Duration::from_millis(20);

/// Bounded retry window for opening a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    /// Delay after the first failure
    pub interval: Duration,
    /// Upper bound for the doubling delay
    pub max_interval: Duration,
}

impl RetryPolicy {
    /// Retries at a constant interval
    #[must_use]
    pub fn constant(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval, max_interval: interval }
    }
}

/// Doubles the delay after every failure, up to the policy's maximum.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        let initial = policy.interval.max(Duration::from_millis(1));
        Self { current: initial, max: policy.max_interval.max(initial) }
    }

    /// Returns the delay before the next attempt and advances the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}
