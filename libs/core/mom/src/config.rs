//! Retry configuration for broker connections.

use std::time::Duration;

/// How connection and session failures are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Connection attempts after the first one failed
    pub connection_retry_count: u32,

    /// Pause between connection attempts
    pub connection_retry_interval: Duration,

    /// Pause before a consumer tries to re-create its session
    pub session_retry_interval: Duration,

    /// Upper bound for the session backoff of a long outage
    pub max_session_retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connection_retry_count: 5,
            connection_retry_interval: Duration::from_secs(1),
            session_retry_interval: Duration::from_secs(1),
            max_session_retry_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_connection_retry_count(mut self, count: u32) -> Self {
        self.connection_retry_count = count;
        self
    }

    pub fn with_connection_retry_interval(mut self, interval: Duration) -> Self {
        self.connection_retry_interval = interval;
        self
    }

    pub fn with_session_retry_interval(mut self, interval: Duration) -> Self {
        self.session_retry_interval = interval;
        self.max_session_retry_interval = self.max_session_retry_interval.max(interval);
        self
    }

    /// Backoff between connection attempts.
    pub fn connection_backoff(&self) -> BackoffStrategy {
        BackoffStrategy::Fixed(self.connection_retry_interval)
    }

    /// Backoff between session re-creation attempts of a consumer.
    pub fn session_backoff(&self) -> BackoffStrategy {
        BackoffStrategy::Exponential {
            base: self.session_retry_interval,
            max: self.max_session_retry_interval,
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),

    /// Exponential backoff (base * 2^retry_count, capped at max)
    Exponential { base: Duration, max: Duration },

    /// Linear backoff (base * (retry_count + 1), capped at max)
    Linear { base: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Calculate the delay for a given retry count.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential { base, max } => {
                let delay = base.saturating_mul(2u32.saturating_pow(retry_count));
                delay.min(*max)
            }
            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(retry_count.saturating_add(1));
                delay.min(*max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_backoff_is_capped() {
        let policy = RetryPolicy::default()
            .with_session_retry_interval(Duration::from_millis(100));
        let backoff = policy.session_backoff();

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_connection_backoff_is_fixed() {
        let policy = RetryPolicy::default().with_connection_retry_interval(Duration::from_millis(20));
        assert_eq!(policy.connection_backoff().delay(0), Duration::from_millis(20));
        assert_eq!(policy.connection_backoff().delay(9), Duration::from_millis(20));
    }

    #[test]
    fn test_backoff_linear() {
        let backoff = BackoffStrategy::Linear {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
        };

        assert_eq!(backoff.delay(0), Duration::from_secs(5));
        assert_eq!(backoff.delay(2), Duration::from_secs(15));
        assert_eq!(backoff.delay(20), Duration::from_secs(60));
    }
}
