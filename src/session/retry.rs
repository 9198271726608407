use std::time::Duration;
use tokio::time::sleep;

/// Backoff parameters for scheduled session refreshes
///
/// A cycle is one initial attempt plus `max_retries` retries spaced
/// `initial_delay * 2^n` apart (capped at `max_delay`). When a cycle is
/// exhausted the caller waits `cooldown` and starts a fresh cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(120),
            max_retries: 3,
            cooldown: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_retries: u32, cooldown: Duration) -> Self {
        let max_delay = initial_delay.saturating_mul(2u32.saturating_pow(max_retries.saturating_sub(1)));
        Self {
            initial_delay,
            max_delay,
            max_retries,
            cooldown,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay)
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: self.clone(),
            current_attempt: 0,
        }
    }
}

#[derive(Debug)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    /// Delay the next retry would use, or `None` once the cycle is exhausted
    pub fn next_delay(&self) -> Option<Duration> {
        if self.current_attempt >= self.policy.max_retries {
            return None;
        }
        Some(self.policy.delay_for(self.current_attempt))
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        let delay = self.next_delay().ok_or(MaxRetriesExceeded)?;

        log::warn!(
            "⏳ Retry attempt {} of {} in {}s",
            self.current_attempt + 1,
            self.policy.max_retries,
            delay.as_secs()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(5), Duration::from_secs(120));
    }

    #[test]
    fn test_new_derives_cap_from_retries() {
        let policy = RetryPolicy::new(Duration::from_secs(10), 4, Duration::from_secs(60));
        assert_eq!(policy.max_delay, Duration::from_secs(80));
        assert_eq!(policy.delay_for(3), Duration::from_secs(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhausts_then_resets() {
        let mut backoff = RetryPolicy::default().backoff();
        let start = tokio::time::Instant::now();

        for _ in 0..3 {
            backoff.sleep().await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::from_secs(210));
        assert!(backoff.sleep().await.is_err());
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(30)));
    }
}
