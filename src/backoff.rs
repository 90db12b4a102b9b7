use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Bounded exponential backoff with jitter.
///
/// Each call to [`Backoff::next_delay`] consumes one attempt; the delay
/// doubles from `base_delay_ms` up to `max_delay_ms` and is jittered into
/// the upper half of that window so concurrent retriers spread out.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.config.max_attempts
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let shift = self.attempts.min(20);
        self.attempts += 1;

        let ceiling = self
            .config
            .base_delay_ms
            .saturating_mul(1 << shift)
            .min(self.config.max_delay_ms);
        if ceiling == 0 {
            return Some(Duration::ZERO);
        }
        let jittered = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Some(Duration::from_millis(jittered))
    }

    /// Sleeps for the next delay. Returns `false` without sleeping when the
    /// budget is exhausted.
    pub async fn wait(&mut self) -> bool {
        match self.next_delay() {
            Some(delay) if delay.is_zero() => {
                tokio::task::yield_now().await;
                true
            }
            Some(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_stay_capped() {
        let mut backoff = Backoff::new(RetryConfig::new(6, 10, 40));
        let delays: Vec<Duration> = std::iter::from_fn(|| backoff.next_delay()).collect();

        assert_eq!(delays.len(), 6);
        assert!(delays[0] >= Duration::from_millis(5) && delays[0] <= Duration::from_millis(10));
        assert!(delays[1] >= Duration::from_millis(10) && delays[1] <= Duration::from_millis(20));
        for delay in &delays[2..] {
            assert!(*delay >= Duration::from_millis(20));
            assert!(*delay <= Duration::from_millis(40));
        }
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn no_retry_budget_is_immediately_exhausted() {
        let mut backoff = Backoff::new(RetryConfig::no_retry());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 0);
    }

    #[tokio::test]
    async fn wait_reports_exhaustion() {
        let mut backoff = Backoff::new(RetryConfig::new(2, 0, 0));
        assert!(backoff.wait().await);
        assert!(backoff.wait().await);
        assert!(!backoff.wait().await);
        assert_eq!(backoff.attempts(), 2);
    }
}
