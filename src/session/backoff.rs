use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential backoff with random jitter.
///
/// Each delay doubles the previous one up to the configured ceiling, plus a
/// uniform random jitter so a fleet of devices does not redial in lockstep.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: config.base,
        }
    }

    /// Delay to wait before the next attempt, advancing the schedule.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current + Self::jitter(self.config.max_jitter);
        self.current = std::cmp::min(self.current.saturating_mul(2), self.config.max);
        delay
    }

    /// Restarts the schedule from the base delay, after a success.
    pub(crate) fn reset(&mut self) {
        self.current = self.config.base;
    }

    /// Delay for the n-th failure (1-based) of an independent retry, without
    /// carrying state. Used for per-message acknowledgement retries.
    pub(crate) fn delay_for_attempt(config: &BackoffConfig, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = std::cmp::min(
            config.base.saturating_mul(2u32.saturating_pow(exponent)),
            config.max,
        );
        delay + Self::jitter(config.max_jitter)
    }

    fn jitter(max: Duration) -> Duration {
        Duration::from_millis(rand::random_range(0..=max.as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(base_ms: u64, max_ms: u64, jitter_ms: u64) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            max_jitter: Duration::from_millis(jitter_ms),
        }
    }

    #[test]
    fn test_delay_doubles_up_to_max() {
        let mut backoff = Backoff::new(config(100, 450, 0));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 450, 450]);
    }

    #[test]
    fn test_reset_restarts_from_base() {
        let mut backoff = Backoff::new(config(100, 1000, 0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_for_attempt_is_capped() {
        let config = config(100, 450, 0);
        assert_eq!(
            Backoff::delay_for_attempt(&config, 1),
            Duration::from_millis(100)
        );
        assert_eq!(
            Backoff::delay_for_attempt(&config, 2),
            Duration::from_millis(200)
        );
        assert_eq!(
            Backoff::delay_for_attempt(&config, 3),
            Duration::from_millis(400)
        );
        assert_eq!(
            Backoff::delay_for_attempt(&config, 4),
            Duration::from_millis(450)
        );
        // Large attempt counts must not overflow
        assert_eq!(
            Backoff::delay_for_attempt(&config, u32::MAX),
            Duration::from_millis(450)
        );
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let mut backoff = Backoff::new(config(100, 100, 50));
        for _ in 0..20 {
            let delay = backoff.next_delay().as_millis() as u64;
            assert!((100..=150).contains(&delay), "delay {delay} out of range");
            backoff.reset();
        }
    }
}
