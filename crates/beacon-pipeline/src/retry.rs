//! Delay policies for the periodic upload loop.
//!
//! The loop asks the policy for the next delay after every tick. Zero
//! consecutive failures always means the normal interval.

use std::time::Duration;

use rand::Rng;

use beacon_core::{BeaconConfig, RetryStrategy};

/// Floor applied to any jittered delay.
const MIN_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_JITTER: f64 = 0.2;

pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Delay before the next tick, given the current failure streak.
    fn next_delay(&self, interval: Duration, consecutive_failures: u32) -> Duration;
}

/// Normal interval on success, one fixed longer interval after any failure.
#[derive(Clone, Debug)]
pub struct DualRatePolicy {
    pub failure_backoff: Duration,
}

impl RetryPolicy for DualRatePolicy {
    fn next_delay(&self, interval: Duration, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            interval
        } else {
            self.failure_backoff.max(interval)
        }
    }
}

/// `interval * 2^failures`, capped at `max_delay`, with ±`jitter_factor`.
/// Never shorter than the normal interval.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffPolicy {
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn next_delay(&self, interval: Duration, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return interval;
        }
        let exp = interval.as_millis() as f64 * 2.0_f64.powi(consecutive_failures.min(30) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_ms = (capped + jitter)
            .max(interval.as_millis() as f64)
            .max(MIN_DELAY.as_millis() as f64);
        Duration::from_millis(final_ms as u64)
    }
}

/// Policy selected by `retryStrategy`. The backoff ceiling is `failureBackoffMs`.
pub fn policy_for(config: &BeaconConfig) -> Box<dyn RetryPolicy> {
    match config.retry_strategy {
        RetryStrategy::DualRate => Box::new(DualRatePolicy {
            failure_backoff: config.failure_backoff(),
        }),
        RetryStrategy::Exponential => Box::new(ExponentialBackoffPolicy {
            max_delay: config.failure_backoff(),
            jitter_factor: DEFAULT_JITTER,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);

    #[test]
    fn dual_rate_switches_on_failure() {
        let p = DualRatePolicy {
            failure_backoff: Duration::from_secs(300),
        };
        assert_eq!(p.next_delay(INTERVAL, 0), INTERVAL);
        assert_eq!(p.next_delay(INTERVAL, 1), Duration::from_secs(300));
        assert_eq!(p.next_delay(INTERVAL, 7), Duration::from_secs(300));
    }

    #[test]
    fn exponential_doubles_without_jitter() {
        let p = ExponentialBackoffPolicy {
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
        };
        let base = Duration::from_millis(100);
        assert_eq!(p.next_delay(base, 0).as_millis(), 100);
        assert_eq!(p.next_delay(base, 1).as_millis(), 200);
        assert_eq!(p.next_delay(base, 2).as_millis(), 400);
        assert_eq!(p.next_delay(base, 3).as_millis(), 800);
    }

    #[test]
    fn exponential_is_capped() {
        let p = ExponentialBackoffPolicy {
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.0,
        };
        assert_eq!(p.next_delay(Duration::from_secs(1), 10).as_millis(), 5000);
        assert_eq!(p.next_delay(Duration::from_secs(1), u32::MAX).as_millis(), 5000);
    }

    #[test]
    fn exponential_never_undercuts_interval() {
        let p = ExponentialBackoffPolicy {
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.0,
        };
        let interval = Duration::from_secs(600);
        assert_eq!(p.next_delay(interval, 1), interval);
        assert_eq!(p.next_delay(interval, 5), interval);

        let jittered = ExponentialBackoffPolicy {
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.2,
        };
        for _ in 0..50 {
            assert!(jittered.next_delay(interval, 2) >= interval);
        }
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = ExponentialBackoffPolicy {
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.2,
        };
        for _ in 0..200 {
            let d = p.next_delay(Duration::from_secs(10), 1).as_millis();
            assert!((16_000..=24_000).contains(&d), "got {d}");
        }
    }

    #[test]
    fn config_selects_policy() {
        let mut cfg = BeaconConfig::new("https://x", "k");
        cfg.failure_backoff_ms = 120_000;
        let p = policy_for(&cfg);
        assert_eq!(p.next_delay(INTERVAL, 1), Duration::from_secs(120));

        cfg.retry_strategy = RetryStrategy::Exponential;
        let p = policy_for(&cfg);
        let d = p.next_delay(INTERVAL, 1);
        assert!(d >= Duration::from_secs(48) && d <= Duration::from_secs(72), "{d:?}");
    }
}
