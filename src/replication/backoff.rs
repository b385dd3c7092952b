//! Capped exponential backoff with jitter

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay before the next retry, without jitter
    pub fn base_delay(&self) -> Duration {
        let factor = self.config.multiplier.max(1.0).powi(self.attempt.min(64) as i32);
        let ms = (self.config.initial_ms as f64 * factor).min(self.config.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay to wait now; each call counts as one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay().as_millis() as f64;
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        let ms = (base * factor).min(self.config.max_ms as f64).max(0.0);
        Duration::from_millis(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = Backoff::new(no_jitter());
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.attempts(), 6);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut config = no_jitter();
        config.jitter = 0.5;
        for _ in 0..100 {
            let mut backoff = Backoff::new(config.clone());
            let ms = backoff.next_delay().as_millis() as u64;
            assert!((50..=150).contains(&ms), "delay {} out of range", ms);
        }
    }

    #[test]
    fn test_many_failures_do_not_overflow() {
        let mut backoff = Backoff::new(no_jitter());
        for _ in 0..200 {
            assert!(backoff.next_delay() <= Duration::from_millis(1_000));
        }
    }
}
