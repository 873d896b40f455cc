//! Backoff Delay Policies
//!
//! A policy maps a 0-based retry index to the wait before that retry. The
//! first attempt of an operation always runs immediately; `delay(0)` is the
//! wait between the first and the second attempt. `None` means give up.
//!
//! ```text
//! DelaySequence [100ms, 200ms, 300ms]
//!   attempt 1 at t=0
//!   attempt 2 at t=100ms   delay(0)
//!   attempt 3 at t=300ms   delay(1)
//!   attempt 4 at t=600ms   delay(2)
//!   give up                delay(3) == None
//! ```

use std::fmt;
use std::time::Duration;

/// Maps a retry index to the wait before it
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    fn delay(&self, retry_index: u32) -> Option<Duration>;
}

/// Same delay forever
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffPolicy for FixedDelay {
    fn delay(&self, _retry_index: u32) -> Option<Duration> {
        Some(self.delay)
    }
}

/// One initial delay, then a fixed delay forever
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWithInitialDelay {
    initial: Duration,
    delay: Duration,
}

impl FixedWithInitialDelay {
    pub fn new(initial: Duration, delay: Duration) -> Self {
        Self { initial, delay }
    }
}

impl BackoffPolicy for FixedWithInitialDelay {
    fn delay(&self, retry_index: u32) -> Option<Duration> {
        if retry_index == 0 {
            Some(self.initial)
        } else {
            Some(self.delay)
        }
    }
}

/// Explicit finite list of delays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelaySequence {
    delays: Vec<Duration>,
}

impl DelaySequence {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(delays: &[u64]) -> Self {
        Self::new(delays.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }
}

impl BackoffPolicy for DelaySequence {
    fn delay(&self, retry_index: u32) -> Option<Duration> {
        self.delays.get(retry_index as usize).copied()
    }
}

/// `min(initial * multiplier^index, max)`, optionally bounded in retries
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_retries: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30), 2.0)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, retry_index: u32) -> Option<Duration> {
        if let Some(max_retries) = self.max_retries {
            if retry_index >= max_retries {
                return None;
            }
        }

        let exponent = retry_index.min(i32::MAX as u32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_never_exhausts() {
        let policy = FixedDelay::new(Duration::from_secs(5));
        assert_eq!(policy.delay(0), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay(10_000), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_fixed_with_initial_delay() {
        let policy =
            FixedWithInitialDelay::new(Duration::from_millis(10), Duration::from_millis(500));
        assert_eq!(policy.delay(0), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay(7), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_delay_sequence_exhausts() {
        let policy = DelaySequence::from_millis(&[100, 200, 300]);
        assert_eq!(policy.delay(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(300)));
        assert_eq!(policy.delay(3), None);
    }

    #[test]
    fn test_exponential_backoff_caps_and_limits() {
        let policy = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(1000),
            2.0,
        )
        .with_max_retries(6);

        assert_eq!(policy.delay(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay(3), Some(Duration::from_millis(800)));
        assert_eq!(policy.delay(4), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay(5), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay(6), None);
    }
}
