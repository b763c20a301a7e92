//! Reconnect delays for the settlement subscriptions.

use std::time::Duration;

pub const BACKOFF_BASE: Duration = Duration::from_secs(5);
pub const BACKOFF_CEILING: Duration = Duration::from_secs(600);

/// Failure count at which the delay is halfway between base and ceiling.
const MIDPOINT: i32 = 10;

/// Sigmoid delay after `failures` consecutive failures.
///
/// `5 + 595 * 2^(n-10) / (2^(n-10) + 1)` seconds: about 7s at 2 failures,
/// 300s at 10, flattening out at 600s. Zero failures waits exactly the base.
pub fn backoff(failures: u32) -> Duration {
    if failures == 0 {
        return BACKOFF_BASE;
    }
    let base = BACKOFF_BASE.as_secs_f64();
    let span = BACKOFF_CEILING.as_secs_f64() - base;
    // 2^(n-10) / (2^(n-10) + 1) rewritten so large n cannot overflow.
    let n = i32::try_from(failures).unwrap_or(i32::MAX).min(2048);
    let ratio = 1.0 / (1.0 + 2f64.powi(MIDPOINT - n));
    Duration::from_secs_f64((base + span * ratio).min(BACKOFF_CEILING.as_secs_f64()))
}

/// Consecutive-failure counter driving [`backoff`].
#[derive(Debug, Default)]
pub struct Backoff {
    failures: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay for the current count, then count one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = backoff(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: Duration, expected_secs: f64) {
        let actual = actual.as_secs_f64();
        assert!(
            (actual - expected_secs).abs() <= expected_secs * 0.05,
            "{} not within 5% of {}",
            actual,
            expected_secs
        );
    }

    #[test]
    fn test_backoff_table() {
        assert_eq!(backoff(0), BACKOFF_BASE);
        assert_close(backoff(2), 7.0);
        assert_close(backoff(5), 23.0);
        assert_close(backoff(10), 300.0);
        assert_close(backoff(100), 600.0);
        assert_close(backoff(1000), 600.0);
        assert_eq!(backoff(u32::MAX), BACKOFF_CEILING);
    }

    #[test]
    fn test_counter() {
        let mut b = Backoff::new();
        assert_eq!(b.next_delay(), BACKOFF_BASE);
        assert_eq!(b.failures(), 1);
        b.next_delay();
        b.next_delay();
        assert!(backoff(b.failures()) > BACKOFF_BASE);
        b.reset();
        assert_eq!(b.next_delay(), BACKOFF_BASE);
    }
}
