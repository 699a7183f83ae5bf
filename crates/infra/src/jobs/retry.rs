//! Back-off for queue transport failures.
//!
//! Job failures themselves are never retried in-process: a transient job error
//! leaves the message with the broker, which redelivers it after the visibility
//! timeout. This only paces the worker when the broker itself is unreachable.

use std::time::Duration;

/// Exponential back-off: `base * 2^(attempt - 1)`, capped at `max`, with a
/// deterministic jitter of up to `jitter * delay` either side.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::transport()
    }
}

impl Backoff {
    /// 500 ms doubling up to 30 s.
    pub fn transport() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }

    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, jitter: 0.1 }
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 waits nothing.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let max_ms = self.max.as_millis() as f64;
        let doublings = (attempt - 1).min(32) as i32;
        let raw_ms = (self.base.as_millis() as f64 * 2f64.powi(doublings)).min(max_ms);

        // Spread in [-1, 1), fixed per attempt so delays are reproducible.
        let spread = ((attempt.wrapping_mul(17) % 100) as f64 / 50.0) - 1.0;
        let ms = (raw_ms + raw_ms * self.jitter * spread).clamp(0.0, max_ms);

        Duration::from_millis(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_base_without_jitter() {
        let backoff = Backoff {
            jitter: 0.0,
            ..Backoff::new(Duration::from_millis(100), Duration::from_secs(10))
        };

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(20), Duration::from_secs(10));
    }

    #[test]
    fn transport_backoff_grows_and_caps_at_thirty_seconds() {
        let backoff = Backoff::transport();

        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert!(backoff.delay(1) <= Duration::from_millis(550));
        assert!(backoff.delay(1) < backoff.delay(2));
        assert!(backoff.delay(2) < backoff.delay(3));
        assert_eq!(backoff.delay(50), Duration::from_secs(30));
        assert!(backoff.delay(u32::MAX) <= Duration::from_secs(30));
    }

    #[test]
    fn jitter_is_reproducible() {
        let backoff = Backoff::transport();
        assert_eq!(backoff.delay(4), backoff.delay(4));
    }
}
