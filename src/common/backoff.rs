//! Retry delays and jittered periods.

use crate::api::client_config::ClientConfig;
use std::time::Duration;

/// Exponential backoff: `base × 2^attempt`, capped at `max`, then spread by
/// `± jitter_fraction`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    jitter_fraction: f64,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration, jitter_fraction: f64) -> Self {
        Backoff {
            base,
            max,
            jitter_fraction: jitter_fraction.clamp(0.0, 1.0),
        }
    }

    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        Backoff::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_fraction,
        )
    }

    /// Delay before retry number `attempt` (0 for the first retry), without jitter.
    pub(crate) fn raw_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        self.jitter(self.raw_delay(attempt))
    }

    /// Spread `period` uniformly over `period × (1 ± jitter_fraction)`.
    pub(crate) fn jitter(&self, period: Duration) -> Duration {
        if self.jitter_fraction == 0.0 {
            return period;
        }
        let spread = period.as_secs_f64() * self.jitter_fraction;
        let offset = (fastrand::f64() * 2.0 - 1.0) * spread;
        Duration::from_secs_f64((period.as_secs_f64() + offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_delay_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 0.0);
        assert_eq!(backoff.raw_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.raw_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.raw_delay(3), Duration::from_millis(800));
        assert_eq!(backoff.raw_delay(4), Duration::from_secs(1));
        assert_eq!(backoff.raw_delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), 0.2);
        for _ in 0..200 {
            let d = backoff.jitter(Duration::from_secs(1));
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200), "{:?}", d);
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(10), 0.0);
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
    }
}
