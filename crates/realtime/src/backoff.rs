//! Reconnection policy.

use std::time::Duration;

/// Bounded exponential backoff: `delay(n) = min(2^n * base, max)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnects allowed after the initial attempt before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    /// Whether another reconnect may be scheduled after `attempt` reconnects.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before reconnect number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_from_one_second() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..5)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 100,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        };
        assert_eq!(policy.delay_for(4), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for(80), Duration::from_millis(10_000));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = ReconnectPolicy::default();
        assert!(policy.allows(0));
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }
}
