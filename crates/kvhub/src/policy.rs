//! Fixed resilience policy applied to every connection handle.

use std::time::Duration;

/// Delay added per reconnect attempt.
pub const RECONNECT_STEP: Duration = Duration::from_millis(100);

/// Upper bound on the delay between reconnect attempts.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Retries a queued request survives before it is rejected.
pub const MAX_RETRIES_PER_REQUEST: u32 = 3;

/// Reconnect, offline-queue and retry settings.
///
/// Connection options never carry these; the factory always applies
/// [`ResiliencePolicy::default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResiliencePolicy {
    /// Queue requests while disconnected instead of failing them.
    pub offline_queue: bool,
    /// Retries a single request gets before it is abandoned.
    pub max_retries_per_request: u32,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            offline_queue: true,
            max_retries_per_request: MAX_RETRIES_PER_REQUEST,
        }
    }
}

impl ResiliencePolicy {
    /// Delay before reconnect attempt number `attempt` (1-based).
    ///
    /// Grows linearly by 100ms and is capped at 5s. Attempts are unbounded.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        RECONNECT_STEP
            .checked_mul(attempt)
            .unwrap_or(MAX_RECONNECT_DELAY)
            .min(MAX_RECONNECT_DELAY)
    }

    /// Whether a request that has been retried `retries` times must be failed.
    pub fn retries_exhausted(&self, retries: u32) -> bool {
        retries > self.max_retries_per_request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_is_linear_and_capped_at_five_seconds() {
        let policy = ResiliencePolicy::default();
        assert_eq!(policy.reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(policy.reconnect_delay(2), Duration::from_millis(200));
        assert_eq!(policy.reconnect_delay(10), Duration::from_millis(1000));
        assert_eq!(policy.reconnect_delay(50), Duration::from_millis(5000));
        assert_eq!(policy.reconnect_delay(51), Duration::from_millis(5000));
        assert_eq!(policy.reconnect_delay(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn default_policy_queues_offline_and_allows_three_retries() {
        let policy = ResiliencePolicy::default();
        assert!(policy.offline_queue);
        assert!(!policy.retries_exhausted(3));
        assert!(policy.retries_exhausted(4));
    }
}
