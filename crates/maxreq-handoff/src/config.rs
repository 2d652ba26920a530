//! Handoff and drain configuration.

use std::time::Duration;

use crate::tracker::DrainPolicy;

/// Timeouts, threshold and retry policy for the handoff lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffConfig {
    /// Accepted connections before a handoff is triggered.
    pub max_requests: u64,
    /// How long to wait for the successor's readiness token.
    pub ready_timeout: Duration,
    /// Drain limit after handoff; `None` waits forever.
    pub drain_timeout: Option<Duration>,
    /// Failed attempts before giving up and exiting; 0 retries forever.
    pub max_handoff_attempts: u32,
    /// Delay after the first failed attempt, doubled after each further failure.
    pub retry_backoff: Duration,
    /// Upper bound for the retry delay.
    pub max_retry_backoff: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            ready_timeout: Duration::from_secs(30),
            drain_timeout: Some(Duration::from_secs(30)),
            max_handoff_attempts: 0,
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(60),
        }
    }
}

impl HandoffConfig {
    /// Load overrides from the environment, falling back to the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `MAXREQ_MAX_REQUESTS`: requests before handoff, at least 1 (default: 100)
    /// - `MAXREQ_READY_TIMEOUT_SECS`: readiness wait (default: 30)
    /// - `MAXREQ_DRAIN_TIMEOUT_SECS`: drain limit, 0 waits forever (default: 30)
    /// - `MAXREQ_MAX_HANDOFF_ATTEMPTS`: 0 retries forever (default: 0)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let defaults = Self::default();

        Self {
            max_requests: parse("MAXREQ_MAX_REQUESTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_requests),
            ready_timeout: parse("MAXREQ_READY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ready_timeout),
            drain_timeout: match parse("MAXREQ_DRAIN_TIMEOUT_SECS") {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.drain_timeout,
            },
            max_handoff_attempts: parse("MAXREQ_MAX_HANDOFF_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.max_handoff_attempts),
            ..defaults
        }
    }

    pub fn drain_policy(&self) -> DrainPolicy {
        DrainPolicy::from_timeout(self.drain_timeout)
    }

    /// Delay before retrying after `failures` consecutive failed attempts.
    pub fn retry_backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_retry_backoff)
    }
}
