//! Linear reconnection backoff for the push client.
//!
//! After the n-th consecutive failure the client waits `base * n` before
//! retrying. At most `max_attempts` retries are scheduled; the failure
//! after the last one ends reconnection. A successful open resets the
//! count.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay unit; the n-th retry waits `n * base_delay`.
    #[serde(with = "millis", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Consecutive failures that end reconnection.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

/// What to do after a failed or dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Reconnect after the delay.
    Retry(Duration),
    /// Stop reconnecting.
    GiveUp,
}

/// Consecutive-failure counter driven by a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectState {
    /// Start with no failures.
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// The connection opened.
    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    /// The connection failed or closed.
    ///
    /// Schedules up to `max_attempts` retries; the failure after the last
    /// one gives up.
    pub fn on_failure(&mut self) -> ReconnectDecision {
        if self.attempts >= self.policy.max_attempts {
            return ReconnectDecision::GiveUp;
        }
        self.attempts = self.attempts.saturating_add(1);
        ReconnectDecision::Retry(self.policy.base_delay.saturating_mul(self.attempts))
    }

    /// Consecutive failures so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
