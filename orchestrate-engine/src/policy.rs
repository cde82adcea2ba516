use chrono::Duration;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 30;
pub const DEFAULT_BACKOFF_CAP_SECS: u64 = 600;
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 3600;
/// Upper bound for any delay or timeout: 30 days.
pub const MAX_DELAY_SECS: u64 = 30 * 24 * 3600;

/// Retry and timeout policy applied to every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Dispatch attempts per stage, the first one included.
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// How long a dispatched stage may stay unanswered before the watchdog fails it.
    pub stage_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_cap_secs: DEFAULT_BACKOFF_CAP_SECS,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
        }
    }
}

impl RetryPolicy {
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before re-dispatching after `attempt` failed: `base * 2^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let secs = self
            .backoff_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_secs);
        bounded_seconds(secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        bounded_seconds(self.stage_timeout_secs)
    }
}

fn bounded_seconds(secs: u64) -> Duration {
    let secs = i64::try_from(secs.min(MAX_DELAY_SECS)).unwrap_or(i64::MAX);
    Duration::try_seconds(secs).unwrap_or(Duration::MAX)
}
