//! Step retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Substrings (lowercase) that mark a step failure as worth retrying.
pub const TRANSIENT_ERROR_INDICATORS: [&str; 9] = [
    "rate limit",
    "429",
    "timed out",
    "timeout",
    "temporarily unavailable",
    "connection reset",
    "502",
    "503",
    "504",
];

/// Case-insensitive match against [`TRANSIENT_ERROR_INDICATORS`].
pub fn is_transient_error(error_message: Option<&str>) -> bool {
    let Some(message) = error_message.filter(|m| !m.is_empty()) else {
        return false;
    };
    let lowered = message.to_lowercase();
    TRANSIENT_ERROR_INDICATORS.iter().any(|indicator| lowered.contains(indicator))
}

/// Exponential backoff between step attempts: `2^attempt` seconds after the
/// failed attempt `attempt` (1-based).
///
/// Uncapped unless `max_delay` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub max_delay: Option<Duration>,
}

impl BackoffPolicy {
    pub fn uncapped() -> Self {
        Self { max_delay: None }
    }

    pub fn capped(max_delay: Duration) -> Self {
        Self {
            max_delay: Some(max_delay),
        }
    }

    /// Delay to wait after `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let seconds = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = Duration::from_secs(seconds);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}
