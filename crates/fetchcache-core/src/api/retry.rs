use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ApiError;

/// Initial backoff unit in milliseconds. The first retry waits `2^1` units.
pub const DEFAULT_BACKOFF_UNIT_MS: u64 = 500;

/// Upper bound on a single backoff wait.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Which failures are worth another attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Network errors and every non-2xx status.
    #[default]
    AllFailures,
    /// Network errors, 408, 429 and 5xx. Other statuses fail immediately.
    TransientOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_on: RetryOn,
    pub backoff_unit: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on: RetryOn::default(),
            backoff_unit: Duration::from_millis(DEFAULT_BACKOFF_UNIT_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, err: &ApiError) -> bool {
        match err {
            ApiError::Network(_) | ApiError::Http { .. } => match self.retry_on {
                RetryOn::AllFailures => true,
                RetryOn::TransientOnly => err.is_transient(),
            },
            _ => false,
        }
    }

    /// Wait before retry number `retry` (starting at 1): `unit * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.backoff_unit
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}
