use std::time::Duration;

use serde::Deserialize;

use crate::entry::{Acknowledgment, UNLIMITED_RETRIES};
use crate::error::RetryError;

/// Configuration for [`RetryDriver`](crate::driver::RetryDriver).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriverConfig {
    /// Delete acknowledged entries at the start of every cycle. Default: true.
    pub prune_acknowledged: bool,
    /// Hand expired entries to the dead-letter sink and delete them. Default: false.
    pub prune_expired: bool,
    /// Upper bound on a single replay attempt. A replay that runs longer is
    /// treated as failed. Default: none (a stuck replay blocks the cycle).
    #[serde(with = "optional_millis")]
    pub replay_timeout: Option<Duration>,
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), RetryError> {
        if matches!(self.replay_timeout, Some(t) if t.is_zero()) {
            return Err(RetryError::InvalidConfig {
                reason: "replay_timeout must be > 0 when set".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            prune_acknowledged: true,
            prune_expired: false,
            replay_timeout: None,
        }
    }
}

/// Configuration for [`StoreForRetry`](crate::decorator::StoreForRetry).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DecoratorConfig {
    /// Wait for an out-of-band confirmation instead of trusting the logic's
    /// own result. Default: false.
    pub asynchronous_acknowledgment: bool,
    /// Asynchronous mode only: queue before running the logic so failures are
    /// retried. When false, failures propagate and nothing is queued. Default: true.
    pub async_auto_retry_on_fail: bool,
    /// Replay spacing when the message does not override it. Default: 10 minutes.
    #[serde(with = "millis")]
    pub default_retry_interval: Duration,
    /// Retry budget when the message does not override it. `-1` = unlimited. Default: 10.
    pub default_total_retries: i32,
}

impl DecoratorConfig {
    pub fn acknowledgment(&self) -> Acknowledgment {
        if self.asynchronous_acknowledgment {
            Acknowledgment::Asynchronous {
                auto_retry_on_fail: self.async_auto_retry_on_fail,
            }
        } else {
            Acknowledgment::Synchronous
        }
    }

    pub fn validate(&self) -> Result<(), RetryError> {
        if self.default_total_retries < UNLIMITED_RETRIES {
            return Err(RetryError::InvalidConfig {
                reason: format!(
                    "default_total_retries must be >= -1, got {}",
                    self.default_total_retries
                ),
            });
        }
        if i64::try_from(self.default_retry_interval.as_millis()).is_err() {
            return Err(RetryError::InvalidConfig {
                reason: "default_retry_interval does not fit in milliseconds".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for DecoratorConfig {
    fn default() -> Self {
        Self {
            asynchronous_acknowledgment: false,
            async_auto_retry_on_fail: true,
            default_retry_interval: Duration::from_secs(600),
            default_total_retries: 10,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
