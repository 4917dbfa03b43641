use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RetryError;
use crate::logic::MarshalledLogic;
use crate::message::{RetryMessage, ACKNOWLEDGMENT_KEY};

/// `total_retries` value meaning the entry never expires.
pub const UNLIMITED_RETRIES: i32 = -1;

/// How completion of the wrapped logic is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acknowledgment {
    /// A successful run of the logic is itself the confirmation.
    Synchronous,
    /// Confirmation arrives later, keyed by correlation id.
    Asynchronous { auto_retry_on_fail: bool },
}

impl Acknowledgment {
    /// Read the discipline recorded on a persisted message. Messages without
    /// a recorded discipline are treated as synchronous.
    pub fn of(message: &RetryMessage) -> Self {
        match message.metadata(ACKNOWLEDGMENT_KEY) {
            None => Acknowledgment::Synchronous,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    message_id = %message.id,
                    value = raw,
                    "unknown acknowledgment discipline, treating as synchronous"
                );
                Acknowledgment::Synchronous
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Acknowledgment::Synchronous => "sync",
            Acknowledgment::Asynchronous {
                auto_retry_on_fail: true,
            } => "async",
            Acknowledgment::Asynchronous {
                auto_retry_on_fail: false,
            } => "async-no-retry",
        }
    }
}

impl fmt::Display for Acknowledgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Acknowledgment {
    type Err = RetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Acknowledgment::Synchronous),
            "async" => Ok(Acknowledgment::Asynchronous {
                auto_retry_on_fail: true,
            }),
            "async-no-retry" => Ok(Acknowledgment::Asynchronous {
                auto_retry_on_fail: false,
            }),
            other => Err(RetryError::validation(format!(
                "unknown acknowledgment discipline '{other}'"
            ))),
        }
    }
}

/// One persisted unit of work awaiting acknowledgment or retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEntry {
    /// Primary key. Always equal to `message.id`.
    pub message_id: String,
    /// Correlation key echoed back by asynchronous confirmations.
    pub acknowledge_id: String,
    pub message: RetryMessage,
    pub logic: MarshalledLogic,
    /// Minimum spacing between replay attempts, in milliseconds.
    pub retry_interval_ms: i64,
    /// Retry budget. [`UNLIMITED_RETRIES`] disables expiry.
    pub total_retries: i32,
    pub retries_to_date: i32,
    pub acknowledged: bool,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryEntry {
    /// Build a fresh, unacknowledged entry. The correlation id defaults to the message id.
    pub fn new(
        message: RetryMessage,
        logic: MarshalledLogic,
        acknowledge_id: Option<String>,
        retry_interval_ms: i64,
        total_retries: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: message.id.clone(),
            acknowledge_id: acknowledge_id.unwrap_or_else(|| message.id.clone()),
            message,
            logic,
            retry_interval_ms,
            total_retries,
            retries_to_date: 0,
            acknowledged: false,
            inserted_at: now,
            updated_at: now,
        }
    }

    pub fn acknowledgment(&self) -> Acknowledgment {
        Acknowledgment::of(&self.message)
    }

    /// Check the fields every store requires before anything is persisted.
    pub fn validate(&self) -> Result<(), RetryError> {
        if self.message_id.is_empty() {
            return Err(RetryError::validation("message id must not be empty"));
        }
        if self.message_id != self.message.id {
            return Err(RetryError::validation(format!(
                "message id {} does not match the encoded message {}",
                self.message_id, self.message.id
            )));
        }
        if self.acknowledge_id.is_empty() {
            return Err(RetryError::validation("acknowledge id must not be empty"));
        }
        if self.retry_interval_ms < 0 {
            return Err(RetryError::validation(format!(
                "retry interval must be >= 0, got {}",
                self.retry_interval_ms
            )));
        }
        if self.total_retries < UNLIMITED_RETRIES {
            return Err(RetryError::validation(format!(
                "total retries must be >= -1, got {}",
                self.total_retries
            )));
        }
        if self.logic.type_name.is_empty() {
            return Err(RetryError::validation(
                "marshalled logic must record its type name",
            ));
        }
        if self.logic.body.is_empty() {
            return Err(RetryError::validation("marshalled logic must not be empty"));
        }
        Ok(())
    }
}
