use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RetryError;

/// Metadata key carrying the correlation id an external acknowledgment echoes back.
pub const ACKNOWLEDGE_ID_KEY: &str = "retryAcknowledgeId";
/// Metadata key overriding the replay spacing, in milliseconds.
pub const RETRY_INTERVAL_KEY: &str = "retryInterval";
/// Metadata key overriding the retry budget. `-1` means unlimited.
pub const TOTAL_RETRIES_KEY: &str = "retryTotal";
/// Metadata key recording the acknowledgment discipline of a persisted message.
pub const ACKNOWLEDGMENT_KEY: &str = "retryAcknowledgment";

/// A unit of work flowing through business logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMessage {
    pub id: String,
    pub payload: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

impl RetryMessage {
    /// Create a message with a freshly generated id.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload)
    }

    pub fn with_id(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Read a numeric metadata value, failing on anything that does not parse.
    pub(crate) fn parsed_metadata<T>(&self, key: &str) -> Result<Option<T>, RetryError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.metadata(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                RetryError::validation(format!("metadata '{key}' has invalid value '{raw}': {e}"))
            }),
        }
    }

    /// Encode the whole message (id, payload and metadata) for persistence.
    pub fn encode(&self) -> Result<Vec<u8>, RetryError> {
        rmp_serde::to_vec(self).map_err(|e| RetryError::marshalling("failed to encode message", e))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RetryError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| RetryError::marshalling("failed to decode message", e))
    }
}
