/// Errors that can occur in the retry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// A write was rejected before anything was persisted.
    #[error("invalid retry entry: {reason}")]
    Validation { reason: String },

    #[error("duplicate key: {key}")]
    DuplicateKey { key: String },

    #[error("store error: {reason}")]
    Store {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Business logic failed while being applied to a message.
    #[error("replay failed: {reason}")]
    Replay {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("marshalling error: {reason}")]
    Marshalling {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("no logic registered for type {type_name}")]
    UnknownLogicType { type_name: String },

    #[error("dead-letter delivery failed: {reason}")]
    DeadLetter {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl RetryError {
    /// Shorthand for a business-logic failure without an underlying cause.
    pub fn replay(reason: impl Into<String>) -> Self {
        RetryError::Replay {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        RetryError::Validation {
            reason: reason.into(),
        }
    }

    /// Wrap a backend failure with a short description of the operation.
    pub fn store<E>(operation: &str, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RetryError::Store {
            reason: format!("{operation} failed: {err}"),
            source: Some(Box::new(err)),
        }
    }

    pub fn marshalling<E>(what: &str, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RetryError::Marshalling {
            reason: format!("{what}: {err}"),
            source: Some(Box::new(err)),
        }
    }
}
