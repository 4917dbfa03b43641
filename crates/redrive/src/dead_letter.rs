use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::RetryError;
use crate::message::RetryMessage;

/// Destination for messages whose retry budget ran out.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn deliver(&self, message: &RetryMessage) -> Result<(), RetryError>;
}

/// Records expired messages through `tracing` and drops them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDeadLetters;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetters {
    async fn deliver(&self, message: &RetryMessage) -> Result<(), RetryError> {
        tracing::warn!(
            message_id = %message.id,
            payload_len = message.payload.len(),
            "retry budget exhausted, dropping message"
        );
        Ok(())
    }
}

/// Collects expired messages in memory.
#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    messages: Mutex<Vec<RetryMessage>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<RetryMessage> {
        self.messages.lock().clone()
    }

    pub fn take(&self) -> Vec<RetryMessage> {
        std::mem::take(&mut *self.messages.lock())
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn deliver(&self, message: &RetryMessage) -> Result<(), RetryError> {
        self.messages.lock().push(message.clone());
        Ok(())
    }
}
