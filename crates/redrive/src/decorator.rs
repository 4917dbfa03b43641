//! Wraps business logic so that unconfirmed work is persisted for replay.
//!
//! The acknowledgment discipline decides when an entry is written:
//!
//! | discipline                   | logic ok                  | logic fails |
//! |------------------------------|---------------------------|-------------|
//! | synchronous                  | nothing stored            | stored, error suppressed |
//! | asynchronous, auto-retry     | stored before the attempt | stored before the attempt, error suppressed |
//! | asynchronous, no auto-retry  | stored after the attempt  | nothing stored, error returned |
//!
//! Once an entry is durably queued the driver owns recovery: the caller's
//! error handling never sees the original failure.
//!
//! If queueing itself fails, the caller gets the store error (`Validation`,
//! `DuplicateKey` or `Store`) and the message is left without an acknowledge
//! id. The logic's own error is only logged, next to the store error.

use std::sync::Arc;

use tracing::instrument;

use crate::config::DecoratorConfig;
use crate::entry::{Acknowledgment, RetryEntry};
use crate::error::RetryError;
use crate::logic::{LogicRegistry, Replayable};
use crate::message::{
    RetryMessage, ACKNOWLEDGE_ID_KEY, ACKNOWLEDGMENT_KEY, RETRY_INTERVAL_KEY, TOTAL_RETRIES_KEY,
};
use crate::metrics::RetryMetrics;
use crate::retry_store::RetryStore;

/// Outcome of [`StoreForRetry::execute`] that the caller observes as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The logic succeeded and nothing was persisted.
    Completed,
    /// The logic failed; the message is queued for replay.
    Retrying { acknowledge_id: String },
    /// The message is queued until a confirmation arrives for `acknowledge_id`.
    AwaitingAcknowledgment { acknowledge_id: String },
}

/// Decorator persisting a replayable entry around one unit of business logic.
pub struct StoreForRetry<L> {
    logic: L,
    store: Arc<dyn RetryStore>,
    registry: Arc<LogicRegistry>,
    config: DecoratorConfig,
    metrics: Arc<RetryMetrics>,
}

impl<L: Replayable> StoreForRetry<L> {
    /// Fails if the configuration is invalid or `L` is not registered, since
    /// entries written for an unregistered type could never be replayed.
    pub fn new(
        logic: L,
        store: Arc<dyn RetryStore>,
        registry: Arc<LogicRegistry>,
        config: DecoratorConfig,
    ) -> Result<Self, RetryError> {
        config.validate()?;
        if !registry.contains(L::TYPE_NAME) {
            return Err(RetryError::InvalidConfig {
                reason: format!("logic type {} is not registered for replay", L::TYPE_NAME),
            });
        }
        Ok(Self {
            logic,
            store,
            registry,
            config,
            metrics: Arc::new(RetryMetrics::unregistered()),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<RetryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn logic(&self) -> &L {
        &self.logic
    }

    pub fn acknowledgment(&self) -> Acknowledgment {
        self.config.acknowledgment()
    }

    pub async fn init(&self) -> Result<(), RetryError> {
        self.logic.init().await
    }

    pub async fn start(&self) -> Result<(), RetryError> {
        self.logic.start().await
    }

    pub async fn stop(&self) -> Result<(), RetryError> {
        self.logic.stop().await
    }

    pub async fn close(&self) -> Result<(), RetryError> {
        self.logic.close().await
    }

    /// Run the wrapped logic against `message` under the configured discipline.
    ///
    /// The entry always captures the message as it was before the logic ran,
    /// so replays start from the same input. When an entry is written, the
    /// correlation id is also recorded on `message` under
    /// [`ACKNOWLEDGE_ID_KEY`].
    #[instrument(skip(self, message), fields(message_id = %message.id, logic = L::TYPE_NAME))]
    pub async fn execute(&self, message: &mut RetryMessage) -> Result<Disposition, RetryError> {
        let original = message.clone();
        match self.acknowledgment() {
            Acknowledgment::Synchronous => match self.logic.apply(message).await {
                Ok(()) => Ok(Disposition::Completed),
                Err(e) => {
                    tracing::warn!(error = %e, "logic failed, queueing message for retry");
                    let acknowledge_id = match self.persist(&original).await {
                        Ok(id) => id,
                        Err(persist_error) => {
                            tracing::error!(
                                logic_error = %e,
                                error = %persist_error,
                                "logic failed and the message could not be queued"
                            );
                            return Err(persist_error);
                        }
                    };
                    message.set_metadata(ACKNOWLEDGE_ID_KEY, acknowledge_id.clone());
                    Ok(Disposition::Retrying { acknowledge_id })
                }
            },
            Acknowledgment::Asynchronous {
                auto_retry_on_fail: true,
            } => {
                let acknowledge_id = self.persist(&original).await?;
                message.set_metadata(ACKNOWLEDGE_ID_KEY, acknowledge_id.clone());
                match self.logic.apply(message).await {
                    Ok(()) => Ok(Disposition::AwaitingAcknowledgment { acknowledge_id }),
                    Err(e) => {
                        tracing::warn!(error = %e, "logic failed, message already queued for retry");
                        Ok(Disposition::Retrying { acknowledge_id })
                    }
                }
            }
            Acknowledgment::Asynchronous {
                auto_retry_on_fail: false,
            } => {
                self.logic.apply(message).await?;
                let acknowledge_id = self.persist(&original).await?;
                message.set_metadata(ACKNOWLEDGE_ID_KEY, acknowledge_id.clone());
                Ok(Disposition::AwaitingAcknowledgment { acknowledge_id })
            }
        }
    }

    /// Build the entry that would be persisted for `message`.
    pub fn entry_for(&self, message: &RetryMessage) -> Result<RetryEntry, RetryError> {
        let acknowledge_id = message
            .metadata(ACKNOWLEDGE_ID_KEY)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let retry_interval_ms = match message.parsed_metadata::<i64>(RETRY_INTERVAL_KEY)? {
            Some(ms) => ms,
            // Fits: checked by DecoratorConfig::validate.
            None => self.config.default_retry_interval.as_millis() as i64,
        };
        let total_retries = message
            .parsed_metadata::<i32>(TOTAL_RETRIES_KEY)?
            .unwrap_or(self.config.default_total_retries);

        let mut stored = message.clone();
        stored.set_metadata(ACKNOWLEDGMENT_KEY, self.acknowledgment().to_string());

        Ok(RetryEntry::new(
            stored,
            self.registry.marshal(&self.logic)?,
            acknowledge_id,
            retry_interval_ms,
            total_retries,
        ))
    }

    async fn persist(&self, message: &RetryMessage) -> Result<String, RetryError> {
        let entry = self.entry_for(message)?;
        self.store.write(&entry).await?;
        self.metrics.entries_written.inc();
        tracing::debug!(
            acknowledge_id = %entry.acknowledge_id,
            retry_interval_ms = entry.retry_interval_ms,
            total_retries = entry.total_retries,
            "queued message for retry"
        );
        Ok(entry.acknowledge_id)
    }
}
