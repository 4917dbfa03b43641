use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::RetryError;
use crate::message::{RetryMessage, ACKNOWLEDGE_ID_KEY};
use crate::metrics::RetryMetrics;
use crate::retry_store::RetryStore;

/// Applies out-of-band confirmations to queued entries.
///
/// A confirmation names an entry by its acknowledge id, read from a message
/// metadata key. Marking an entry acknowledged stops further replays; the
/// entry itself is removed by the driver's pruning.
pub struct AcknowledgeHandler {
    store: Arc<dyn RetryStore>,
    key: String,
    metrics: Arc<RetryMetrics>,
}

impl AcknowledgeHandler {
    pub fn new(store: Arc<dyn RetryStore>) -> Self {
        Self {
            store,
            key: ACKNOWLEDGE_ID_KEY.to_string(),
            metrics: Arc::new(RetryMetrics::unregistered()),
        }
    }

    /// Read the acknowledge id from `key` instead of [`ACKNOWLEDGE_ID_KEY`].
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RetryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Acknowledge the entry identified by `acknowledge_id`.
    ///
    /// A missing or empty id is logged and ignored. Returns whether an
    /// unacknowledged entry was found; unknown and already acknowledged ids
    /// are not errors.
    #[instrument(skip(self))]
    pub async fn handle(&self, acknowledge_id: Option<&str>) -> Result<bool, RetryError> {
        let Some(acknowledge_id) = acknowledge_id.filter(|id| !id.is_empty()) else {
            warn!(key = %self.key, "confirmation carried no acknowledge id, ignoring");
            return Ok(false);
        };

        let acknowledged = self.store.acknowledge(acknowledge_id).await?;
        if acknowledged {
            self.metrics.entries_acknowledged.inc();
            debug!("entry acknowledged");
        } else {
            debug!("no pending entry for acknowledge id");
        }
        Ok(acknowledged)
    }

    /// Acknowledge the entry named by the confirmation message's metadata.
    pub async fn handle_message(&self, confirmation: &RetryMessage) -> Result<bool, RetryError> {
        self.handle(confirmation.metadata(&self.key)).await
    }
}
