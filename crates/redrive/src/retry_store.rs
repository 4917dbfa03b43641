use async_trait::async_trait;

use crate::entry::RetryEntry;
use crate::error::RetryError;

/// Durable persistence for retry entries.
///
/// Every operation is a single round trip to the backend. Backend failures
/// surface as [`RetryError::Store`] and are never retried inside the store;
/// retrying is the driver's job.
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Insert a new entry. Fails with `Validation` before touching the backend
    /// if required fields are missing, and with `DuplicateKey` if the message
    /// id or acknowledge id is already stored.
    async fn write(&self, entry: &RetryEntry) -> Result<(), RetryError>;

    /// Mark the entry with this correlation id acknowledged. Unknown or
    /// already-acknowledged ids are not an error. Returns whether a row changed.
    async fn acknowledge(&self, acknowledge_id: &str) -> Result<bool, RetryError>;

    /// Increment `retries_to_date` and touch `updated_at`.
    async fn update_retry_count(&self, message_id: &str) -> Result<(), RetryError>;

    /// Remove an entry. Returns whether a row was removed.
    async fn delete(&self, message_id: &str) -> Result<bool, RetryError>;

    /// Remove every acknowledged entry. Returns the number removed.
    async fn delete_acknowledged(&self) -> Result<u64, RetryError>;

    /// Fetch a single entry by message id.
    async fn get(&self, message_id: &str) -> Result<Option<RetryEntry>, RetryError>;

    /// Entries that are unacknowledged, within budget, and whose interval has elapsed.
    async fn obtain_messages_to_retry(&self) -> Result<Vec<RetryEntry>, RetryError>;

    /// Entries that are unacknowledged and have exhausted a finite budget.
    async fn obtain_expired_messages(&self) -> Result<Vec<RetryEntry>, RetryError>;

    /// Create the backing schema if needed. Best effort: failures are logged,
    /// never returned, so this is safe to call on every startup.
    async fn ensure_schema(&self) {}
}
