use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::coordinator::RetryCoordinator;
use crate::entry::RetryEntry;
use crate::error::RetryError;
use crate::retry_store::RetryStore;

/// In-memory retry store for tests and embedding.
///
/// Follows the same contract as the SQL store, including duplicate-key and
/// validation failures, but keeps nothing across restarts.
#[derive(Default)]
pub struct MemoryRetryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Entries keyed by message id.
    entries: HashMap<String, RetryEntry>,
    /// Correlation id to message id.
    by_acknowledge_id: HashMap<String, String>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, acknowledged or not.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored entry.
    pub fn entries(&self) -> Vec<RetryEntry> {
        self.inner.lock().entries.values().cloned().collect()
    }
}

impl Inner {
    fn remove(&mut self, message_id: &str) -> bool {
        match self.entries.remove(message_id) {
            Some(entry) => {
                self.by_acknowledge_id.remove(&entry.acknowledge_id);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl RetryStore for MemoryRetryStore {
    async fn write(&self, entry: &RetryEntry) -> Result<(), RetryError> {
        entry.validate()?;
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&entry.message_id) {
            return Err(RetryError::DuplicateKey {
                key: entry.message_id.clone(),
            });
        }
        if inner.by_acknowledge_id.contains_key(&entry.acknowledge_id) {
            return Err(RetryError::DuplicateKey {
                key: entry.acknowledge_id.clone(),
            });
        }

        let now = Utc::now();
        let mut stored = entry.clone();
        stored.retries_to_date = 0;
        stored.acknowledged = false;
        stored.inserted_at = now;
        stored.updated_at = now;
        inner
            .by_acknowledge_id
            .insert(stored.acknowledge_id.clone(), stored.message_id.clone());
        inner.entries.insert(stored.message_id.clone(), stored);
        Ok(())
    }

    async fn acknowledge(&self, acknowledge_id: &str) -> Result<bool, RetryError> {
        let mut inner = self.inner.lock();
        let Some(message_id) = inner.by_acknowledge_id.get(acknowledge_id).cloned() else {
            return Ok(false);
        };
        match inner.entries.get_mut(&message_id) {
            Some(entry) if !entry.acknowledged => {
                entry.acknowledged = true;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_retry_count(&self, message_id: &str) -> Result<(), RetryError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(message_id) {
            if !entry.acknowledged {
                entry.retries_to_date = entry.retries_to_date.saturating_add(1);
                entry.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn delete(&self, message_id: &str) -> Result<bool, RetryError> {
        Ok(self.inner.lock().remove(message_id))
    }

    async fn delete_acknowledged(&self) -> Result<u64, RetryError> {
        let mut inner = self.inner.lock();
        let acknowledged: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.acknowledged)
            .map(|e| e.message_id.clone())
            .collect();
        for message_id in &acknowledged {
            inner.remove(message_id);
        }
        Ok(acknowledged.len() as u64)
    }

    async fn get(&self, message_id: &str) -> Result<Option<RetryEntry>, RetryError> {
        Ok(self.inner.lock().entries.get(message_id).cloned())
    }

    async fn obtain_messages_to_retry(&self) -> Result<Vec<RetryEntry>, RetryError> {
        let now = Utc::now();
        Ok(self
            .inner
            .lock()
            .entries
            .values()
            .filter(|e| RetryCoordinator::is_eligible(e, now))
            .cloned()
            .collect())
    }

    async fn obtain_expired_messages(&self) -> Result<Vec<RetryEntry>, RetryError> {
        Ok(self
            .inner
            .lock()
            .entries
            .values()
            .filter(|e| RetryCoordinator::is_expired(e))
            .cloned()
            .collect())
    }
}
