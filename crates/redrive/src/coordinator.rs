//! Eligibility rules and state transitions for retry entries.
//!
//! ```text
//! unacknowledged ──replay ok, sync──────────────▶ acknowledged (terminal)
//!       │  ▲
//!       │  └──replay failed / async attempt──── retries_to_date + 1
//!       │
//!       └──retries_to_date >= total (finite)──▶ expired (terminal, swept)
//! ```

use chrono::{DateTime, Utc};

use crate::entry::{Acknowledgment, RetryEntry, UNLIMITED_RETRIES};
use crate::error::RetryError;
use crate::retry_store::RetryStore;

/// What the driver does with an entry after one replay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayVerdict {
    /// Mark the entry acknowledged; it will never be replayed again.
    Acknowledge,
    /// Count the attempt and leave the entry queued.
    Reschedule,
    /// Return the replay failure to the driver's caller untouched.
    Propagate,
}

/// Stateless retry rules shared by every store and the driver.
pub struct RetryCoordinator;

impl RetryCoordinator {
    /// Whether the budget still allows another attempt.
    pub fn within_budget(entry: &RetryEntry) -> bool {
        entry.total_retries == UNLIMITED_RETRIES || entry.retries_to_date < entry.total_retries
    }

    /// Unacknowledged, within budget, and at least `retry_interval_ms` since the last update.
    pub fn is_eligible(entry: &RetryEntry, now: DateTime<Utc>) -> bool {
        if entry.acknowledged || !Self::within_budget(entry) {
            return false;
        }
        chrono::Duration::try_milliseconds(entry.retry_interval_ms)
            .and_then(|interval| entry.updated_at.checked_add_signed(interval))
            .is_some_and(|due| due <= now)
    }

    /// Unacknowledged with a finite budget that has been used up.
    pub fn is_expired(entry: &RetryEntry) -> bool {
        !entry.acknowledged
            && entry.total_retries != UNLIMITED_RETRIES
            && entry.retries_to_date >= entry.total_retries
    }

    /// Decide the transition for one replay outcome.
    ///
    /// Only failed replays count against a synchronous entry. An asynchronous
    /// entry is always counted, since success merely means it is still waiting
    /// for its out-of-band confirmation; a failure without auto-retry goes back
    /// to the caller instead.
    pub fn verdict(acknowledgment: Acknowledgment, succeeded: bool) -> ReplayVerdict {
        match (acknowledgment, succeeded) {
            (Acknowledgment::Synchronous, true) => ReplayVerdict::Acknowledge,
            (Acknowledgment::Synchronous, false) => ReplayVerdict::Reschedule,
            (Acknowledgment::Asynchronous { .. }, true) => ReplayVerdict::Reschedule,
            (
                Acknowledgment::Asynchronous {
                    auto_retry_on_fail: true,
                },
                false,
            ) => ReplayVerdict::Reschedule,
            (
                Acknowledgment::Asynchronous {
                    auto_retry_on_fail: false,
                },
                false,
            ) => ReplayVerdict::Propagate,
        }
    }

    /// Apply the verdict for `outcome` to the store.
    ///
    /// Returns the verdict that was applied, or the replay error itself when
    /// the verdict is [`ReplayVerdict::Propagate`].
    pub async fn settle(
        store: &dyn RetryStore,
        entry: &RetryEntry,
        outcome: Result<(), RetryError>,
    ) -> Result<ReplayVerdict, RetryError> {
        let verdict = Self::verdict(entry.acknowledgment(), outcome.is_ok());
        match verdict {
            ReplayVerdict::Acknowledge => {
                store.acknowledge(&entry.acknowledge_id).await?;
            }
            ReplayVerdict::Reschedule => {
                store.update_retry_count(&entry.message_id).await?;
            }
            ReplayVerdict::Propagate => {
                outcome?;
            }
        }
        Ok(verdict)
    }
}
