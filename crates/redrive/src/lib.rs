//! Durable retry outbox.
//!
//! [`StoreForRetry`](decorator::StoreForRetry) wraps a unit of business logic
//! and persists a [`RetryEntry`](entry::RetryEntry) whenever the work is not
//! known to be complete. [`RetryDriver`](driver::RetryDriver) replays eligible
//! entries until they are acknowledged or their retry budget runs out, and
//! [`AcknowledgeHandler`](acknowledge::AcknowledgeHandler) applies
//! out-of-band confirmations.

pub mod acknowledge;
pub mod config;
pub mod coordinator;
pub mod dead_letter;
pub mod decorator;
pub mod driver;
pub mod entry;
pub mod error;
pub mod logic;
pub mod message;
pub mod metrics;
pub mod retry_store;
pub mod storage;
pub mod testing;
