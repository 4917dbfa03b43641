pub mod dialect;
pub mod memory_retry;

#[cfg(feature = "sql")]
pub mod sql_retry;
