//! SQL-backed retry store using sqlx's `Any` driver.
//!
//! One table, `retry_store`, one row per entry. The SQL comes from a
//! [`SqlDialect`], so the same store runs against PostgreSQL, SQLite, or any
//! database sqlx can reach once its statements are supplied.
//!
//! This module is only available when the `sql` feature is enabled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::AnyPool;
use sqlx::Row;

use crate::entry::RetryEntry;
use crate::error::RetryError;
use crate::logic::MarshalledLogic;
use crate::message::RetryMessage;
use crate::retry_store::RetryStore;
use crate::storage::dialect::SqlDialect;

const ACKNOWLEDGED: &str = "T";
const UNACKNOWLEDGED: &str = "F";

/// Retry store persisting entries through a sqlx connection pool.
pub struct SqlRetryStore {
    pool: AnyPool,
    dialect: SqlDialect,
}

impl SqlRetryStore {
    /// Create a store over an existing pool.
    pub fn new(pool: AnyPool, dialect: SqlDialect) -> Self {
        Self { pool, dialect }
    }

    /// Connect to `url` with a single pooled connection. Every store operation
    /// runs on that connection, one at a time.
    pub async fn connect(url: &str, dialect: SqlDialect) -> Result<Self, RetryError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await
            .map_err(|e| RetryError::store("connect", e))?;
        Ok(Self::new(pool, dialect))
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> &SqlDialect {
        &self.dialect
    }

    async fn fetch_entries(
        &self,
        sql: &str,
        now_ms: Option<i64>,
        operation: &str,
    ) -> Result<Vec<RetryEntry>, RetryError> {
        let mut query = sqlx::query(sql);
        if let Some(now_ms) = now_ms {
            query = query.bind(now_ms);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RetryError::store(operation, e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match row_to_entry(&row) {
                Ok(entry) => entries.push(entry),
                Err(RowDecodeError::Malformed { message_id, source }) => {
                    tracing::warn!(
                        message_id = %message_id,
                        error = %source,
                        "skipping retry entry that cannot be decoded"
                    );
                }
                Err(RowDecodeError::Fatal(err)) => return Err(err),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl RetryStore for SqlRetryStore {
    async fn write(&self, entry: &RetryEntry) -> Result<(), RetryError> {
        entry.validate()?;
        let message = entry.message.encode()?;
        let logic = entry.logic.to_bytes()?;
        let now_ms = Utc::now().timestamp_millis();

        sqlx::query(&self.dialect.insert)
            .bind(entry.message_id.as_str())
            .bind(entry.acknowledge_id.as_str())
            .bind(message)
            .bind(entry.retry_interval_ms)
            .bind(i64::from(entry.total_retries))
            .bind(0_i64)
            .bind(logic)
            .bind(UNACKNOWLEDGED)
            .bind(now_ms)
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, entry))?;

        Ok(())
    }

    async fn acknowledge(&self, acknowledge_id: &str) -> Result<bool, RetryError> {
        let result = sqlx::query(&self.dialect.acknowledge)
            .bind(Utc::now().timestamp_millis())
            .bind(acknowledge_id)
            .execute(&self.pool)
            .await
            .map_err(|e| RetryError::store("acknowledge", e))?;

        if result.rows_affected() == 0 {
            tracing::debug!(acknowledge_id, "acknowledge matched no pending entry");
        }
        Ok(result.rows_affected() > 0)
    }

    async fn update_retry_count(&self, message_id: &str) -> Result<(), RetryError> {
        sqlx::query(&self.dialect.update_retry)
            .bind(Utc::now().timestamp_millis())
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| RetryError::store("update retry count", e))?;
        Ok(())
    }

    async fn delete(&self, message_id: &str) -> Result<bool, RetryError> {
        let result = sqlx::query(&self.dialect.delete)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| RetryError::store("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_acknowledged(&self) -> Result<u64, RetryError> {
        let result = sqlx::query(&self.dialect.delete_acknowledged)
            .execute(&self.pool)
            .await
            .map_err(|e| RetryError::store("delete acknowledged", e))?;
        Ok(result.rows_affected())
    }

    async fn get(&self, message_id: &str) -> Result<Option<RetryEntry>, RetryError> {
        let row = sqlx::query(&self.dialect.select_one)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RetryError::store("select entry", e))?;

        match row {
            Some(row) => match row_to_entry(&row) {
                Ok(entry) => Ok(Some(entry)),
                Err(RowDecodeError::Malformed { source, .. }) => Err(source),
                Err(RowDecodeError::Fatal(err)) => Err(err),
            },
            None => Ok(None),
        }
    }

    async fn obtain_messages_to_retry(&self) -> Result<Vec<RetryEntry>, RetryError> {
        let now_ms = Utc::now().timestamp_millis();
        self.fetch_entries(&self.dialect.select, Some(now_ms), "select entries to retry")
            .await
    }

    async fn obtain_expired_messages(&self) -> Result<Vec<RetryEntry>, RetryError> {
        self.fetch_entries(&self.dialect.select_expired, None, "select expired entries")
            .await
    }

    async fn ensure_schema(&self) {
        if let Err(e) = sqlx::query(&self.dialect.create).execute(&self.pool).await {
            tracing::warn!(error = %e, "failed to create retry_store table");
        }
    }
}

fn insert_error(err: sqlx::Error, entry: &RetryEntry) -> RetryError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            let on_acknowledge_id = db
                .constraint()
                .unwrap_or_else(|| db.message())
                .contains("acknowledge_id");
            let key = if on_acknowledge_id {
                entry.acknowledge_id.clone()
            } else {
                entry.message_id.clone()
            };
            return RetryError::DuplicateKey { key };
        }
    }
    RetryError::store("insert retry entry", err)
}

enum RowDecodeError {
    /// The row is readable but its blobs or counters are not.
    Malformed {
        message_id: String,
        source: RetryError,
    },
    Fatal(RetryError),
}

fn try_get_column<'r, T>(row: &'r AnyRow, column: &str) -> Result<T, RetryError>
where
    T: sqlx::Decode<'r, sqlx::Any> + sqlx::Type<sqlx::Any>,
{
    row.try_get(column).map_err(|e| RetryError::Store {
        reason: format!("failed to read '{column}' column: {e}"),
        source: Some(Box::new(e)),
    })
}

fn millis_to_datetime(ms: Option<i64>) -> DateTime<Utc> {
    ms.and_then(DateTime::from_timestamp_millis)
        .unwrap_or_default()
}

fn row_to_entry(row: &AnyRow) -> Result<RetryEntry, RowDecodeError> {
    let message_id: String = try_get_column(row, "message_id").map_err(RowDecodeError::Fatal)?;
    let acknowledge_id: String =
        try_get_column(row, "acknowledge_id").map_err(RowDecodeError::Fatal)?;
    let message: Vec<u8> = try_get_column(row, "message").map_err(RowDecodeError::Fatal)?;
    let retry_interval_ms: i64 =
        try_get_column(row, "retry_interval").map_err(RowDecodeError::Fatal)?;
    let total_retries: i64 = try_get_column(row, "total_retries").map_err(RowDecodeError::Fatal)?;
    let retries_to_date: i64 =
        try_get_column(row, "retries_to_date").map_err(RowDecodeError::Fatal)?;
    let logic: Vec<u8> = try_get_column(row, "marshalled_logic").map_err(RowDecodeError::Fatal)?;
    let acknowledged: String =
        try_get_column(row, "acknowledged").map_err(RowDecodeError::Fatal)?;
    let inserted_on: Option<i64> =
        try_get_column(row, "inserted_on").map_err(RowDecodeError::Fatal)?;
    let updated_on: Option<i64> =
        try_get_column(row, "updated_on").map_err(RowDecodeError::Fatal)?;

    let malformed = |source: RetryError| RowDecodeError::Malformed {
        message_id: message_id.clone(),
        source,
    };
    let message = RetryMessage::decode(&message).map_err(malformed)?;
    let logic = MarshalledLogic::from_bytes(&logic).map_err(malformed)?;
    let total_retries = i32::try_from(total_retries).map_err(|_| {
        malformed(RetryError::validation(format!(
            "total_retries {total_retries} out of range"
        )))
    })?;
    let retries_to_date = i32::try_from(retries_to_date).map_err(|_| {
        malformed(RetryError::validation(format!(
            "retries_to_date {retries_to_date} out of range"
        )))
    })?;

    Ok(RetryEntry {
        message_id,
        acknowledge_id,
        message,
        logic,
        retry_interval_ms,
        total_retries,
        retries_to_date,
        acknowledged: acknowledged.trim() == ACKNOWLEDGED,
        inserted_at: millis_to_datetime(inserted_on),
        updated_at: millis_to_datetime(updated_on),
    })
}
