//! Named SQL statements used by [`SqlRetryStore`](super::sql_retry::SqlRetryStore).
//!
//! Porting the store to another database means supplying a different set of
//! statements, not changing code. Timestamps are epoch milliseconds and `now`
//! is always bound from the application clock, so the statements need no
//! vendor-specific date arithmetic. The interval is subtracted from the bound
//! clock rather than added to the stored timestamp, so no interval a row can
//! hold overflows a `BIGINT`.
//!
//! Bind parameters, in order:
//!
//! | statement             | parameters |
//! |-----------------------|------------|
//! | `create`              | none |
//! | `insert`              | message_id, acknowledge_id, message, retry_interval, total_retries, retries_to_date, marshalled_logic, acknowledged, inserted_on, updated_on |
//! | `select`              | now |
//! | `select_one`          | message_id |
//! | `select_expired`      | none |
//! | `acknowledge`         | now, acknowledge_id |
//! | `update_retry`        | now, message_id |
//! | `delete`              | message_id |
//! | `delete_acknowledged` | none |
//!
//! Every select returns the columns listed in [`SELECT_COLUMNS`].

use std::collections::HashMap;

use crate::error::RetryError;

/// Column list every select statement must return.
pub const SELECT_COLUMNS: &str = "message_id, acknowledge_id, message, retry_interval, \
     total_retries, retries_to_date, marshalled_logic, acknowledged, inserted_on, updated_on";

const STATEMENT_NAMES: [&str; 9] = [
    "create",
    "insert",
    "select",
    "select_one",
    "select_expired",
    "acknowledge",
    "update_retry",
    "delete",
    "delete_acknowledged",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlDialect {
    pub create: String,
    pub insert: String,
    pub select: String,
    pub select_one: String,
    pub select_expired: String,
    pub acknowledge: String,
    pub update_retry: String,
    pub delete: String,
    pub delete_acknowledged: String,
}

impl SqlDialect {
    pub fn postgres() -> Self {
        Self::with_create(
            "CREATE TABLE IF NOT EXISTS retry_store (
                message_id        VARCHAR(256) NOT NULL PRIMARY KEY,
                acknowledge_id    VARCHAR(256) NOT NULL UNIQUE,
                message           BYTEA NOT NULL,
                retry_interval    BIGINT NOT NULL,
                total_retries     BIGINT NOT NULL,
                retries_to_date   BIGINT NOT NULL,
                marshalled_logic  BYTEA NOT NULL,
                acknowledged      VARCHAR(1) NOT NULL,
                inserted_on       BIGINT,
                updated_on        BIGINT
            )",
        )
    }

    pub fn sqlite() -> Self {
        Self::with_create(
            "CREATE TABLE IF NOT EXISTS retry_store (
                message_id        TEXT NOT NULL PRIMARY KEY,
                acknowledge_id    TEXT NOT NULL UNIQUE,
                message           BLOB NOT NULL,
                retry_interval    INTEGER NOT NULL,
                total_retries     INTEGER NOT NULL,
                retries_to_date   INTEGER NOT NULL,
                marshalled_logic  BLOB NOT NULL,
                acknowledged      CHAR(1) NOT NULL,
                inserted_on       INTEGER,
                updated_on        INTEGER
            )",
        )
    }

    fn with_create(create: &str) -> Self {
        Self {
            create: create.to_string(),
            insert: "INSERT INTO retry_store (message_id, acknowledge_id, message, retry_interval, \
                 total_retries, retries_to_date, marshalled_logic, acknowledged, inserted_on, \
                 updated_on) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
                .to_string(),
            select: format!(
                "SELECT {SELECT_COLUMNS} FROM retry_store \
                 WHERE acknowledged = 'F' \
                 AND (total_retries = -1 OR retries_to_date < total_retries) \
                 AND updated_on <= $1 - retry_interval"
            ),
            select_one: format!("SELECT {SELECT_COLUMNS} FROM retry_store WHERE message_id = $1"),
            select_expired: format!(
                "SELECT {SELECT_COLUMNS} FROM retry_store \
                 WHERE acknowledged = 'F' \
                 AND total_retries <> -1 \
                 AND retries_to_date >= total_retries"
            ),
            acknowledge: "UPDATE retry_store SET acknowledged = 'T', updated_on = $1 \
                 WHERE acknowledge_id = $2 AND acknowledged = 'F'"
                .to_string(),
            update_retry: "UPDATE retry_store SET retries_to_date = retries_to_date + 1, \
                 updated_on = $1 WHERE message_id = $2 AND acknowledged = 'F'"
                .to_string(),
            delete: "DELETE FROM retry_store WHERE message_id = $1".to_string(),
            delete_acknowledged: "DELETE FROM retry_store WHERE acknowledged = 'T'".to_string(),
        }
    }

    /// Overlay named statements onto `base`. Unknown names are rejected so a
    /// typo cannot silently fall back to the preset.
    pub fn from_properties(
        base: SqlDialect,
        properties: &HashMap<String, String>,
    ) -> Result<Self, RetryError> {
        let mut dialect = base;
        for (name, sql) in properties {
            let slot = match name.as_str() {
                "create" => &mut dialect.create,
                "insert" => &mut dialect.insert,
                "select" => &mut dialect.select,
                "select_one" => &mut dialect.select_one,
                "select_expired" => &mut dialect.select_expired,
                "acknowledge" => &mut dialect.acknowledge,
                "update_retry" => &mut dialect.update_retry,
                "delete" => &mut dialect.delete,
                "delete_acknowledged" => &mut dialect.delete_acknowledged,
                other => {
                    return Err(RetryError::InvalidConfig {
                        reason: format!(
                            "unknown SQL statement '{other}', expected one of {}",
                            STATEMENT_NAMES.join(", ")
                        ),
                    })
                }
            };
            if sql.trim().is_empty() {
                return Err(RetryError::InvalidConfig {
                    reason: format!("SQL statement '{name}' must not be empty"),
                });
            }
            *slot = sql.clone();
        }
        Ok(dialect)
    }
}
