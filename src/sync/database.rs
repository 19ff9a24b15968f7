//! SQLite storage manager for sync operations.
//!
//! The pool is capped at a single connection: SQLite is a single-writer
//! store and every SCD2 transition for a given business key must commit
//! serially. Idle and lifetime timeouts are disabled so an in-memory
//! database lives exactly as long as the manager.
//!
//! Table and column names interpolated into SQL here are derived from
//! configuration and $metadata, never from record payloads; values are
//! always bound.

use std::collections::HashSet;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::SyncError;

/// Owns the store connection for the duration of a run.
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Open (creating if missing) a database file.
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::open_with(options).await
    }

    /// Open an in-memory database. Used by tests and kept alive by the
    /// single pooled connection.
    pub async fn open_in_memory() -> Result<Self, SyncError> {
        Self::open_with(SqliteConnectOptions::new().in_memory(true)).await
    }

    async fn open_with(options: SqliteConnectOptions) -> Result<Self, SyncError> {
        // Junction tables declare FKs against the non-unique business
        // key; the constraints document the relationship and are not
        // enforced.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options.foreign_keys(false))
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Execute a statement without parameters.
    pub async fn execute(&self, sql: &str) -> Result<(), SyncError> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn table_exists(&self, table_name: &str) -> Result<bool, SyncError> {
        let row = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Create a single-column index if it does not exist.
    pub async fn create_index(&self, table_name: &str, column_name: &str) -> Result<(), SyncError> {
        let index_name = format!("idx_{table_name}_{column_name}");
        self.execute(&format!(
            "CREATE INDEX IF NOT EXISTS {index_name} ON {table_name}({column_name})"
        ))
        .await
    }

    /// Create the sync metadata tables.
    pub async fn init_sync_tables(&self) -> Result<(), SyncError> {
        self.execute(
            "CREATE TABLE IF NOT EXISTS _sync_state (
                entity_name TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                last_sync_time TEXT,
                last_timestamp TEXT,
                records_count INTEGER DEFAULT 0
            )",
        )
        .await?;

        self.execute(
            "CREATE TABLE IF NOT EXISTS _sync_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_name TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                records_added INTEGER DEFAULT 0,
                records_updated INTEGER DEFAULT 0,
                status TEXT NOT NULL,
                error_message TEXT
            )",
        )
        .await
    }

    /// The incremental-sync watermark for an entity, if any.
    pub async fn last_sync_timestamp(
        &self,
        entity_name: &str,
    ) -> Result<Option<String>, SyncError> {
        let row = sqlx::query("SELECT last_timestamp FROM _sync_state WHERE entity_name = ?")
            .bind(entity_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("last_timestamp")))
    }

    /// Advance the watermark and record count, marking the entity completed.
    pub async fn update_sync_timestamp(
        &self,
        entity_name: &str,
        timestamp: &str,
        records_count: i64,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR REPLACE INTO _sync_state
             (entity_name, state, last_sync_time, last_timestamp, records_count)
             VALUES (?, 'completed', ?, ?, ?)",
        )
        .bind(entity_name)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(timestamp)
        .bind(records_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Distinct non-null values of a column, cast to text. Returns an
    /// empty set when the table does not exist (it may simply not have
    /// been created yet during filtered sync).
    pub async fn query_distinct_values(
        &self,
        table_name: &str,
        column_name: &str,
    ) -> Result<HashSet<String>, SyncError> {
        if !self.table_exists(table_name).await? {
            return Ok(HashSet::new());
        }

        let rows = sqlx::query(&format!(
            "SELECT DISTINCT CAST({column_name} AS TEXT) AS value
             FROM {table_name} WHERE {column_name} IS NOT NULL"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get::<String, _>("value")).collect())
    }
}
