//! Sync state and audit-log tracking over `_sync_state` and `_sync_log`.

use chrono::Utc;
use sqlx::Row;

use crate::error::SyncError;

use super::database::DatabaseManager;

/// Manages per-entity sync state transitions and log rows.
pub struct SyncStateManager<'a> {
    db: &'a DatabaseManager,
}

impl<'a> SyncStateManager<'a> {
    pub fn new(db: &'a DatabaseManager) -> Self {
        Self { db }
    }

    /// Set the state for an entity, preserving any existing watermark
    /// and record count.
    pub async fn set_state(&self, entity_name: &str, state: &str) -> Result<(), SyncError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO _sync_state (entity_name, state, last_sync_time)
             VALUES (?, ?, ?)",
        )
        .bind(entity_name)
        .bind(state)
        .bind(&now)
        .execute(self.db.pool())
        .await?;

        sqlx::query(
            "UPDATE _sync_state SET state = ?, last_sync_time = ? WHERE entity_name = ?",
        )
        .bind(state)
        .bind(&now)
        .bind(entity_name)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn get_state(&self, entity_name: &str) -> Result<Option<String>, SyncError> {
        let row = sqlx::query("SELECT state FROM _sync_state WHERE entity_name = ?")
            .bind(entity_name)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|r| r.get("state")))
    }

    /// Begin a sync run for an entity. Returns the log row id.
    pub async fn start_sync(&self, entity_name: &str) -> Result<i64, SyncError> {
        self.set_state(entity_name, "in_progress").await?;
        let result = sqlx::query(
            "INSERT INTO _sync_log (entity_name, start_time, status)
             VALUES (?, ?, 'in_progress')",
        )
        .bind(entity_name)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn complete_sync(
        &self,
        log_id: i64,
        entity_name: &str,
        added: u64,
        updated: u64,
    ) -> Result<(), SyncError> {
        self.set_state(entity_name, "completed").await?;
        sqlx::query(
            "UPDATE _sync_log
             SET end_time = ?, records_added = ?, records_updated = ?, status = 'completed'
             WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(added as i64)
        .bind(updated as i64)
        .bind(log_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn fail_sync(
        &self,
        log_id: i64,
        entity_name: &str,
        error: &str,
    ) -> Result<(), SyncError> {
        self.set_state(entity_name, "failed").await?;
        sqlx::query(
            "UPDATE _sync_log
             SET end_time = ?, status = 'failed', error_message = ?
             WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(error)
        .bind(log_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}
