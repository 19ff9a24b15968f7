//! Unfiltered per-entity synchronization.
//!
//! One entity's pull is: mark in-progress, apply the incremental
//! `modifiedon` window when a watermark exists, paginate ordered by the
//! business key, SCD2-commit the batch, then advance the watermark to
//! the maximum observed `modifiedon`.

use serde_json::Value;
use tracing::{info, warn};

use crate::client::{DataverseFetch, JsonRecord};
use crate::config::EntityConfig;
use crate::error::SyncError;
use crate::metadata::TableSchema;

use super::database::DatabaseManager;
use super::scd2::Scd2Upserter;
use super::state::SyncStateManager;

/// Resolve the business-key column to use for upserts.
///
/// The metadata-declared primary key sometimes does not exist as a
/// column (e.g. `ownerid` declared while only `<entity>id` is carried).
/// Fallback order: `<entity>id` in the schema, `<entity>id` present in
/// the payload, then any `*id` column not starting with `_`.
pub fn resolve_primary_key(
    schema: &TableSchema,
    entity: &EntityConfig,
    first_record: Option<&JsonRecord>,
) -> Result<String, SyncError> {
    let Some(declared) = schema.primary_key.as_deref() else {
        return Err(SyncError::PkResolution(entity.api_name.clone()));
    };

    if schema.has_column(declared) {
        return Ok(declared.to_string());
    }

    let fallback = format!("{}id", entity.name);
    if schema.has_column(&fallback) {
        warn!(
            entity = %entity.api_name,
            declared, fallback = %fallback,
            "primary key not in columns, using fallback"
        );
        return Ok(fallback);
    }
    if first_record.is_some_and(|r| r.contains_key(&fallback)) {
        warn!(
            entity = %entity.api_name,
            declared, fallback = %fallback,
            "primary key not in columns, using fallback from API response"
        );
        return Ok(fallback);
    }

    if let Some(id_col) = schema
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .find(|name| name.ends_with("id") && !name.starts_with('_'))
    {
        warn!(
            entity = %entity.api_name,
            declared, fallback = id_col,
            "primary key not in columns, using fallback"
        );
        return Ok(id_col.to_string());
    }

    Err(SyncError::PkResolution(entity.api_name.clone()))
}

/// The maximum non-null `modifiedon` across a batch, used to advance the
/// incremental watermark.
pub fn max_modified_timestamp(records: &[JsonRecord]) -> Option<String> {
    records
        .iter()
        .filter_map(|r| r.get("modifiedon").and_then(Value::as_str))
        .max()
        .map(str::to_string)
}

/// Sync one unfiltered entity. Errors are stamped into `_sync_log`
/// before propagating so the orchestrator can continue with siblings.
pub async fn sync_entity(
    entity: &EntityConfig,
    client: &dyn DataverseFetch,
    db: &DatabaseManager,
    state: &SyncStateManager<'_>,
    schema: &TableSchema,
) -> Result<(u64, u64), SyncError> {
    let log_id = state.start_sync(&entity.api_name).await?;
    info!(entity = %entity.api_name, "syncing entity");

    match sync_entity_inner(entity, client, db, schema).await {
        Ok((added, updated)) => {
            state
                .complete_sync(log_id, &entity.api_name, added, updated)
                .await?;
            info!(entity = %entity.api_name, added, updated, "entity sync complete");
            Ok((added, updated))
        }
        Err(e) => {
            state
                .fail_sync(log_id, &entity.api_name, &e.to_string())
                .await?;
            warn!(entity = %entity.api_name, error = %e, "entity sync failed");
            Err(e)
        }
    }
}

async fn sync_entity_inner(
    entity: &EntityConfig,
    client: &dyn DataverseFetch,
    db: &DatabaseManager,
    schema: &TableSchema,
) -> Result<(u64, u64), SyncError> {
    let last_timestamp = db.last_sync_timestamp(&entity.api_name).await?;

    let filter = match &last_timestamp {
        Some(ts) if schema.has_column("modifiedon") => Some(format!("modifiedon gt {ts}")),
        _ => None,
    };

    // Deterministic server-side paging needs an orderby; prefer the
    // business key, then the timestamp columns.
    let orderby = if let Some(pk) = schema.primary_key.as_deref() {
        Some(pk)
    } else if schema.has_column("createdon") {
        Some("createdon")
    } else if schema.has_column("modifiedon") {
        Some("modifiedon")
    } else {
        None
    };

    let records = client
        .fetch_all_pages(&entity.api_name, orderby, filter.as_deref(), None)
        .await?;

    if records.is_empty() {
        info!(entity = %entity.api_name, "no records");
        return Ok((0, 0));
    }

    let primary_key = resolve_primary_key(schema, entity, records.first())?;
    let upserter = Scd2Upserter::new(db);
    let (added, updated) = upserter
        .upsert_batch(&entity.api_name, &primary_key, schema, &records)
        .await?;

    if let Some(max_ts) = max_modified_timestamp(&records) {
        db.update_sync_timestamp(&entity.api_name, &max_ts, records.len() as i64)
            .await?;
    }

    Ok((added, updated))
}
