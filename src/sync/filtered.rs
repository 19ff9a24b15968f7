//! Filtered entity sync with transitive-closure ID extraction.
//!
//! Filtered entities (large dimensions like accounts or system users)
//! are pulled only for IDs actually referenced from already-synced data.
//! Extraction reads the local store, never the API; the batched fetch
//! groups IDs into `$filter` disjunctions small enough to keep URLs
//! within server limits.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::client::{DataverseFetch, JsonRecord};
use crate::config::EntityConfig;
use crate::error::SyncError;
use crate::metadata::TableSchema;

use super::database::DatabaseManager;
use super::entity::{max_modified_timestamp, resolve_primary_key};
use super::relationship_graph::RelationshipGraph;
use super::scd2::Scd2Upserter;
use super::state::SyncStateManager;

/// Safety bound for the extraction loop.
const MAX_ITERATIONS: usize = 10;

/// Max IDs per `$filter` disjunction, keeping URLs well under server
/// length limits.
const BATCH_SIZE: usize = 50;

/// Manages filtered entity synchronization.
pub struct FilteredSyncManager<'a> {
    client: &'a dyn DataverseFetch,
    db: &'a DatabaseManager,
    state: &'a SyncStateManager<'a>,
}

impl<'a> FilteredSyncManager<'a> {
    pub fn new(
        client: &'a dyn DataverseFetch,
        db: &'a DatabaseManager,
        state: &'a SyncStateManager<'a>,
    ) -> Self {
        Self { client, db, state }
    }

    /// Extract the IDs each filtered entity is referenced by, iterating
    /// over the graph until no table contributes a new value.
    pub async fn extract_filtered_ids(
        graph: &RelationshipGraph,
        db: &DatabaseManager,
        filtered_entities: &[String],
    ) -> Result<HashMap<String, HashSet<String>>, SyncError> {
        let mut result: HashMap<String, HashSet<String>> = filtered_entities
            .iter()
            .map(|name| (name.clone(), HashSet::new()))
            .collect();

        for iteration in 1..=MAX_ITERATIONS {
            let mut changed = false;

            for entity_api_name in filtered_entities {
                for reference in graph.entities_that_reference(entity_api_name) {
                    let values = db
                        .query_distinct_values(&reference.table, &reference.fk_column)
                        .await?;

                    let ids = result
                        .get_mut(entity_api_name)
                        .expect("filtered entity key present");
                    let before = ids.len();
                    ids.extend(values);
                    if ids.len() > before {
                        info!(
                            entity = %entity_api_name,
                            source_table = %reference.table,
                            source_column = %reference.fk_column,
                            added = ids.len() - before,
                            total = ids.len(),
                            "discovered referenced IDs"
                        );
                        changed = true;
                    }
                }
            }

            if !changed {
                info!(iteration, "ID extraction converged");
                return Ok(result);
            }
        }

        warn!(max_iterations = MAX_ITERATIONS, "ID extraction hit iteration bound");
        Ok(result)
    }

    /// Split an ID set into IDs never seen locally and IDs already
    /// present. With no watermark everything counts as new.
    async fn separate_new_and_existing(
        &self,
        ids: &HashSet<String>,
        table_name: &str,
        primary_key: &str,
        last_timestamp: Option<&str>,
    ) -> Result<(HashSet<String>, HashSet<String>), SyncError> {
        if last_timestamp.is_none() {
            return Ok((ids.clone(), HashSet::new()));
        }

        let mut existing = HashSet::new();
        for id in ids {
            let present = sqlx::query(&format!(
                "SELECT 1 FROM {table_name} WHERE {primary_key} = ? LIMIT 1"
            ))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .is_some();
            if present {
                existing.insert(id.clone());
            }
        }

        let new_ids = ids.difference(&existing).cloned().collect();
        Ok((new_ids, existing))
    }

    /// Fetch one chunk of IDs as a `$filter` disjunction, optionally
    /// gated by a `modifiedon` window.
    async fn fetch_id_batch(
        &self,
        batch: &[String],
        primary_key: &str,
        entity_api_name: &str,
        timestamp_filter: Option<&str>,
    ) -> Result<Vec<JsonRecord>, SyncError> {
        let id_filter = batch
            .iter()
            .map(|id| format!("{primary_key} eq '{id}'"))
            .collect::<Vec<_>>()
            .join(" or ");

        let filter = match timestamp_filter {
            Some(ts_filter) => format!("({id_filter}) and {ts_filter}"),
            None => id_filter,
        };

        self.client
            .fetch_all_pages(entity_api_name, Some(primary_key), Some(&filter), None)
            .await
    }

    /// Sync one filtered entity for the given ID set.
    pub async fn sync_filtered_entity(
        &self,
        entity: &EntityConfig,
        ids: &HashSet<String>,
        schema: &TableSchema,
    ) -> Result<(u64, u64), SyncError> {
        if ids.is_empty() {
            return Ok((0, 0));
        }

        let log_id = self.state.start_sync(&entity.api_name).await?;

        match self.sync_filtered_inner(entity, ids, schema).await {
            Ok((added, updated)) => {
                self.state
                    .complete_sync(log_id, &entity.api_name, added, updated)
                    .await?;
                Ok((added, updated))
            }
            Err(e) => {
                self.state
                    .fail_sync(log_id, &entity.api_name, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    async fn sync_filtered_inner(
        &self,
        entity: &EntityConfig,
        ids: &HashSet<String>,
        schema: &TableSchema,
    ) -> Result<(u64, u64), SyncError> {
        let primary_key = resolve_primary_key(schema, entity, None)?;
        let last_timestamp = self.db.last_sync_timestamp(&entity.api_name).await?;

        let (new_ids, existing_ids) = self
            .separate_new_and_existing(
                ids,
                &entity.api_name,
                &primary_key,
                last_timestamp.as_deref(),
            )
            .await?;

        let mut all_records = Vec::new();

        // New IDs: full fetch, no timestamp gate.
        let new_ids: Vec<String> = new_ids.into_iter().collect();
        for batch in new_ids.chunks(BATCH_SIZE) {
            let records = self
                .fetch_id_batch(batch, &primary_key, &entity.api_name, None)
                .await?;
            all_records.extend(records);
        }

        // Existing IDs: only re-fetch those modified since the watermark.
        if let Some(ts) = &last_timestamp {
            if !existing_ids.is_empty() && schema.has_column("modifiedon") {
                let timestamp_filter = format!("modifiedon gt {ts}");
                let existing_ids: Vec<String> = existing_ids.into_iter().collect();
                for batch in existing_ids.chunks(BATCH_SIZE) {
                    let records = self
                        .fetch_id_batch(
                            batch,
                            &primary_key,
                            &entity.api_name,
                            Some(&timestamp_filter),
                        )
                        .await?;
                    all_records.extend(records);
                }
            }
        }

        if all_records.is_empty() {
            return Ok((0, 0));
        }

        let upserter = Scd2Upserter::new(self.db);
        let (added, updated) = upserter
            .upsert_batch(&entity.api_name, &primary_key, schema, &all_records)
            .await?;

        if let Some(max_ts) = max_modified_timestamp(&all_records) {
            self.db
                .update_sync_timestamp(&entity.api_name, &max_ts, all_records.len() as i64)
                .await?;
        }

        Ok((added, updated))
    }
}
