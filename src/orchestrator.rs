//! Composition of the full sync workflow.
//!
//! One run: authenticate, fetch and parse $metadata, gate on the schema
//! comparison, create any new tables, build the relationship graph,
//! drain unfiltered entities, iterate filtered sync to its fixpoint,
//! optionally verify references, and roll everything up into a
//! `SyncOutcome`. Entity failures are isolated: a failing entity is
//! stamped failed in `_sync_log` and its siblings continue.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::auth::DataverseAuth;
use crate::client::{DataverseClient, DataverseFetch};
use crate::config::{Config, EntityConfig};
use crate::error::SyncError;
use crate::metadata::{DbTarget, MetadataParser, SchemaDifference};
use crate::sync::{
    initialize_tables, sync_entity, DatabaseManager, FilteredSyncManager, ReferenceVerifier,
    RelationshipGraph, SyncStateManager, VerificationIssue,
};
use crate::validation::{validate_schema_before_sync, DatabaseSchemaReader};

/// Error previews in the failure roll-up are truncated to this length.
const MAX_ERROR_MESSAGE_LENGTH: usize = 100;

/// Bound on orchestrator-level filtered-sync passes. Each pass can
/// reveal foreign keys into other filtered entities, so the loop runs
/// until no new IDs appear or this bound is hit.
const MAX_FILTERED_ITERATIONS: usize = 5;

/// Aggregate result of one sync run.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub success: bool,
    pub total_added: u64,
    pub total_updated: u64,
    pub failed_entities: Vec<(String, String)>,
    pub validation_errors: Vec<SchemaDifference>,
    pub reference_issues: Vec<VerificationIssue>,
}

/// Full entry point: authenticate, open the client and store, run the
/// workflow. Resources are released when the run returns on any path.
pub async fn run_sync(
    config: &Config,
    entities: &[EntityConfig],
    optionset_overrides: &HashMap<String, Vec<String>>,
    verify_references: bool,
) -> Result<SyncOutcome, SyncError> {
    info!("authenticating with Dataverse");
    let mut auth = DataverseAuth::new(config.clone())?;
    let token = auth.authenticate().await?;

    let client = DataverseClient::new(config, token)?;
    let db = DatabaseManager::open(config.sqlite_path()?).await?;

    run_sync_workflow(&client, &db, entities, optionset_overrides, verify_references).await
}

/// The core workflow, parameterized over the fetch trait so tests can
/// substitute a canned client.
pub async fn run_sync_workflow(
    client: &dyn DataverseFetch,
    db: &DatabaseManager,
    entities: &[EntityConfig],
    optionset_overrides: &HashMap<String, Vec<String>>,
    verify_references: bool,
) -> Result<SyncOutcome, SyncError> {
    info!("fetching $metadata");
    let metadata_xml = client.get_metadata().await?;

    let parser =
        MetadataParser::new(DbTarget::Sqlite).with_optionset_overrides(optionset_overrides);
    let singular_names: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();
    let schemas = parser.parse_for_entities(&metadata_xml, &singular_names)?;
    info!(count = schemas.len(), "schemas loaded from $metadata");

    let table_names: Vec<String> = entities.iter().map(|e| e.api_name.clone()).collect();
    let reader = DatabaseSchemaReader::from_sqlite(db.pool().clone());
    let observed = reader.read_schemas(&table_names).await?;

    let validation = validate_schema_before_sync(entities, &schemas, &observed, DbTarget::Sqlite);
    if !validation.passed {
        return Ok(SyncOutcome {
            validation_errors: validation.errors(),
            ..SyncOutcome::default()
        });
    }
    if validation.valid_entities.is_empty() {
        warn!("no valid entities to sync");
        return Ok(SyncOutcome::default());
    }

    db.init_sync_tables().await?;
    initialize_tables(db, &validation.entities_to_create, &schemas).await?;

    let graph = RelationshipGraph::build(&schemas, entities);
    let state = SyncStateManager::new(db);

    let mut total_added = 0u64;
    let mut total_updated = 0u64;
    let mut failed_entities: Vec<(String, String)> = Vec::new();

    let unfiltered: Vec<&EntityConfig> = validation
        .valid_entities
        .iter()
        .filter(|e| !e.filtered)
        .collect();
    let filtered: Vec<&EntityConfig> = validation
        .valid_entities
        .iter()
        .filter(|e| e.filtered)
        .collect();

    info!(count = unfiltered.len(), "syncing unfiltered entities");
    for entity in unfiltered {
        let Some(schema) = schemas.get(&entity.name) else {
            continue;
        };
        match sync_entity(entity, client, db, &state, schema).await {
            Ok((added, updated)) => {
                total_added += added;
                total_updated += updated;
            }
            Err(e) => {
                failed_entities.push((entity.api_name.clone(), e.to_string()));
            }
        }
    }

    if !filtered.is_empty() {
        info!(count = filtered.len(), "syncing filtered entities with transitive closure");
        let manager = FilteredSyncManager::new(client, db, &state);
        let filtered_names: Vec<String> =
            filtered.iter().map(|e| e.api_name.clone()).collect();
        let mut synced_ids: HashMap<String, HashSet<String>> = filtered_names
            .iter()
            .map(|name| (name.clone(), HashSet::new()))
            .collect();

        for iteration in 1..=MAX_FILTERED_ITERATIONS {
            info!(iteration, "transitive closure pass");
            let extracted =
                FilteredSyncManager::extract_filtered_ids(&graph, db, &filtered_names).await?;

            let has_new = filtered.iter().any(|entity| {
                let seen = &synced_ids[&entity.api_name];
                extracted
                    .get(&entity.api_name)
                    .is_some_and(|ids| ids.difference(seen).next().is_some())
            });
            if !has_new {
                info!(iteration, "converged, no new IDs found");
                break;
            }

            for entity in &filtered {
                let Some(schema) = schemas.get(&entity.name) else {
                    continue;
                };
                let seen = &synced_ids[&entity.api_name];
                let new_ids: HashSet<String> = extracted
                    .get(&entity.api_name)
                    .map(|ids| ids.difference(seen).cloned().collect())
                    .unwrap_or_default();
                if new_ids.is_empty() {
                    continue;
                }

                match manager.sync_filtered_entity(entity, &new_ids, schema).await {
                    Ok((added, updated)) => {
                        total_added += added;
                        total_updated += updated;
                        synced_ids
                            .get_mut(&entity.api_name)
                            .expect("filtered entity key present")
                            .extend(new_ids);
                        info!(entity = %entity.api_name, added, updated, "filtered entity synced");
                    }
                    Err(e) => {
                        warn!(entity = %entity.api_name, error = %e, "filtered entity sync failed");
                        failed_entities.push((entity.api_name.clone(), e.to_string()));
                    }
                }
            }
        }

        for entity in &filtered {
            info!(
                entity = %entity.api_name,
                records = synced_ids[&entity.api_name].len(),
                "filtered entity total"
            );
        }
    }

    report_failures(&failed_entities);

    let mut reference_issues = Vec::new();
    if verify_references {
        info!("verifying references");
        let report = ReferenceVerifier::verify_references(db, &graph).await?;
        info!("{report}");
        reference_issues = report.issues;
    }

    let success = failed_entities.is_empty() && reference_issues.is_empty();
    info!(total_added, total_updated, success, "sync complete");

    Ok(SyncOutcome {
        success,
        total_added,
        total_updated,
        failed_entities,
        validation_errors: Vec::new(),
        reference_issues,
    })
}

fn report_failures(failed_entities: &[(String, String)]) {
    if failed_entities.is_empty() {
        return;
    }
    warn!(count = failed_entities.len(), "entities failed to sync");
    for (entity_name, error) in failed_entities {
        let preview = if error.len() > MAX_ERROR_MESSAGE_LENGTH {
            let cut: String = error.chars().take(MAX_ERROR_MESSAGE_LENGTH).collect();
            format!("{cut}...")
        } else {
            error.clone()
        };
        warn!(entity = %entity_name, "{preview}");
    }
}
