//! Pre-sync schema validation gate.
//!
//! Filters the SCD2 system columns out of observed schemas, applies the
//! phantom-primary-key adjustment, and runs the comparer. Any error-level
//! difference blocks the run before a single record is fetched.

use std::collections::HashMap;

use serde_json::json;
use tracing::{error, info, warn};

use crate::config::EntityConfig;
use crate::metadata::{
    DbTarget, IssueType, SchemaDifference, Severity, TableSchema,
};

use super::comparer::SchemaComparer;

/// Columns the storage layer adds to every entity table; excluded from
/// comparison because $metadata knows nothing about them.
pub const SYSTEM_COLUMNS: [&str; 5] =
    ["row_id", "json_response", "sync_time", "valid_from", "valid_to"];

/// Result of the validation gate.
pub struct ValidationOutcome {
    pub valid_entities: Vec<EntityConfig>,
    pub entities_to_create: Vec<EntityConfig>,
    pub differences: Vec<SchemaDifference>,
    pub passed: bool,
}

impl ValidationOutcome {
    pub fn errors(&self) -> Vec<SchemaDifference> {
        self.differences
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .cloned()
            .collect()
    }
}

/// Remove system columns from an observed schema and, when the observed
/// primary key is the SCD2 surrogate, substitute the business key so the
/// comparison can succeed.
fn filter_system_columns(
    schema: &TableSchema,
    expected_pk: Option<&str>,
    singular_name: &str,
) -> TableSchema {
    let columns: Vec<_> = schema
        .columns
        .iter()
        .filter(|c| !SYSTEM_COLUMNS.contains(&c.name.as_str()))
        .cloned()
        .collect();

    let primary_key = match schema.primary_key.as_deref() {
        Some(pk) if SYSTEM_COLUMNS.contains(&pk) => {
            if let Some(expected) = expected_pk.filter(|pk| columns.iter().any(|c| c.name == *pk)) {
                Some(expected.to_string())
            } else {
                // Metadata quirk: the declared PK may not exist as a column
                // (e.g. systemuser declares ownerid but only carries
                // systemuserid). Fall back to the <entity>id convention.
                let entity_id_col = format!("{singular_name}id");
                columns
                    .iter()
                    .any(|c| c.name == entity_id_col)
                    .then_some(entity_id_col)
            }
        }
        other => other.map(str::to_string),
    };

    TableSchema {
        entity_name: schema.entity_name.clone(),
        columns,
        primary_key,
        foreign_keys: schema.foreign_keys.clone(),
        indexes: schema.indexes.clone(),
    }
}

/// When the projected PK does not exist as a column and the observed
/// side settled on `<entity>id`, align the projected PK so the pair
/// compares clean.
fn adjust_phantom_pk(
    projected: &TableSchema,
    observed_filtered: &TableSchema,
    singular_name: &str,
) -> TableSchema {
    if let Some(pk) = projected.primary_key.as_deref() {
        if !projected.columns.iter().any(|c| c.name == pk) {
            let entity_id_col = format!("{singular_name}id");
            if observed_filtered.primary_key.as_deref() == Some(entity_id_col.as_str()) {
                let mut adjusted = projected.clone();
                adjusted.primary_key = Some(entity_id_col);
                return adjusted;
            }
        }
    }
    projected.clone()
}

/// Validate every configured entity against the observed store.
///
/// `projected` is keyed by singular entity name, `observed` by plural
/// table name.
pub fn validate_schema_before_sync(
    entities: &[EntityConfig],
    projected: &HashMap<String, TableSchema>,
    observed: &HashMap<String, TableSchema>,
    target: DbTarget,
) -> ValidationOutcome {
    let comparer = SchemaComparer::new(target);
    let mut differences = Vec::new();
    let mut valid_entities = Vec::new();
    let mut entities_to_create = Vec::new();

    for entity in entities {
        let Some(projected_schema) = projected.get(&entity.name) else {
            differences.push(SchemaDifference::new(
                entity.api_name.clone(),
                IssueType::MissingEntity,
                Severity::Warning,
                format!(
                    "Entity '{}' in config but not in $metadata - skipping",
                    entity.name
                ),
                json!({ "entity_name": entity.name }),
            ));
            continue;
        };

        let Some(observed_schema) = observed.get(&entity.api_name) else {
            differences.push(SchemaDifference::new(
                entity.api_name.clone(),
                IssueType::NewEntity,
                Severity::Info,
                "New entity - table will be created",
                json!({ "entity_name": entity.name }),
            ));
            entities_to_create.push(entity.clone());
            valid_entities.push(entity.clone());
            continue;
        };

        let observed_filtered = filter_system_columns(
            observed_schema,
            projected_schema.primary_key.as_deref(),
            &entity.name,
        );
        let projected_adjusted =
            adjust_phantom_pk(projected_schema, &observed_filtered, &entity.name);

        let pair_projected = HashMap::from([(entity.name.clone(), projected_adjusted)]);
        let pair_observed = HashMap::from([(entity.name.clone(), observed_filtered)]);
        differences.extend(comparer.compare_all(&pair_projected, &pair_observed));
        valid_entities.push(entity.clone());
    }

    let passed = report_validation_results(&differences);

    ValidationOutcome {
        valid_entities,
        entities_to_create,
        differences,
        passed,
    }
}

fn report_validation_results(differences: &[SchemaDifference]) -> bool {
    let errors: Vec<_> = differences.iter().filter(|d| d.severity == Severity::Error).collect();
    let warnings = differences.iter().filter(|d| d.severity == Severity::Warning).count();
    let infos = differences.iter().filter(|d| d.severity == Severity::Info).count();

    if !differences.is_empty() {
        info!(
            errors = errors.len(),
            warnings, infos, "schema validation results"
        );
        for diff in differences {
            match diff.severity {
                Severity::Error => error!(entity = %diff.entity, "{}", diff.description),
                Severity::Warning => warn!(entity = %diff.entity, "{}", diff.description),
                Severity::Info => info!(entity = %diff.entity, "{}", diff.description),
            }
        }
    }

    if !errors.is_empty() {
        error!(
            count = errors.len(),
            "sync aborted: breaking schema change(s) detected"
        );
        return false;
    }

    if warnings > 0 || infos > 0 {
        info!(warnings, infos, "validation passed with notices");
    } else {
        info!("validation passed (no changes)");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ColumnSpec;

    fn column(name: &str, db_type: &str) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            db_type: db_type.to_string(),
            edm_type: None,
            nullable: true,
            max_length: None,
        }
    }

    fn entity(name: &str, api_name: &str) -> EntityConfig {
        EntityConfig {
            name: name.to_string(),
            api_name: api_name.to_string(),
            filtered: false,
            description: String::new(),
        }
    }

    fn scd2_observed(business_key: &str) -> TableSchema {
        TableSchema {
            entity_name: "accounts".into(),
            columns: vec![
                column("row_id", "INTEGER"),
                column(business_key, "TEXT"),
                column("name", "TEXT"),
                column("json_response", "TEXT"),
                column("sync_time", "TEXT"),
                column("valid_from", "TEXT"),
                column("valid_to", "TEXT"),
            ],
            primary_key: Some("row_id".into()),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    #[test]
    fn test_surrogate_pk_tolerated_when_business_key_present() {
        let projected = HashMap::from([(
            "account".to_string(),
            TableSchema {
                entity_name: "account".into(),
                columns: vec![column("accountid", "TEXT"), column("name", "TEXT")],
                primary_key: Some("accountid".into()),
                foreign_keys: Vec::new(),
                indexes: Vec::new(),
            },
        )]);
        let observed = HashMap::from([("accounts".to_string(), scd2_observed("accountid"))]);

        let outcome = validate_schema_before_sync(
            &[entity("account", "accounts")],
            &projected,
            &observed,
            DbTarget::Sqlite,
        );
        assert!(outcome.passed, "differences: {:?}", outcome.differences);
        assert!(outcome.errors().is_empty());
    }

    #[test]
    fn test_phantom_pk_falls_back_to_entity_id_column() {
        // systemuser declares ownerid as PK but only systemuserid exists.
        let projected = HashMap::from([(
            "systemuser".to_string(),
            TableSchema {
                entity_name: "systemuser".into(),
                columns: vec![column("systemuserid", "TEXT"), column("fullname", "TEXT")],
                primary_key: Some("ownerid".into()),
                foreign_keys: Vec::new(),
                indexes: Vec::new(),
            },
        )]);
        let mut observed_schema = scd2_observed("systemuserid");
        observed_schema.columns[2] = column("fullname", "TEXT");
        let observed = HashMap::from([("systemusers".to_string(), observed_schema)]);

        let outcome = validate_schema_before_sync(
            &[entity("systemuser", "systemusers")],
            &projected,
            &observed,
            DbTarget::Sqlite,
        );
        assert!(outcome.passed, "differences: {:?}", outcome.differences);
    }

    #[test]
    fn test_new_entity_marked_for_creation() {
        let projected = HashMap::from([(
            "account".to_string(),
            TableSchema::new("account"),
        )]);
        let outcome = validate_schema_before_sync(
            &[entity("account", "accounts")],
            &projected,
            &HashMap::new(),
            DbTarget::Sqlite,
        );
        assert!(outcome.passed);
        assert_eq!(outcome.entities_to_create.len(), 1);
        assert_eq!(outcome.valid_entities.len(), 1);
    }

    #[test]
    fn test_entity_missing_from_metadata_is_skipped() {
        let outcome = validate_schema_before_sync(
            &[entity("ghost", "ghosts")],
            &HashMap::new(),
            &HashMap::new(),
            DbTarget::Sqlite,
        );
        assert!(outcome.passed);
        assert!(outcome.valid_entities.is_empty());
        assert_eq!(outcome.differences.len(), 1);
        assert_eq!(outcome.differences[0].issue_type, IssueType::MissingEntity);
    }

    #[test]
    fn test_type_mismatch_fails_the_gate() {
        let projected = HashMap::from([(
            "account".to_string(),
            TableSchema {
                entity_name: "account".into(),
                columns: vec![column("accountid", "TEXT"), column("revenue", "REAL")],
                primary_key: Some("accountid".into()),
                foreign_keys: Vec::new(),
                indexes: Vec::new(),
            },
        )]);
        let mut observed_schema = scd2_observed("accountid");
        observed_schema.columns[2] = column("revenue", "TEXT");
        let observed = HashMap::from([("accounts".to_string(), observed_schema)]);

        let outcome = validate_schema_before_sync(
            &[entity("account", "accounts")],
            &projected,
            &observed,
            DbTarget::Sqlite,
        );
        assert!(!outcome.passed);
        assert!(!outcome.errors().is_empty());
    }
}
