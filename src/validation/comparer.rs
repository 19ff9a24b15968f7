//! Compares projected (Dataverse) schemas with observed (database)
//! schemas and classifies every difference.
//!
//! Errors abort the run before any data fetch. Missing tables and
//! columns are expected (additive evolution: new tables get created, new
//! columns live in the canonical JSON payload), so they rank as info.

use std::collections::HashMap;

use serde_json::json;

use crate::metadata::{
    normalize_db_type, DbTarget, IssueType, SchemaDifference, Severity, TableSchema,
};

pub struct SchemaComparer {
    target: DbTarget,
}

impl SchemaComparer {
    pub fn new(target: DbTarget) -> Self {
        Self { target }
    }

    /// Compare every projected schema against the observed set.
    pub fn compare_all(
        &self,
        projected: &HashMap<String, TableSchema>,
        observed: &HashMap<String, TableSchema>,
    ) -> Vec<SchemaDifference> {
        let mut differences = Vec::new();

        for entity_name in projected.keys() {
            if !observed.contains_key(entity_name) {
                differences.push(SchemaDifference::new(
                    entity_name.clone(),
                    IssueType::MissingTable,
                    Severity::Info,
                    format!("Table '{entity_name}' exists in Dataverse but not in database"),
                    json!({ "entity_name": entity_name }),
                ));
            }
        }

        for entity_name in observed.keys() {
            if !projected.contains_key(entity_name) {
                differences.push(SchemaDifference::new(
                    entity_name.clone(),
                    IssueType::ExtraTable,
                    Severity::Warning,
                    format!("Table '{entity_name}' exists in database but not in Dataverse schema"),
                    json!({ "entity_name": entity_name }),
                ));
            }
        }

        for (entity_name, projected_schema) in projected {
            if let Some(observed_schema) = observed.get(entity_name) {
                differences.extend(self.compare_columns(entity_name, projected_schema, observed_schema));
                differences.extend(compare_primary_keys(entity_name, projected_schema, observed_schema));
                differences.extend(compare_foreign_keys(entity_name, projected_schema, observed_schema));
            }
        }

        differences
    }

    fn compare_columns(
        &self,
        entity_name: &str,
        projected: &TableSchema,
        observed: &TableSchema,
    ) -> Vec<SchemaDifference> {
        let mut differences = Vec::new();

        let projected_cols: HashMap<String, _> = projected
            .columns
            .iter()
            .map(|c| (c.name.to_ascii_lowercase(), c))
            .collect();
        let observed_cols: HashMap<String, _> = observed
            .columns
            .iter()
            .map(|c| (c.name.to_ascii_lowercase(), c))
            .collect();

        for (key, col) in &projected_cols {
            if !observed_cols.contains_key(key) {
                differences.push(SchemaDifference::new(
                    entity_name,
                    IssueType::MissingColumn,
                    Severity::Info,
                    format!("Column '{}' missing in database", col.name),
                    json!({
                        "column_name": col.name,
                        "expected_type": col.db_type,
                        "edm_type": col.edm_type,
                    }),
                ));
            }
        }

        for (key, col) in &observed_cols {
            if !projected_cols.contains_key(key) {
                differences.push(SchemaDifference::new(
                    entity_name,
                    IssueType::ExtraColumn,
                    Severity::Warning,
                    format!("Column '{}' exists in database but not in Dataverse", col.name),
                    json!({
                        "column_name": col.name,
                        "actual_type": col.db_type,
                    }),
                ));
            }
        }

        for (key, projected_col) in &projected_cols {
            let Some(observed_col) = observed_cols.get(key) else {
                continue;
            };

            let expected = normalize_db_type(&projected_col.db_type, self.target);
            let actual = normalize_db_type(&observed_col.db_type, self.target);
            if expected != actual {
                differences.push(SchemaDifference::new(
                    entity_name,
                    IssueType::TypeMismatch,
                    Severity::Error,
                    format!("Column '{}' type mismatch", projected_col.name),
                    json!({
                        "column_name": projected_col.name,
                        "expected_type": projected_col.db_type,
                        "actual_type": observed_col.db_type,
                        "expected_normalized": expected,
                        "actual_normalized": actual,
                        "edm_type": projected_col.edm_type,
                    }),
                ));
            }

            if projected_col.nullable != observed_col.nullable {
                differences.push(SchemaDifference::new(
                    entity_name,
                    IssueType::NullableMismatch,
                    Severity::Warning,
                    format!("Column '{}' nullable mismatch", projected_col.name),
                    json!({
                        "column_name": projected_col.name,
                        "expected_nullable": projected_col.nullable,
                        "actual_nullable": observed_col.nullable,
                    }),
                ));
            }
        }

        differences
    }
}

fn compare_primary_keys(
    entity_name: &str,
    projected: &TableSchema,
    observed: &TableSchema,
) -> Vec<SchemaDifference> {
    let expected = projected.primary_key.as_deref().map(str::to_ascii_lowercase);
    let actual = observed.primary_key.as_deref().map(str::to_ascii_lowercase);

    if expected != actual {
        return vec![SchemaDifference::new(
            entity_name,
            IssueType::PkMismatch,
            Severity::Error,
            "Primary key mismatch",
            json!({
                "expected_pk": projected.primary_key,
                "actual_pk": observed.primary_key,
            }),
        )];
    }
    Vec::new()
}

fn compare_foreign_keys(
    entity_name: &str,
    projected: &TableSchema,
    observed: &TableSchema,
) -> Vec<SchemaDifference> {
    let mut differences = Vec::new();

    let projected_fks: HashMap<String, _> = projected
        .foreign_keys
        .iter()
        .map(|fk| (fk.column.to_ascii_lowercase(), fk))
        .collect();
    let observed_fks: HashMap<String, _> = observed
        .foreign_keys
        .iter()
        .map(|fk| (fk.column.to_ascii_lowercase(), fk))
        .collect();

    for (key, fk) in &projected_fks {
        match observed_fks.get(key) {
            None => {
                differences.push(SchemaDifference::new(
                    entity_name,
                    IssueType::FkMissing,
                    Severity::Info,
                    format!(
                        "Column '{}' has no FK constraint (use JOIN to query relationship)",
                        fk.column
                    ),
                    json!({
                        "column": fk.column,
                        "expected_references": format!("{}.{}", fk.referenced_table, fk.referenced_column),
                    }),
                ));
            }
            Some(observed_fk) => {
                let table_matches = fk
                    .referenced_table
                    .eq_ignore_ascii_case(&observed_fk.referenced_table);
                let column_matches = fk
                    .referenced_column
                    .eq_ignore_ascii_case(&observed_fk.referenced_column);
                if !table_matches || !column_matches {
                    differences.push(SchemaDifference::new(
                        entity_name,
                        IssueType::FkMismatch,
                        Severity::Warning,
                        format!(
                            "Foreign key on column '{}' references wrong table/column",
                            fk.column
                        ),
                        json!({
                            "column": fk.column,
                            "expected_references": format!("{}.{}", fk.referenced_table, fk.referenced_column),
                            "actual_references": format!("{}.{}", observed_fk.referenced_table, observed_fk.referenced_column),
                        }),
                    ));
                }
            }
        }
    }

    for (key, fk) in &observed_fks {
        if !projected_fks.contains_key(key) {
            differences.push(SchemaDifference::new(
                entity_name,
                IssueType::FkExtra,
                Severity::Info,
                format!("Extra foreign key on column '{}'", fk.column),
                json!({
                    "column": fk.column,
                    "actual_references": format!("{}.{}", fk.referenced_table, fk.referenced_column),
                }),
            ));
        }
    }

    differences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnSpec, ForeignKeySpec};

    fn column(name: &str, db_type: &str, nullable: bool) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            db_type: db_type.to_string(),
            edm_type: None,
            nullable,
            max_length: None,
        }
    }

    fn schema(name: &str, columns: Vec<ColumnSpec>, pk: Option<&str>) -> TableSchema {
        TableSchema {
            entity_name: name.to_string(),
            columns,
            primary_key: pk.map(str::to_string),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    fn comparer() -> SchemaComparer {
        SchemaComparer::new(DbTarget::Sqlite)
    }

    #[test]
    fn test_identical_schemas_produce_no_differences() {
        let projected = HashMap::from([(
            "account".to_string(),
            schema("account", vec![column("accountid", "TEXT", false)], Some("accountid")),
        )]);
        let observed = HashMap::from([(
            "account".to_string(),
            schema("account", vec![column("accountid", "TEXT", false)], Some("accountid")),
        )]);
        assert!(comparer().compare_all(&projected, &observed).is_empty());
    }

    #[test]
    fn test_missing_table_is_info() {
        let projected = HashMap::from([(
            "account".to_string(),
            schema("account", vec![], Some("accountid")),
        )]);
        let diffs = comparer().compare_all(&projected, &HashMap::new());
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].issue_type, IssueType::MissingTable);
        assert_eq!(diffs[0].severity, Severity::Info);
    }

    #[test]
    fn test_extra_table_is_warning() {
        let observed = HashMap::from([(
            "legacy".to_string(),
            schema("legacy", vec![], None),
        )]);
        let diffs = comparer().compare_all(&HashMap::new(), &observed);
        assert_eq!(diffs[0].issue_type, IssueType::ExtraTable);
        assert_eq!(diffs[0].severity, Severity::Warning);
    }

    #[test]
    fn test_type_mismatch_is_error_after_normalization() {
        let projected = HashMap::from([(
            "account".to_string(),
            schema("account", vec![column("revenue", "REAL", true)], None),
        )]);
        let observed = HashMap::from([(
            "account".to_string(),
            schema("account", vec![column("revenue", "TEXT", true)], None),
        )]);
        let diffs = comparer().compare_all(&projected, &observed);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].issue_type, IssueType::TypeMismatch);
        assert_eq!(diffs[0].severity, Severity::Error);
    }

    #[test]
    fn test_type_families_compare_equal() {
        // VARCHAR(160) and TEXT are the same family in SQLite.
        let projected = HashMap::from([(
            "account".to_string(),
            schema("account", vec![column("name", "VARCHAR(160)", true)], None),
        )]);
        let observed = HashMap::from([(
            "account".to_string(),
            schema("account", vec![column("NAME", "text", true)], None),
        )]);
        assert!(comparer().compare_all(&projected, &observed).is_empty());
    }

    #[test]
    fn test_nullable_mismatch_is_warning() {
        let projected = HashMap::from([(
            "account".to_string(),
            schema("account", vec![column("name", "TEXT", false)], None),
        )]);
        let observed = HashMap::from([(
            "account".to_string(),
            schema("account", vec![column("name", "TEXT", true)], None),
        )]);
        let diffs = comparer().compare_all(&projected, &observed);
        assert_eq!(diffs[0].issue_type, IssueType::NullableMismatch);
        assert_eq!(diffs[0].severity, Severity::Warning);
    }

    #[test]
    fn test_pk_mismatch_is_error() {
        let projected = HashMap::from([(
            "account".to_string(),
            schema("account", vec![], Some("accountid")),
        )]);
        let observed = HashMap::from([(
            "account".to_string(),
            schema("account", vec![], Some("row_id")),
        )]);
        let diffs = comparer().compare_all(&projected, &observed);
        assert_eq!(diffs[0].issue_type, IssueType::PkMismatch);
        assert_eq!(diffs[0].severity, Severity::Error);
    }

    #[test]
    fn test_pk_comparison_is_case_insensitive() {
        let projected = HashMap::from([(
            "account".to_string(),
            schema("account", vec![], Some("AccountId")),
        )]);
        let observed = HashMap::from([(
            "account".to_string(),
            schema("account", vec![], Some("accountid")),
        )]);
        assert!(comparer().compare_all(&projected, &observed).is_empty());
    }

    #[test]
    fn test_fk_missing_and_extra() {
        let mut projected_schema = schema("contact", vec![], None);
        projected_schema.foreign_keys.push(ForeignKeySpec {
            column: "_parentcustomerid_value".into(),
            referenced_table: "account".into(),
            referenced_column: "accountid".into(),
        });
        let mut observed_schema = schema("contact", vec![], None);
        observed_schema.foreign_keys.push(ForeignKeySpec {
            column: "legacy_ref".into(),
            referenced_table: "legacy".into(),
            referenced_column: "legacyid".into(),
        });

        let projected = HashMap::from([("contact".to_string(), projected_schema)]);
        let observed = HashMap::from([("contact".to_string(), observed_schema)]);
        let diffs = comparer().compare_all(&projected, &observed);

        assert!(diffs
            .iter()
            .any(|d| d.issue_type == IssueType::FkMissing && d.severity == Severity::Info));
        assert!(diffs
            .iter()
            .any(|d| d.issue_type == IssueType::FkExtra && d.severity == Severity::Info));
    }
}
