//! Entity table creation from authoritative $metadata schemas.
//!
//! Every entity table gets a `row_id` surrogate as its physical primary
//! key; the business key from $metadata becomes an indexed non-unique
//! column so SCD2 can keep multiple versions per entity.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::config::EntityConfig;
use crate::error::SyncError;
use crate::metadata::TableSchema;

use super::database::DatabaseManager;

/// Generate the CREATE TABLE statement for an entity table, including
/// the SCD2 system columns.
pub fn generate_create_table_sql(table_name: &str, schema: &TableSchema) -> String {
    let mut column_defs = vec!["  row_id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];

    for col in &schema.columns {
        let mut def = format!("  {} {}", col.name, col.db_type);
        if !col.nullable {
            def.push_str(" NOT NULL");
        }
        column_defs.push(def);
    }

    column_defs.push("  json_response TEXT NOT NULL".to_string());
    column_defs.push("  sync_time TEXT NOT NULL".to_string());
    column_defs.push("  valid_from TEXT".to_string());
    column_defs.push("  valid_to TEXT".to_string());

    format!(
        "CREATE TABLE IF NOT EXISTS {table_name} (\n{}\n);",
        column_defs.join(",\n")
    )
}

/// Create tables and indexes for entities that do not exist yet.
pub async fn initialize_tables(
    db: &DatabaseManager,
    entities: &[EntityConfig],
    schemas: &HashMap<String, TableSchema>,
) -> Result<(), SyncError> {
    for entity in entities {
        let Some(schema) = schemas.get(&entity.name) else {
            warn!(entity = %entity.name, "skipping table creation, entity not found in $metadata");
            continue;
        };

        let table_name = &entity.api_name;
        if db.table_exists(table_name).await? {
            info!(table = %table_name, "table already exists, skipping");
            continue;
        }

        info!(
            table = %table_name,
            columns = schema.columns.len(),
            "creating entity table"
        );
        db.execute(&generate_create_table_sql(table_name, schema)).await?;

        if schema.has_column("modifiedon") {
            db.create_index(table_name, "modifiedon").await?;
        }
        if schema.has_column("createdon") {
            db.create_index(table_name, "createdon").await?;
        }

        // SCD2 indexes: business key for lookups, (business_key, valid_to)
        // for active-version queries. The declared PK may not exist as a
        // column (metadata quirk), in which case only valid_to is indexed.
        if let Some(pk) = schema.primary_key.as_deref() {
            if schema.has_column(pk) {
                db.create_index(table_name, pk).await?;
                db.execute(&format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table_name}_{pk}_valid_to
                     ON {table_name}({pk}, valid_to)"
                ))
                .await?;
            }
        }
        db.create_index(table_name, "valid_to").await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ColumnSpec;
    use sqlx::Row;

    fn column(name: &str, db_type: &str, nullable: bool) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            db_type: db_type.to_string(),
            edm_type: None,
            nullable,
            max_length: None,
        }
    }

    fn account_schema() -> TableSchema {
        TableSchema {
            entity_name: "account".into(),
            columns: vec![
                column("accountid", "TEXT", false),
                column("name", "TEXT", true),
                column("statuscode", "INTEGER", true),
                column("modifiedon", "TEXT", true),
            ],
            primary_key: Some("accountid".into()),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    #[test]
    fn test_create_table_sql_shape() {
        let sql = generate_create_table_sql("accounts", &account_schema());
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS accounts ("));
        assert!(sql.contains("row_id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("accountid TEXT NOT NULL"));
        assert!(sql.contains("json_response TEXT NOT NULL"));
        assert!(sql.contains("valid_to TEXT"));
        // The business key must not be the physical primary key.
        assert!(!sql.contains("accountid TEXT PRIMARY KEY"));
    }

    #[tokio::test]
    async fn test_initialize_tables_creates_table_and_indexes() {
        let db = DatabaseManager::open_in_memory().await.unwrap();
        let entities = vec![EntityConfig {
            name: "account".into(),
            api_name: "accounts".into(),
            filtered: false,
            description: String::new(),
        }];
        let schemas = HashMap::from([("account".to_string(), account_schema())]);

        initialize_tables(&db, &entities, &schemas).await.unwrap();
        assert!(db.table_exists("accounts").await.unwrap());

        let indexes: Vec<String> =
            sqlx::query("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'accounts'")
                .fetch_all(db.pool())
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.get("name"))
                .collect();
        assert!(indexes.contains(&"idx_accounts_modifiedon".to_string()));
        assert!(indexes.contains(&"idx_accounts_accountid".to_string()));
        assert!(indexes.contains(&"idx_accounts_accountid_valid_to".to_string()));
        assert!(indexes.contains(&"idx_accounts_valid_to".to_string()));

        // Second call is a no-op.
        initialize_tables(&db, &entities, &schemas).await.unwrap();
    }
}
