//! Option-set lookup tables and temporal junction tables.
//!
//! Lookup tables (`_optionset_<field>`) are monotonic: one row per code,
//! labels overwritten in place, `first_seen` never moves. Junction
//! tables (`_junction_<entity>_<field>`) mirror the parent entity's SCD2
//! contract and are snapshotted only when the parent version changes.

use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::Row;
use tracing::info;

use crate::error::SyncError;

use super::database::DatabaseManager;
use super::optionset_detector::DetectedOptionSet;
use super::scd2::Scd2Result;

pub struct OptionSetStorage<'a> {
    db: &'a DatabaseManager,
}

impl<'a> OptionSetStorage<'a> {
    pub fn new(db: &'a DatabaseManager) -> Self {
        Self { db }
    }

    /// Create the lookup table for a field on first encounter.
    pub async fn ensure_optionset_table(&self, field_name: &str) -> Result<(), SyncError> {
        let table_name = format!("_optionset_{field_name}");
        if self.db.table_exists(&table_name).await? {
            return Ok(());
        }

        self.db
            .execute(&format!(
                "CREATE TABLE {table_name} (
                    code INTEGER PRIMARY KEY,
                    label TEXT NOT NULL,
                    first_seen TEXT NOT NULL
                )"
            ))
            .await?;
        info!(table = %table_name, "created option set lookup table");
        Ok(())
    }

    /// Create the junction table for a multi-select field on first
    /// encounter, with the SCD2 index set.
    pub async fn ensure_junction_table(
        &self,
        entity_name: &str,
        field_name: &str,
        entity_pk: &str,
    ) -> Result<(), SyncError> {
        let table_name = format!("_junction_{entity_name}_{field_name}");
        if self.db.table_exists(&table_name).await? {
            return Ok(());
        }

        let lookup_table = format!("_optionset_{field_name}");
        self.db
            .execute(&format!(
                "CREATE TABLE {table_name} (
                    junction_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_id TEXT NOT NULL,
                    option_code INTEGER NOT NULL,
                    valid_from TEXT NOT NULL,
                    valid_to TEXT,
                    FOREIGN KEY (entity_id) REFERENCES {entity_name}({entity_pk}),
                    FOREIGN KEY (option_code) REFERENCES {lookup_table}(code)
                )"
            ))
            .await?;

        self.db.create_index(&table_name, "entity_id").await?;
        self.db
            .execute(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table_name}_entity_id_valid_to
                 ON {table_name}(entity_id, valid_to)"
            ))
            .await?;
        self.db.create_index(&table_name, "valid_to").await?;

        info!(table = %table_name, "created junction table with temporal tracking");
        Ok(())
    }

    /// Insert or update one code in a lookup table. Label edits
    /// overwrite in place; `first_seen` is preserved.
    pub async fn upsert_option_set_value(
        &self,
        field_name: &str,
        code: i64,
        label: &str,
    ) -> Result<(), SyncError> {
        self.ensure_optionset_table(field_name).await?;
        let table_name = format!("_optionset_{field_name}");

        let existing = sqlx::query(&format!("SELECT label FROM {table_name} WHERE code = ?"))
            .bind(code)
            .fetch_optional(self.db.pool())
            .await?;

        match existing {
            Some(row) => {
                let current: String = row.get("label");
                if current != label {
                    sqlx::query(&format!("UPDATE {table_name} SET label = ? WHERE code = ?"))
                        .bind(label)
                        .bind(code)
                        .execute(self.db.pool())
                        .await?;
                }
            }
            None => {
                sqlx::query(&format!(
                    "INSERT INTO {table_name} (code, label, first_seen) VALUES (?, ?, ?)"
                ))
                .bind(code)
                .bind(label)
                .bind(Utc::now().to_rfc3339())
                .execute(self.db.pool())
                .await?;
            }
        }
        Ok(())
    }

    /// Snapshot the junction rows for one entity: close every active row
    /// at `valid_from` and insert a fresh open row per current code.
    pub async fn snapshot_junction_relationships(
        &self,
        table_name: &str,
        entity_id: &str,
        option_codes: &[i64],
        valid_from: &str,
    ) -> Result<(), SyncError> {
        sqlx::query(&format!(
            "UPDATE {table_name} SET valid_to = ? WHERE entity_id = ? AND valid_to IS NULL"
        ))
        .bind(valid_from)
        .bind(entity_id)
        .execute(self.db.pool())
        .await?;

        for code in option_codes {
            sqlx::query(&format!(
                "INSERT INTO {table_name} (entity_id, option_code, valid_from, valid_to)
                 VALUES (?, ?, ?, NULL)"
            ))
            .bind(entity_id)
            .bind(code)
            .bind(valid_from)
            .execute(self.db.pool())
            .await?;
        }
        Ok(())
    }

    /// Populate lookup and junction tables from the option sets detected
    /// in one record. Junction rows are only touched when the parent
    /// entity produced a new SCD2 version.
    pub async fn populate_detected_option_sets(
        &self,
        detected: &BTreeMap<String, DetectedOptionSet>,
        entity_name: &str,
        entity_id: &str,
        entity_pk: &str,
        scd2_result: &Scd2Result,
    ) -> Result<(), SyncError> {
        for (field_name, option_set) in detected {
            if option_set.is_multi_select {
                self.ensure_optionset_table(field_name).await?;
                self.ensure_junction_table(entity_name, field_name, entity_pk).await?;

                for (code, label) in &option_set.codes_and_labels {
                    self.upsert_option_set_value(field_name, *code, label).await?;
                }

                if scd2_result.version_created {
                    let table_name = format!("_junction_{entity_name}_{field_name}");
                    let codes: Vec<i64> = option_set.codes_and_labels.keys().copied().collect();
                    self.snapshot_junction_relationships(
                        &table_name,
                        entity_id,
                        &codes,
                        &scd2_result.valid_from,
                    )
                    .await?;
                }
            } else {
                self.ensure_optionset_table(field_name).await?;
                for (code, label) in &option_set.codes_and_labels {
                    self.upsert_option_set_value(field_name, *code, label).await?;
                }
            }
        }
        Ok(())
    }
}

/// Scan a synced database for option-set lookup tables and map their
/// fields back to configured entities. Only INTEGER-typed entity columns
/// qualify: TEXT columns are multi-selects, which stay in junction
/// tables and must not be overridden on the entity.
pub async fn extract_optionset_config(
    db: &DatabaseManager,
    entities: &[crate::config::EntityConfig],
) -> Result<BTreeMap<String, Vec<String>>, SyncError> {
    let lookup_tables: Vec<String> =
        sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name GLOB '_optionset_*' ORDER BY name")
            .fetch_all(db.pool())
            .await?
            .into_iter()
            .map(|r| r.get("name"))
            .collect();

    if lookup_tables.is_empty() {
        info!("no option set tables found in database");
        return Ok(BTreeMap::new());
    }
    info!(count = lookup_tables.len(), "found option set tables");

    let mut config: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for table in &lookup_tables {
        let Some(field_name) = table.strip_prefix("_optionset_") else {
            continue;
        };

        for entity in entities {
            if !db.table_exists(&entity.api_name).await? {
                continue;
            }

            let columns =
                sqlx::query(&format!("PRAGMA table_info('{}')", entity.api_name))
                    .fetch_all(db.pool())
                    .await?;
            let matching = columns.iter().find(|row| {
                let name: String = row.get("name");
                name == field_name
            });
            let Some(row) = matching else {
                continue;
            };

            let column_type: String = row.get("type");
            if !column_type.eq_ignore_ascii_case("INTEGER") {
                info!(
                    entity = %entity.api_name,
                    field = field_name,
                    column_type = %column_type,
                    "skipping non-integer option set field"
                );
                continue;
            }

            config
                .entry(entity.name.clone())
                .or_default()
                .push(field_name.to_string());
        }
    }

    for fields in config.values_mut() {
        fields.sort();
        fields.dedup();
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> DatabaseManager {
        let db = DatabaseManager::open_in_memory().await.unwrap();
        db.execute("CREATE TABLE accounts (row_id INTEGER PRIMARY KEY, accountid TEXT)")
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn test_lookup_table_preserves_first_seen() {
        let db = setup().await;
        let storage = OptionSetStorage::new(&db);

        storage.upsert_option_set_value("statuscode", 1, "Active").await.unwrap();
        let first_seen: String =
            sqlx::query("SELECT first_seen FROM _optionset_statuscode WHERE code = 1")
                .fetch_one(db.pool())
                .await
                .unwrap()
                .get("first_seen");

        // Label edit overwrites in place, first_seen does not move.
        storage.upsert_option_set_value("statuscode", 1, "Enabled").await.unwrap();
        let row = sqlx::query("SELECT label, first_seen FROM _optionset_statuscode WHERE code = 1")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("label"), "Enabled");
        assert_eq!(row.get::<String, _>("first_seen"), first_seen);

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM _optionset_statuscode")
            .fetch_one(db.pool())
            .await
            .unwrap()
            .get("n");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_extract_optionset_config_keeps_integer_fields() {
        let db = DatabaseManager::open_in_memory().await.unwrap();
        db.execute(
            "CREATE TABLE accounts (row_id INTEGER PRIMARY KEY, accountid TEXT,
             statuscode INTEGER, categories TEXT)",
        )
        .await
        .unwrap();
        let storage = OptionSetStorage::new(&db);
        storage.ensure_optionset_table("statuscode").await.unwrap();
        storage.ensure_optionset_table("categories").await.unwrap();

        let entities = vec![crate::config::EntityConfig {
            name: "account".into(),
            api_name: "accounts".into(),
            filtered: false,
            description: String::new(),
        }];

        let config = extract_optionset_config(&db, &entities).await.unwrap();
        // categories is TEXT (multi-select), only statuscode qualifies.
        assert_eq!(
            config,
            BTreeMap::from([("account".to_string(), vec!["statuscode".to_string()])])
        );
    }

    #[tokio::test]
    async fn test_junction_snapshot_closes_and_reopens() {
        let db = setup().await;
        let storage = OptionSetStorage::new(&db);
        storage.ensure_optionset_table("categories").await.unwrap();
        storage
            .ensure_junction_table("accounts", "categories", "accountid")
            .await
            .unwrap();

        storage
            .snapshot_junction_relationships(
                "_junction_accounts_categories",
                "a1",
                &[1, 2, 3],
                "2025-06-01T00:00:00Z",
            )
            .await
            .unwrap();
        storage
            .snapshot_junction_relationships(
                "_junction_accounts_categories",
                "a1",
                &[3, 4],
                "2025-06-02T00:00:00Z",
            )
            .await
            .unwrap();

        let active: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM _junction_accounts_categories
             WHERE entity_id = 'a1' AND valid_to IS NULL",
        )
        .fetch_one(db.pool())
        .await
        .unwrap()
        .get("n");
        assert_eq!(active, 2);

        let closed: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM _junction_accounts_categories
             WHERE entity_id = 'a1' AND valid_to = '2025-06-02T00:00:00Z'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap()
        .get("n");
        assert_eq!(closed, 3);
    }
}
