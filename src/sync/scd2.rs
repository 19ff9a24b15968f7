//! SCD2 (Slowly Changing Dimension type 2) upsert logic.
//!
//! Every entity row carries `[valid_from, valid_to)` bounds. A change in
//! the canonical payload closes the active version at the newcomer's
//! `valid_from` and opens a new one; an identical payload only refreshes
//! `sync_time`. Canonical payloads are serialized with sorted keys and
//! without `@odata.`-prefixed metadata keys, which change on every fetch
//! without representing a data change.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Row, Sqlite};

use crate::client::JsonRecord;
use crate::error::SyncError;
use crate::metadata::TableSchema;

use super::database::DatabaseManager;
use super::optionset_detector::OptionSetDetector;
use super::optionset_storage::OptionSetStorage;

/// Result of one SCD2 upsert; drives junction-table snapshotting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scd2Result {
    /// True when the business key was never seen before.
    pub is_new_entity: bool,
    /// True when a new version row was inserted (including the first).
    pub version_created: bool,
    pub valid_from: String,
    pub business_key_value: String,
}

/// One fully prepared version row: ordered column values plus the
/// fields the upsert decision needs.
pub struct Scd2Record {
    pub values: Vec<(String, Value)>,
    pub business_key_value: String,
    pub valid_from: String,
    pub json_response: String,
}

/// Serialize a record with sorted keys, dropping volatile OData
/// metadata keys.
pub fn canonicalize_payload(record: &JsonRecord) -> Result<String, SyncError> {
    let clean: BTreeMap<&String, &Value> = record
        .iter()
        .filter(|(key, _)| !key.starts_with("@odata."))
        .collect();
    Ok(serde_json::to_string(&clean)?)
}

fn bind_json_value<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        // Arrays and objects are not column material; store their JSON text.
        other => query.bind(other.to_string()),
    }
}

/// Executes SCD2 upserts against entity tables.
pub struct Scd2Upserter<'a> {
    db: &'a DatabaseManager,
}

impl<'a> Scd2Upserter<'a> {
    pub fn new(db: &'a DatabaseManager) -> Self {
        Self { db }
    }

    async fn insert_version(&self, table_name: &str, record: &Scd2Record) -> Result<(), SyncError> {
        let mut columns: Vec<&str> = record.values.iter().map(|(name, _)| name.as_str()).collect();
        columns.push("valid_to");
        let placeholders = vec!["?"; columns.len()].join(",");
        let sql = format!(
            "INSERT INTO {table_name} ({}) VALUES ({placeholders})",
            columns.join(",")
        );

        let mut query = sqlx::query(&sql);
        for (_, value) in &record.values {
            query = bind_json_value(query, value);
        }
        query = query.bind(None::<String>);
        query.execute(self.db.pool()).await?;
        Ok(())
    }

    /// Insert or update one record with SCD2 semantics.
    pub async fn upsert_scd2(
        &self,
        table_name: &str,
        business_key: &str,
        record: &Scd2Record,
    ) -> Result<Scd2Result, SyncError> {
        let active = sqlx::query(&format!(
            "SELECT row_id, json_response FROM {table_name}
             WHERE {business_key} = ? AND valid_to IS NULL"
        ))
        .bind(&record.business_key_value)
        .fetch_optional(self.db.pool())
        .await?;

        let Some(active) = active else {
            self.insert_version(table_name, record).await?;
            return Ok(Scd2Result {
                is_new_entity: true,
                version_created: true,
                valid_from: record.valid_from.clone(),
                business_key_value: record.business_key_value.clone(),
            });
        };

        let row_id: i64 = active.get("row_id");
        let stored_json: String = active.get("json_response");

        if stored_json == record.json_response {
            // No change: refresh sync_time on the active row only.
            let sync_time = record
                .values
                .iter()
                .find(|(name, _)| name == "sync_time")
                .and_then(|(_, v)| v.as_str())
                .unwrap_or_default()
                .to_string();
            sqlx::query(&format!(
                "UPDATE {table_name} SET sync_time = ? WHERE row_id = ?"
            ))
            .bind(sync_time)
            .bind(row_id)
            .execute(self.db.pool())
            .await?;

            return Ok(Scd2Result {
                is_new_entity: false,
                version_created: false,
                valid_from: record.valid_from.clone(),
                business_key_value: record.business_key_value.clone(),
            });
        }

        // Payload changed: close the active version and open a new one.
        sqlx::query(&format!(
            "UPDATE {table_name} SET valid_to = ? WHERE row_id = ?"
        ))
        .bind(&record.valid_from)
        .bind(row_id)
        .execute(self.db.pool())
        .await?;
        self.insert_version(table_name, record).await?;

        Ok(Scd2Result {
            is_new_entity: false,
            version_created: true,
            valid_from: record.valid_from.clone(),
            business_key_value: record.business_key_value.clone(),
        })
    }

    /// Upsert a batch of API records: detect option sets, project schema
    /// columns (multi-selects live only in junction tables), canonicalize
    /// the payload, apply SCD2, then populate option-set storage.
    ///
    /// Returns `(records_added, records_updated)`.
    pub async fn upsert_batch(
        &self,
        table_name: &str,
        primary_key: &str,
        schema: &TableSchema,
        api_records: &[JsonRecord],
    ) -> Result<(u64, u64), SyncError> {
        let optionsets = OptionSetStorage::new(self.db);
        let mut added = 0u64;
        let mut updated = 0u64;

        for api_record in api_records {
            let entity_id = match api_record.get(primary_key) {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => continue,
            };

            let detected = OptionSetDetector::detect_from_record(api_record);

            let mut values: Vec<(String, Value)> = Vec::new();
            for col in &schema.columns {
                let Some(value) = api_record.get(&col.name) else {
                    continue;
                };
                if detected
                    .get(&col.name)
                    .is_some_and(|set| set.is_multi_select)
                {
                    continue;
                }
                values.push((col.name.clone(), value.clone()));
            }

            let now = Utc::now().to_rfc3339();
            let json_response = canonicalize_payload(api_record)?;
            let valid_from = api_record
                .get("modifiedon")
                .and_then(Value::as_str)
                .unwrap_or(&now)
                .to_string();

            values.push(("json_response".to_string(), Value::String(json_response.clone())));
            values.push(("sync_time".to_string(), Value::String(now.clone())));
            values.push(("valid_from".to_string(), Value::String(valid_from.clone())));

            let record = Scd2Record {
                values,
                business_key_value: entity_id.clone(),
                valid_from,
                json_response,
            };

            let result = self.upsert_scd2(table_name, primary_key, &record).await?;
            if result.is_new_entity {
                added += 1;
            } else if result.version_created {
                updated += 1;
            }

            if !detected.is_empty() {
                optionsets
                    .populate_detected_option_sets(
                        &detected,
                        table_name,
                        &entity_id,
                        primary_key,
                        &result,
                    )
                    .await?;
            }
        }

        Ok((added, updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ColumnSpec;
    use serde_json::json;

    fn column(name: &str, db_type: &str) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            db_type: db_type.to_string(),
            edm_type: None,
            nullable: true,
            max_length: None,
        }
    }

    fn account_schema() -> TableSchema {
        TableSchema {
            entity_name: "account".into(),
            columns: vec![
                column("accountid", "TEXT"),
                column("name", "TEXT"),
                column("statuscode", "INTEGER"),
                column("modifiedon", "TEXT"),
            ],
            primary_key: Some("accountid".into()),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    async fn setup() -> DatabaseManager {
        let db = DatabaseManager::open_in_memory().await.unwrap();
        db.execute(
            "CREATE TABLE accounts (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                accountid TEXT,
                name TEXT,
                statuscode INTEGER,
                modifiedon TEXT,
                json_response TEXT NOT NULL,
                sync_time TEXT NOT NULL,
                valid_from TEXT,
                valid_to TEXT
            )",
        )
        .await
        .unwrap();
        db
    }

    fn record(pairs: &[(&str, Value)]) -> JsonRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_canonicalize_strips_odata_keys_and_sorts() {
        let rec = record(&[
            ("name", json!("Acme")),
            ("@odata.etag", json!("W/\"12345\"")),
            ("accountid", json!("a1")),
        ]);
        let canonical = canonicalize_payload(&rec).unwrap();
        assert_eq!(canonical, r#"{"accountid":"a1","name":"Acme"}"#);

        // Two payloads differing only in @odata. keys are equal.
        let rec2 = record(&[
            ("accountid", json!("a1")),
            ("name", json!("Acme")),
            ("@odata.etag", json!("W/\"99999\"")),
        ]);
        assert_eq!(canonical, canonicalize_payload(&rec2).unwrap());
    }

    #[tokio::test]
    async fn test_first_upsert_creates_active_version() {
        let db = setup().await;
        let upserter = Scd2Upserter::new(&db);
        let records = vec![record(&[
            ("accountid", json!("a1")),
            ("name", json!("Acme")),
            ("modifiedon", json!("2025-06-01T00:00:00Z")),
        ])];

        let (added, updated) = upserter
            .upsert_batch("accounts", "accountid", &account_schema(), &records)
            .await
            .unwrap();
        assert_eq!((added, updated), (1, 0));

        let row = sqlx::query("SELECT valid_from, valid_to FROM accounts WHERE accountid = 'a1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("valid_from"), "2025-06-01T00:00:00Z");
        assert_eq!(row.get::<Option<String>, _>("valid_to"), None);
    }

    #[tokio::test]
    async fn test_unchanged_record_only_refreshes_sync_time() {
        let db = setup().await;
        let upserter = Scd2Upserter::new(&db);
        let records = vec![record(&[
            ("accountid", json!("a1")),
            ("name", json!("Acme")),
            ("modifiedon", json!("2025-06-01T00:00:00Z")),
        ])];
        let schema = account_schema();

        upserter.upsert_batch("accounts", "accountid", &schema, &records).await.unwrap();
        let (added, updated) = upserter
            .upsert_batch("accounts", "accountid", &schema, &records)
            .await
            .unwrap();
        assert_eq!((added, updated), (0, 0));

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM accounts")
            .fetch_one(db.pool())
            .await
            .unwrap()
            .get("n");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_changed_record_creates_new_version() {
        let db = setup().await;
        let upserter = Scd2Upserter::new(&db);
        let schema = account_schema();

        upserter
            .upsert_batch(
                "accounts",
                "accountid",
                &schema,
                &[record(&[
                    ("accountid", json!("a1")),
                    ("name", json!("Acme")),
                    ("modifiedon", json!("2025-06-01T00:00:00Z")),
                ])],
            )
            .await
            .unwrap();

        let (added, updated) = upserter
            .upsert_batch(
                "accounts",
                "accountid",
                &schema,
                &[record(&[
                    ("accountid", json!("a1")),
                    ("name", json!("Acme Corp")),
                    ("modifiedon", json!("2025-06-02T00:00:00Z")),
                ])],
            )
            .await
            .unwrap();
        assert_eq!((added, updated), (0, 1));

        // History stays contiguous: the closed version ends where the
        // new one begins.
        let rows = sqlx::query(
            "SELECT name, valid_from, valid_to FROM accounts WHERE accountid = 'a1' ORDER BY row_id",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get::<String, _>("name"), "Acme");
        assert_eq!(
            rows[0].get::<Option<String>, _>("valid_to").as_deref(),
            Some("2025-06-02T00:00:00Z")
        );
        assert_eq!(rows[1].get::<String, _>("name"), "Acme Corp");
        assert_eq!(rows[1].get::<String, _>("valid_from"), "2025-06-02T00:00:00Z");
        assert_eq!(rows[1].get::<Option<String>, _>("valid_to"), None);
    }

    #[tokio::test]
    async fn test_metadata_only_change_is_not_a_version() {
        let db = setup().await;
        let upserter = Scd2Upserter::new(&db);
        let schema = account_schema();

        upserter
            .upsert_batch(
                "accounts",
                "accountid",
                &schema,
                &[record(&[
                    ("accountid", json!("a1")),
                    ("name", json!("Acme")),
                    ("@odata.etag", json!("W/\"1\"")),
                ])],
            )
            .await
            .unwrap();
        let (added, updated) = upserter
            .upsert_batch(
                "accounts",
                "accountid",
                &schema,
                &[record(&[
                    ("accountid", json!("a1")),
                    ("name", json!("Acme")),
                    ("@odata.etag", json!("W/\"2\"")),
                ])],
            )
            .await
            .unwrap();
        assert_eq!((added, updated), (0, 0));
    }

    #[tokio::test]
    async fn test_multi_select_column_not_materialized() {
        let db = setup().await;
        db.execute("ALTER TABLE accounts ADD COLUMN categories TEXT")
            .await
            .unwrap();
        let mut schema = account_schema();
        schema.columns.push(column("categories", "TEXT"));

        let upserter = Scd2Upserter::new(&db);
        upserter
            .upsert_batch(
                "accounts",
                "accountid",
                &schema,
                &[record(&[
                    ("accountid", json!("a1")),
                    ("name", json!("Acme")),
                    ("categories", json!("1,2,3")),
                    (
                        "categories@OData.Community.Display.V1.FormattedValue",
                        json!("Tech;Health;Finance"),
                    ),
                    ("modifiedon", json!("2025-06-01T00:00:00Z")),
                ])],
            )
            .await
            .unwrap();

        let row = sqlx::query("SELECT categories FROM accounts WHERE accountid = 'a1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<Option<String>, _>("categories"), None);

        let junction: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM _junction_accounts_categories
             WHERE entity_id = 'a1' AND valid_to IS NULL",
        )
        .fetch_one(db.pool())
        .await
        .unwrap()
        .get("n");
        assert_eq!(junction, 3);

        let labels: i64 = sqlx::query("SELECT COUNT(*) AS n FROM _optionset_categories")
            .fetch_one(db.pool())
            .await
            .unwrap()
            .get("n");
        assert_eq!(labels, 3);
    }

    #[tokio::test]
    async fn test_records_without_business_key_are_skipped() {
        let db = setup().await;
        let upserter = Scd2Upserter::new(&db);
        let (added, updated) = upserter
            .upsert_batch(
                "accounts",
                "accountid",
                &account_schema(),
                &[record(&[("name", json!("Orphan"))])],
            )
            .await
            .unwrap();
        assert_eq!((added, updated), (0, 0));
    }
}
