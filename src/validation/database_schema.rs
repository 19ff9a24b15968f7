//! Observed-schema readers for the local stores.
//!
//! SQLite is inspected through PRAGMA commands; PostgreSQL through
//! `information_schema`. The PostgreSQL variant is query-only and exists
//! for the schema-comparison path.

use std::collections::HashMap;

use sqlx::{PgPool, Row, SqlitePool};

use crate::error::SyncError;
use crate::metadata::{ColumnSpec, ForeignKeySpec, TableSchema};

/// Reads table schemas as they exist in the configured database.
pub enum DatabaseSchemaReader {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl DatabaseSchemaReader {
    pub fn from_sqlite(pool: SqlitePool) -> Self {
        Self::Sqlite(pool)
    }

    /// Open a standalone read connection to a SQLite database file. A
    /// missing file reads as an empty schema set rather than an error.
    pub async fn connect_sqlite(path: &str) -> Result<Self, SyncError> {
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self::Sqlite(pool))
    }

    pub async fn connect_postgres(connection_string: &str) -> Result<Self, SyncError> {
        let pool = PgPool::connect(connection_string).await?;
        Ok(Self::Postgres(pool))
    }

    /// Read schemas for the named tables. Tables that do not exist are
    /// simply absent from the result.
    pub async fn read_schemas(
        &self,
        table_names: &[String],
    ) -> Result<HashMap<String, TableSchema>, SyncError> {
        match self {
            Self::Sqlite(pool) => read_sqlite_schemas(pool, table_names).await,
            Self::Postgres(pool) => read_postgres_schemas(pool, table_names).await,
        }
    }
}

async fn read_sqlite_schemas(
    pool: &SqlitePool,
    table_names: &[String],
) -> Result<HashMap<String, TableSchema>, SyncError> {
    let mut schemas = HashMap::new();

    for table in table_names {
        let exists =
            sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(pool)
                .await?
                .is_some();
        if !exists {
            continue;
        }

        let mut schema = TableSchema::new(table.clone());

        let rows = sqlx::query(&format!("PRAGMA table_info('{table}')"))
            .fetch_all(pool)
            .await?;
        for row in rows {
            let name: String = row.get("name");
            let db_type: String = row.get("type");
            let not_null: i64 = row.get("notnull");
            let pk: i64 = row.get("pk");

            if pk == 1 && schema.primary_key.is_none() {
                schema.primary_key = Some(name.clone());
            }
            schema.columns.push(ColumnSpec {
                name,
                db_type,
                edm_type: None,
                nullable: not_null == 0,
                max_length: None,
            });
        }

        let fk_rows = sqlx::query(&format!("PRAGMA foreign_key_list('{table}')"))
            .fetch_all(pool)
            .await?;
        for row in fk_rows {
            // "to" is NULL when the constraint references an implicit
            // primary key.
            let referenced_column: Option<String> = row.get("to");
            schema.foreign_keys.push(ForeignKeySpec {
                column: row.get("from"),
                referenced_table: row.get("table"),
                referenced_column: referenced_column.unwrap_or_default(),
            });
        }

        schemas.insert(table.clone(), schema);
    }

    Ok(schemas)
}

async fn read_postgres_schemas(
    pool: &PgPool,
    table_names: &[String],
) -> Result<HashMap<String, TableSchema>, SyncError> {
    let mut schemas = HashMap::new();

    for table in table_names {
        let exists = sqlx::query(
            "SELECT table_name FROM information_schema.tables
             WHERE table_name = $1 AND table_schema = 'public'",
        )
        .bind(table)
        .fetch_optional(pool)
        .await?
        .is_some();
        if !exists {
            continue;
        }

        let mut schema = TableSchema::new(table.clone());

        let rows = sqlx::query(
            "SELECT column_name, data_type, is_nullable, character_maximum_length
             FROM information_schema.columns
             WHERE table_name = $1 AND table_schema = 'public'
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(pool)
        .await?;
        for row in rows {
            let max_length: Option<i32> = row.get("character_maximum_length");
            let nullable: String = row.get("is_nullable");
            schema.columns.push(ColumnSpec {
                name: row.get("column_name"),
                db_type: row.get("data_type"),
                edm_type: None,
                nullable: nullable == "YES",
                max_length: max_length.and_then(|n| u32::try_from(n).ok()),
            });
        }

        let pk_row = sqlx::query(
            "SELECT kcu.column_name
             FROM information_schema.table_constraints tc
             JOIN information_schema.key_column_usage kcu
               ON tc.constraint_name = kcu.constraint_name
             WHERE tc.table_name = $1
               AND tc.constraint_type = 'PRIMARY KEY'
               AND tc.table_schema = 'public'",
        )
        .bind(table)
        .fetch_optional(pool)
        .await?;
        if let Some(row) = pk_row {
            schema.primary_key = Some(row.get("column_name"));
        }

        let fk_rows = sqlx::query(
            "SELECT kcu.column_name,
                    ccu.table_name AS foreign_table_name,
                    ccu.column_name AS foreign_column_name
             FROM information_schema.table_constraints AS tc
             JOIN information_schema.key_column_usage AS kcu
               ON tc.constraint_name = kcu.constraint_name
              AND tc.table_schema = kcu.table_schema
             JOIN information_schema.constraint_column_usage AS ccu
               ON ccu.constraint_name = tc.constraint_name
              AND ccu.table_schema = tc.table_schema
             WHERE tc.constraint_type = 'FOREIGN KEY'
               AND tc.table_name = $1
               AND tc.table_schema = 'public'",
        )
        .bind(table)
        .fetch_all(pool)
        .await?;
        for row in fk_rows {
            schema.foreign_keys.push(ForeignKeySpec {
                column: row.get("column_name"),
                referenced_table: row.get("foreign_table_name"),
                referenced_column: row.get("foreign_column_name"),
            });
        }

        schemas.insert(table.clone(), schema);
    }

    Ok(schemas)
}
