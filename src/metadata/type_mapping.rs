//! OData `Edm.*` type mapping and storage-type normalization.
//!
//! Two target families are supported: SQLite (the sync store) and
//! PostgreSQL (schema comparison only). Normalization collapses type
//! aliases and length qualifiers into a canonical family name and is
//! used solely by the schema comparer.

use std::str::FromStr;

use crate::error::SyncError;

/// Target database family for type mapping and normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbTarget {
    Sqlite,
    Postgres,
}

impl DbTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgresql",
        }
    }
}

impl FromStr for DbTarget {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgresql" | "postgres" => Ok(Self::Postgres),
            other => Err(SyncError::Config(format!("unsupported database type: {other}"))),
        }
    }
}

impl std::fmt::Display for DbTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn edm_to_sqlite(edm_type: &str) -> Option<&'static str> {
    Some(match edm_type {
        "Edm.String" => "TEXT",
        "Edm.Int16" | "Edm.Int32" | "Edm.Int64" => "INTEGER",
        "Edm.Decimal" | "Edm.Double" => "REAL",
        "Edm.Boolean" => "INTEGER",
        "Edm.DateTimeOffset" | "Edm.Date" | "Edm.TimeOfDay" => "TEXT",
        "Edm.Guid" => "TEXT",
        "Edm.Binary" => "BLOB",
        _ => return None,
    })
}

fn edm_to_postgres(edm_type: &str) -> Option<&'static str> {
    Some(match edm_type {
        "Edm.String" => "VARCHAR",
        "Edm.Int16" => "SMALLINT",
        "Edm.Int32" => "INTEGER",
        "Edm.Int64" => "BIGINT",
        "Edm.Decimal" => "NUMERIC",
        "Edm.Double" => "DOUBLE PRECISION",
        "Edm.Boolean" => "BOOLEAN",
        "Edm.DateTimeOffset" => "TIMESTAMP WITH TIME ZONE",
        "Edm.Date" => "DATE",
        "Edm.TimeOfDay" => "TIME",
        "Edm.Guid" => "UUID",
        "Edm.Binary" => "BYTEA",
        _ => return None,
    })
}

/// Map an Edm type to a storage type for the given target.
///
/// Option-set fields arrive as `Edm.String` in $metadata but carry
/// integer codes on the wire, so `is_option_set` forces the integer
/// storage type. Unknown Edm types fall back to the text type.
pub fn map_edm_to_db_type(
    edm_type: &str,
    target: DbTarget,
    max_length: Option<u32>,
    is_option_set: bool,
) -> String {
    if is_option_set && edm_type == "Edm.String" {
        return match target {
            DbTarget::Sqlite => "INTEGER".to_string(),
            DbTarget::Postgres => "INTEGER".to_string(),
        };
    }

    match target {
        DbTarget::Sqlite => edm_to_sqlite(edm_type).unwrap_or("TEXT").to_string(),
        DbTarget::Postgres => {
            let base = edm_to_postgres(edm_type).unwrap_or("TEXT");
            if base == "VARCHAR" {
                // Bounded strings keep their length; unbounded become TEXT.
                match max_length {
                    Some(n) => format!("VARCHAR({n})"),
                    None => "TEXT".to_string(),
                }
            } else {
                base.to_string()
            }
        }
    }
}

/// Normalize a storage type for comparison: strip length qualifiers,
/// case-fold, and collapse family aliases to one canonical name.
pub fn normalize_db_type(db_type: &str, target: DbTarget) -> String {
    let mut normalized = db_type.trim().to_ascii_uppercase();
    if let Some(pos) = normalized.find('(') {
        normalized.truncate(pos);
        normalized = normalized.trim().to_string();
    }

    match target {
        DbTarget::Sqlite => match normalized.as_str() {
            "VARCHAR" | "CHAR" | "NVARCHAR" | "NCHAR" | "CLOB" => "TEXT".to_string(),
            "INT" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "BIGINT" => "INTEGER".to_string(),
            "DOUBLE" | "FLOAT" | "NUMERIC" | "DECIMAL" => "REAL".to_string(),
            "BINARY" | "VARBINARY" => "BLOB".to_string(),
            _ => normalized,
        },
        DbTarget::Postgres => match normalized.as_str() {
            "CHARACTER VARYING" | "CHAR" | "CHARACTER" | "VARCHAR" => "TEXT".to_string(),
            "INT" | "INT4" => "INTEGER".to_string(),
            "INT2" => "SMALLINT".to_string(),
            "INT8" => "BIGINT".to_string(),
            "FLOAT8" | "DOUBLE PRECISION" => "DOUBLE PRECISION".to_string(),
            "FLOAT4" => "REAL".to_string(),
            "BOOL" => "BOOLEAN".to_string(),
            "TIMESTAMPTZ" => "TIMESTAMP WITH TIME ZONE".to_string(),
            _ => normalized,
        },
    }
}
