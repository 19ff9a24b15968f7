//! Schema record types shared by the parser, comparer and storage layer.
//!
//! Name comparisons between projected (Dataverse) and observed (database)
//! schemas are case-insensitive, so the equality of these values embeds
//! that rule instead of repeating it at every call site.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A single column projected from $metadata or observed in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub db_type: String,
    pub edm_type: Option<String>,
    pub nullable: bool,
    pub max_length: Option<u32>,
}

impl PartialEq for ColumnSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.db_type.eq_ignore_ascii_case(&other.db_type)
            && self.nullable == other.nullable
            && self.max_length == other.max_length
    }
}

impl Eq for ColumnSpec {}

impl Hash for ColumnSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.to_ascii_lowercase().hash(state);
        self.db_type.to_ascii_uppercase().hash(state);
        self.nullable.hash(state);
        self.max_length.hash(state);
    }
}

/// A foreign-key relationship, authoritative or inferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeySpec {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

impl PartialEq for ForeignKeySpec {
    fn eq(&self, other: &Self) -> bool {
        self.column.eq_ignore_ascii_case(&other.column)
            && self
                .referenced_table
                .eq_ignore_ascii_case(&other.referenced_table)
            && self
                .referenced_column
                .eq_ignore_ascii_case(&other.referenced_column)
    }
}

impl Eq for ForeignKeySpec {}

impl Hash for ForeignKeySpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.column.to_ascii_lowercase().hash(state);
        self.referenced_table.to_ascii_lowercase().hash(state);
        self.referenced_column.to_ascii_lowercase().hash(state);
    }
}

/// A database index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

/// Complete schema for one entity or table.
///
/// `primary_key` is the business key from $metadata, distinct from the
/// `row_id` surrogate the storage layer adds for SCD2 versioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub entity_name: String,
    pub columns: Vec<ColumnSpec>,
    pub primary_key: Option<String>,
    pub foreign_keys: Vec<ForeignKeySpec>,
    pub indexes: Vec<IndexSpec>,
}

impl TableSchema {
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            columns: Vec::new(),
            primary_key: None,
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Severity of a schema difference. Errors abort the run before any data
/// is fetched; warnings and info are reported and tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// Classification of a single projected-vs-observed schema difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    MissingTable,
    ExtraTable,
    MissingColumn,
    ExtraColumn,
    TypeMismatch,
    NullableMismatch,
    PkMismatch,
    FkMissing,
    FkMismatch,
    FkExtra,
    MissingEntity,
    NewEntity,
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MissingTable => "missing_table",
            Self::ExtraTable => "extra_table",
            Self::MissingColumn => "missing_column",
            Self::ExtraColumn => "extra_column",
            Self::TypeMismatch => "type_mismatch",
            Self::NullableMismatch => "nullable_mismatch",
            Self::PkMismatch => "pk_mismatch",
            Self::FkMissing => "fk_missing",
            Self::FkMismatch => "fk_mismatch",
            Self::FkExtra => "fk_extra",
            Self::MissingEntity => "missing_entity",
            Self::NewEntity => "new_entity",
        };
        write!(f, "{name}")
    }
}

/// One difference between the projected and observed schemas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDifference {
    pub entity: String,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl SchemaDifference {
    pub fn new(
        entity: impl Into<String>,
        issue_type: IssueType,
        severity: Severity,
        description: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            entity: entity.into(),
            issue_type,
            severity,
            description: description.into(),
            details,
        }
    }
}
