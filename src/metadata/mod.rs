//! Schema projection from OData $metadata.

pub mod parser;
pub mod type_mapping;
pub mod types;

pub use parser::MetadataParser;
pub use type_mapping::{map_edm_to_db_type, normalize_db_type, DbTarget};
pub use types::{
    ColumnSpec, ForeignKeySpec, IndexSpec, IssueType, SchemaDifference, Severity, TableSchema,
};
