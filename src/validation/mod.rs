//! Schema validation: observed-schema readers, the projected-vs-observed
//! comparer, the pre-sync gate, and report rendering.

pub mod comparer;
pub mod database_schema;
pub mod report;
pub mod validator;

pub use comparer::SchemaComparer;
pub use database_schema::DatabaseSchemaReader;
pub use report::ReportGenerator;
pub use validator::{validate_schema_before_sync, ValidationOutcome, SYSTEM_COLUMNS};
