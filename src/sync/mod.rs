//! The sync engine: storage primitives, SCD2 versioning, option-set
//! storage, and the unfiltered/filtered entity syncers.

pub mod database;
pub mod entity;
pub mod filtered;
pub mod optionset_detector;
pub mod optionset_storage;
pub mod relationship_graph;
pub mod scd2;
pub mod schema_init;
pub mod state;
pub mod verifier;

pub use database::DatabaseManager;
pub use entity::{resolve_primary_key, sync_entity};
pub use filtered::FilteredSyncManager;
pub use optionset_detector::{DetectedOptionSet, OptionSetDetector};
pub use optionset_storage::{extract_optionset_config, OptionSetStorage};
pub use relationship_graph::{Reference, RelationshipGraph};
pub use scd2::{canonicalize_payload, Scd2Record, Scd2Result, Scd2Upserter};
pub use schema_init::{generate_create_table_sql, initialize_tables};
pub use state::SyncStateManager;
pub use verifier::{ReferenceVerifier, VerificationIssue, VerificationReport};
