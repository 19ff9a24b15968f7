//! Dataverse to local-SQL sync engine with SCD2 history.
//!
//! Synchronizes entity records from a Microsoft Dataverse tenant (OData
//! v4 Web API) into a local SQLite store, keeping full temporal history
//! via Slowly-Changing-Dimension type-2 versioning. The local store is
//! the source of truth for historical joins; each run brings it to a
//! consistent, forward-moving approximation of Dataverse.
//!
//! The flow of one run, composed in [`orchestrator::run_sync`]:
//! credentials → API client → $metadata parse → schema comparison gate →
//! table creation → unfiltered entity drain → filtered transitive-closure
//! sync → optional reference verification → summary.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod metadata;
pub mod orchestrator;
pub mod sync;
pub mod validation;

pub use client::{DataverseClient, DataverseFetch, JsonRecord};
pub use config::{load_config, load_entity_configs, load_optionsets_config, Config, EntityConfig};
pub use error::SyncError;
pub use orchestrator::{run_sync, run_sync_workflow, SyncOutcome};
