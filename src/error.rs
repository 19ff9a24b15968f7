//! Error taxonomy for the sync engine.
//!
//! Startup errors (`Config`, `Auth`, `Metadata`, `Schema`) abort the run
//! before any data is written. `Transport`, `Server` and `PkResolution`
//! are per-entity: the orchestrator records them in `_sync_log` and
//! continues with sibling entities. `Integrity` is reported at run end
//! when reference verification was requested.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing environment variables or a malformed config file.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tenant discovery or token exchange failed, or a token expired mid-run.
    #[error("authentication error: {0}")]
    Auth(String),

    /// $metadata fetch failed or the CSDL document could not be parsed.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// The schema comparer found breaking differences; no data was fetched.
    #[error("schema validation failed with {0} breaking change(s)")]
    Schema(usize),

    /// Network failure after the retry budget was exhausted.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-recoverable HTTP response from the Dataverse API.
    #[error("API request failed with status {status}: {body}")]
    Server { status: u16, body: String },

    /// No usable business-key column could be resolved for an entity.
    #[error("cannot find valid primary key for {0}")]
    PkResolution(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}
