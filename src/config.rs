//! Configuration loading for the Dataverse sync engine.
//!
//! Environment variables carry credentials and the store location; two
//! JSON files carry the entity list and the option-set field overrides.
//! Env loading precedence: explicit `--env-file` path, then `./.env`,
//! then the process environment.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::SyncError;
use crate::metadata::DbTarget;

/// Connection and credential settings resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub sqlite_db_path: Option<String>,
    pub postgres_connection_string: Option<String>,
}

impl Config {
    /// Determine which database backend is configured.
    ///
    /// PostgreSQL wins when both are set; it is only ever used for the
    /// schema-comparison path.
    pub fn db_target(&self) -> Result<DbTarget, SyncError> {
        if self.postgres_connection_string.is_some() {
            Ok(DbTarget::Postgres)
        } else if self.sqlite_db_path.is_some() {
            Ok(DbTarget::Sqlite)
        } else {
            Err(SyncError::Config(
                "no database configured: set either SQLITE_DB_PATH or POSTGRES_CONNECTION_STRING"
                    .to_string(),
            ))
        }
    }

    /// The SQLite path, required for the sync workflow.
    pub fn sqlite_path(&self) -> Result<&str, SyncError> {
        self.sqlite_db_path.as_deref().ok_or_else(|| {
            SyncError::Config("SQLITE_DB_PATH is required for sync".to_string())
        })
    }
}

/// A single entity to synchronize.
///
/// `name` is the singular logical name used in $metadata (e.g.
/// `vin_candidate`); `api_name` is the plural collection name used in
/// API URLs and as the local table name (e.g. `vin_candidates`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityConfig {
    pub name: String,
    pub api_name: String,
    pub filtered: bool,
    pub description: String,
}

#[derive(Deserialize)]
struct EntitiesFile {
    entities: Vec<RawEntity>,
}

#[derive(Deserialize)]
struct RawEntity {
    name: String,
    #[serde(default)]
    api_name: Option<String>,
    #[serde(default)]
    filtered: bool,
    #[serde(default)]
    description: String,
}

/// Load environment configuration.
///
/// Collects every missing required variable into a single error so the
/// operator can fix them in one pass.
pub fn load_config(env_file: Option<&Path>) -> Result<Config, SyncError> {
    if let Some(path) = env_file {
        dotenvy::from_path(path)
            .map_err(|e| SyncError::Config(format!("cannot load env file {}: {e}", path.display())))?;
    } else if Path::new(".env").exists() {
        // Ignore parse failures for an implicit .env; explicit paths fail hard.
        let _ = dotenvy::dotenv();
    }

    let mut missing = Vec::new();
    let mut var = |name: &'static str| -> Option<String> {
        match std::env::var(name) {
            Ok(v) if !v.is_empty() => Some(v),
            _ => {
                missing.push(name);
                None
            }
        }
    };

    let api_url = var("DATAVERSE_API_URL");
    let client_id = var("DATAVERSE_CLIENT_ID");
    let client_secret = var("DATAVERSE_CLIENT_SECRET");
    let scope = var("DATAVERSE_SCOPE");

    if !missing.is_empty() {
        return Err(SyncError::Config(format!(
            "missing required environment variables: {}",
            missing.join(", ")
        )));
    }

    Ok(Config {
        api_url: api_url.unwrap_or_default().trim_end_matches('/').to_string(),
        client_id: client_id.unwrap_or_default(),
        client_secret: client_secret.unwrap_or_default(),
        scope: scope.unwrap_or_default(),
        sqlite_db_path: std::env::var("SQLITE_DB_PATH").ok().filter(|v| !v.is_empty()),
        postgres_connection_string: std::env::var("POSTGRES_CONNECTION_STRING")
            .ok()
            .filter(|v| !v.is_empty()),
    })
}

/// Load entity configurations from an entities config file.
///
/// Auto-pluralizes the API name when `api_name` is absent by appending
/// `s` (e.g. `vin_candidate` becomes `vin_candidates`).
pub fn load_entity_configs(path: &Path) -> Result<Vec<EntityConfig>, SyncError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SyncError::Config(format!("entity config file not found: {}: {e}", path.display()))
    })?;
    let file: EntitiesFile = serde_json::from_str(&content)
        .map_err(|e| SyncError::Config(format!("invalid entities config: {e}")))?;

    Ok(file
        .entities
        .into_iter()
        .map(|raw| {
            let api_name = raw.api_name.unwrap_or_else(|| format!("{}s", raw.name));
            EntityConfig {
                name: raw.name,
                api_name,
                filtered: raw.filtered,
                description: raw.description,
            }
        })
        .collect())
}

/// Load the option-set override mapping (singular entity name to the
/// string-typed fields that actually carry integer option-set codes).
pub fn load_optionsets_config(path: &Path) -> Result<HashMap<String, Vec<String>>, SyncError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SyncError::Config(format!("option set config file not found: {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| SyncError::Config(format!("invalid option set config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_entity_configs_pluralizes() {
        let file = write_temp(
            r#"{"entities": [
                {"name": "account", "filtered": true, "description": "orgs"},
                {"name": "vin_candidate", "api_name": "vin_candidates"}
            ]}"#,
        );
        let entities = load_entity_configs(file.path()).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].api_name, "accounts");
        assert!(entities[0].filtered);
        assert_eq!(entities[1].api_name, "vin_candidates");
        assert!(!entities[1].filtered);
        assert_eq!(entities[1].description, "");
    }

    #[test]
    fn test_load_entity_configs_rejects_missing_entities_key() {
        let file = write_temp(r#"{"tables": []}"#);
        assert!(matches!(
            load_entity_configs(file.path()),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_load_optionsets_config() {
        let file = write_temp(r#"{"account": ["statuscode", "industrycode"]}"#);
        let config = load_optionsets_config(file.path()).unwrap();
        assert_eq!(config["account"], vec!["statuscode", "industrycode"]);
    }

    #[test]
    fn test_db_target_prefers_postgres() {
        let config = Config {
            api_url: "https://org.example".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            scope: "scope".into(),
            sqlite_db_path: Some("sync.db".into()),
            postgres_connection_string: Some("postgresql://localhost/sync".into()),
        };
        assert_eq!(config.db_target().unwrap(), DbTarget::Postgres);
    }

    #[test]
    fn test_db_target_requires_a_store() {
        let config = Config {
            api_url: "https://org.example".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            scope: "scope".into(),
            sqlite_db_path: None,
            postgres_connection_string: None,
        };
        assert!(matches!(config.db_target(), Err(SyncError::Config(_))));
    }
}
