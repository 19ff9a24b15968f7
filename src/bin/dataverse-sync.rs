//! Dataverse sync command line interface.
//!
//! # Usage
//!
//! ```bash
//! # Full sync workflow, with reference verification
//! dataverse-sync sync --verify
//!
//! # Schema-only comparison with JSON and Markdown reports
//! dataverse-sync validate-schema --db-type sqlite
//!
//! # Emit the option-set override config from a synced database
//! dataverse-sync generate-optionset-config --db dataverse.db > config/optionsets.json
//! ```
//!
//! Exit code 0 on success, 1 on any failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dataverse_sync::auth::DataverseAuth;
use dataverse_sync::client::DataverseClient;
use dataverse_sync::config::{load_config, load_entity_configs, load_optionsets_config};
use dataverse_sync::metadata::{DbTarget, MetadataParser};
use dataverse_sync::orchestrator::run_sync;
use dataverse_sync::sync::{extract_optionset_config, DatabaseManager};
use dataverse_sync::validation::{
    validate_schema_before_sync, DatabaseSchemaReader, ReportGenerator,
};

#[derive(Parser)]
#[command(name = "dataverse-sync")]
#[command(version = "0.1.0")]
#[command(about = "Sync Microsoft Dataverse entities into a local SQL store with SCD2 history")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DbTypeArg {
    Sqlite,
    Postgresql,
}

impl From<DbTypeArg> for DbTarget {
    fn from(arg: DbTypeArg) -> Self {
        match arg {
            DbTypeArg::Sqlite => DbTarget::Sqlite,
            DbTypeArg::Postgresql => DbTarget::Postgres,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full sync workflow
    Sync {
        /// Verify reference integrity after sync (fails the run when
        /// dangling references are found)
        #[arg(long)]
        verify: bool,

        /// Path to the entities config file
        #[arg(long, default_value = "config/entities_config.json")]
        entities_config: PathBuf,

        /// Path to the option-set overrides file
        #[arg(long, default_value = "config/optionsets.json")]
        optionsets_config: PathBuf,

        /// Path to a .env file (default: .env in the working directory)
        #[arg(long)]
        env_file: Option<PathBuf>,
    },

    /// Compare the local schema against Dataverse $metadata and emit reports
    ValidateSchema {
        /// Database type (default: auto-detect from configuration)
        #[arg(long, value_enum)]
        db_type: Option<DbTypeArg>,

        /// Path for the JSON report
        #[arg(long, default_value = "schema_validation_report.json")]
        json_report: PathBuf,

        /// Path for the Markdown report
        #[arg(long, default_value = "schema_validation_report.md")]
        md_report: PathBuf,

        /// Path to the entities config file
        #[arg(long, default_value = "config/entities_config.json")]
        entities_config: PathBuf,

        /// Path to a .env file (default: .env in the working directory)
        #[arg(long)]
        env_file: Option<PathBuf>,
    },

    /// Scan a synced database and print the option-set override config
    GenerateOptionsetConfig {
        /// Path to the SQLite database
        #[arg(long, default_value = "dataverse.db")]
        db: PathBuf,

        /// Path to the entities config file
        #[arg(long, default_value = "config/entities_config.json")]
        entities_config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Progress goes to stderr so generate-optionset-config can pipe
    // clean JSON from stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Sync {
            verify,
            entities_config,
            optionsets_config,
            env_file,
        } => run_sync_command(verify, &entities_config, &optionsets_config, env_file.as_deref()).await,
        Commands::ValidateSchema {
            db_type,
            json_report,
            md_report,
            entities_config,
            env_file,
        } => {
            run_validate_command(
                db_type,
                &json_report,
                &md_report,
                &entities_config,
                env_file.as_deref(),
            )
            .await
        }
        Commands::GenerateOptionsetConfig {
            db,
            entities_config,
        } => run_generate_optionset_command(&db, &entities_config).await,
    }
}

async fn run_sync_command(
    verify: bool,
    entities_config: &std::path::Path,
    optionsets_config: &std::path::Path,
    env_file: Option<&std::path::Path>,
) -> Result<bool> {
    let config = load_config(env_file).context("loading configuration")?;
    let entities = load_entity_configs(entities_config).context("loading entities config")?;
    info!(entities = entities.len(), "configuration loaded");

    let optionsets = if optionsets_config.exists() {
        load_optionsets_config(optionsets_config).context("loading option set config")?
    } else {
        info!("no option set config found, option set fields will be stored as TEXT");
        HashMap::new()
    };

    let outcome = run_sync(&config, &entities, &optionsets, verify).await?;

    if outcome.success {
        info!(
            added = outcome.total_added,
            updated = outcome.total_updated,
            "sync completed successfully"
        );
    } else {
        warn!(
            entity_failures = outcome.failed_entities.len(),
            validation_errors = outcome.validation_errors.len(),
            reference_issues = outcome.reference_issues.len(),
            "sync failed"
        );
    }
    Ok(outcome.success)
}

async fn run_validate_command(
    db_type: Option<DbTypeArg>,
    json_report: &std::path::Path,
    md_report: &std::path::Path,
    entities_config: &std::path::Path,
    env_file: Option<&std::path::Path>,
) -> Result<bool> {
    let config = load_config(env_file).context("loading configuration")?;
    let entities = load_entity_configs(entities_config).context("loading entities config")?;

    let target: DbTarget = match db_type {
        Some(arg) => arg.into(),
        None => config.db_target()?,
    };
    info!(db_type = %target, entities = entities.len(), "validating schema");

    info!("authenticating with Dataverse");
    let mut auth = DataverseAuth::new(config.clone())?;
    let token = auth.authenticate().await.context("authentication failed")?;
    let client = DataverseClient::new(&config, token)?;

    use dataverse_sync::client::DataverseFetch;
    let metadata_xml = client.get_metadata().await.context("fetching $metadata")?;

    let parser = MetadataParser::new(target);
    let singular_names: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();
    let projected = parser.parse_for_entities(&metadata_xml, &singular_names)?;
    info!(count = projected.len(), "schemas fetched from Dataverse");

    let reader = match target {
        DbTarget::Sqlite => DatabaseSchemaReader::connect_sqlite(config.sqlite_path()?).await?,
        DbTarget::Postgres => {
            let conn = config.postgres_connection_string.as_deref().ok_or_else(|| {
                anyhow::anyhow!("POSTGRES_CONNECTION_STRING is required for postgresql validation")
            })?;
            DatabaseSchemaReader::connect_postgres(conn).await?
        }
    };
    let table_names: Vec<String> = entities.iter().map(|e| e.api_name.clone()).collect();
    let observed = reader.read_schemas(&table_names).await?;
    info!(count = observed.len(), "schemas queried from database");

    let validation = validate_schema_before_sync(&entities, &projected, &observed, target);

    // Key both sides by table name so the report statistics line up.
    let projected_by_table: std::collections::HashMap<_, _> = entities
        .iter()
        .filter_map(|e| {
            projected
                .get(&e.name)
                .map(|schema| (e.api_name.clone(), schema.clone()))
        })
        .collect();

    ReportGenerator::generate_json_report(
        &validation.differences,
        &projected_by_table,
        &observed,
        json_report,
    )?;
    ReportGenerator::generate_markdown_report(
        &validation.differences,
        &projected_by_table,
        &observed,
        md_report,
    )?;

    Ok(ReportGenerator::print_summary(&validation.differences))
}

async fn run_generate_optionset_command(
    db_path: &std::path::Path,
    entities_config: &std::path::Path,
) -> Result<bool> {
    if !db_path.exists() {
        anyhow::bail!(
            "database not found: {} (run the sync first to create it)",
            db_path.display()
        );
    }

    let entities = load_entity_configs(entities_config).context("loading entities config")?;
    let db = DatabaseManager::open(
        db_path
            .to_str()
            .context("database path is not valid UTF-8")?,
    )
    .await?;

    info!(db = %db_path.display(), "analyzing database");
    let config = extract_optionset_config(&db, &entities).await?;

    let total_fields: usize = config.values().map(Vec::len).sum();
    info!(
        entities = config.len(),
        fields = total_fields,
        "generated option set config"
    );

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(true)
}
