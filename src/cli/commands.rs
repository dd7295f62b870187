//! CLI command implementations
//!
//! Every command opens the configured database, acts as the project owner
//! and prints one JSON response. Safety checks (confirmation, validation,
//! isolation) are enforced by the platform, not here.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::access::{CallerIdentity, Role, StaticIdentityProvider};
use crate::catalog::{Confirmation, FieldOp, NewTable, VersionStatus};
use crate::config::PlatformConfig;
use crate::crud::ListQuery;
use crate::observability::{log_event, Event, Logger, NoopAnalytics};
use crate::platform::Platform;

use super::args::{Cli, Command, RecordsAction, TablesAction};
use super::errors::{CliError, CliResult};
use super::io::{read_document, write_error, write_response};

/// Token the CLI presents to the platform
const CLI_TOKEN: &str = "cli";

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    let result = run_command(cli);
    if let Err(e) = &result {
        write_error(e.code_str(), e.message())?;
    }
    result
}

/// Loads configuration, starts a runtime and runs one command
pub fn run_command(cli: Cli) -> CliResult<()> {
    let config = match &cli.command {
        Command::Init { database } => init_config(&cli.config, database)?,
        _ => PlatformConfig::load(&cli.config)?,
    };
    Logger::init_from_env(config.severity());
    let path = cli.config.display().to_string();
    log_event(Event::ConfigLoaded, &[("path", path.as_str())]);

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;
    rt.block_on(async {
        let platform = open_platform(config, &cli.project).await?;
        execute(&platform, &cli.project, cli.command).await
    })
}

/// Loads the config at `path`, writing a default one first if it is missing
fn init_config(path: &Path, database: &str) -> CliResult<PlatformConfig> {
    if path.exists() {
        return Ok(PlatformConfig::load(path)?);
    }
    let config = PlatformConfig::with_database(database);
    config.validate()?;
    std::fs::write(path, serde_json::to_string_pretty(&config)?)
        .map_err(|e| CliError::config_error(format!("Failed to write {}: {}", path.display(), e)))?;
    Ok(config)
}

async fn open_platform(config: PlatformConfig, project: &str) -> CliResult<Platform> {
    let owner = CallerIdentity::new("cli", Role::Owner).with_project(project);
    let identity = StaticIdentityProvider::new().with_token(CLI_TOKEN, owner);
    Platform::open(config, Arc::new(identity), Arc::new(NoopAnalytics))
        .await
        .map_err(|e| CliError::boot_failed(e.to_string()))
}

/// Runs one command against an open platform
pub async fn execute(platform: &Platform, project: &str, command: Command) -> CliResult<()> {
    match command {
        Command::Init { .. } => {
            let registered = platform.register_project(CLI_TOKEN, project, project).await?;
            write_response(&json!({
                "database": platform.config().database_path,
                "project": registered,
            }))
        }
        Command::Tables { action } => match action {
            TablesAction::List => write_response(&platform.list_tables(CLI_TOKEN, project)?),
            TablesAction::Show { table } => write_response(&platform.get_table(CLI_TOKEN, project, &table)?),
        },
        Command::Apply { file } => {
            let request: NewTable = read_document(&file)?;
            write_response(&platform.create_table(CLI_TOKEN, project, request).await?)
        }
        Command::Alter {
            table,
            file,
            confirm,
            reject_overflow,
            wait,
        } => alter(platform, project, &table, &file, confirmation(confirm, reject_overflow), wait).await,
        Command::Records { action } => match action {
            RecordsAction::List { table, params } => {
                let query = parse_params(&params)?;
                write_response(&platform.list_records(CLI_TOKEN, project, &table, query).await?)
            }
            RecordsAction::Create { table, file } => {
                let record: Value = read_document(&file)?;
                write_response(&platform.create_record(CLI_TOKEN, project, &table, record).await?)
            }
        },
        Command::Versions { table } => write_response(&platform.schema_versions(CLI_TOKEN, project, &table)?),
        Command::DropProject { confirm } => write_response(&platform.delete_project(CLI_TOKEN, project, confirm).await?),
    }
}

fn confirmation(confirm: bool, reject_overflow: bool) -> Confirmation {
    match (confirm, reject_overflow) {
        (false, _) => Confirmation::none(),
        (true, false) => Confirmation::confirmed(),
        (true, true) => Confirmation::reject_overflow(),
    }
}

/// Records the version and waits for the migrator to finish it
async fn alter(
    platform: &Platform,
    project: &str,
    table: &str,
    file: &Path,
    confirmation: Confirmation,
    wait_secs: u64,
) -> CliResult<()> {
    let ops: Vec<FieldOp> = read_document(file)?;
    let entry = platform
        .alter_table(CLI_TOKEN, project, table, ops, confirmation)
        .await?;
    if entry.status == VersionStatus::Pending {
        platform
            .wait_for_version(CLI_TOKEN, project, &entry.table_id, entry.version, Duration::from_secs(wait_secs))
            .await?;
    }
    let applied = platform
        .schema_versions(CLI_TOKEN, project, table)?
        .into_iter()
        .find(|v| v.version == entry.version)
        .unwrap_or(entry);
    write_response(&applied)
}

/// Parses repeated `KEY=VALUE` list parameters
fn parse_params(params: &[String]) -> CliResult<ListQuery> {
    let pairs = params
        .iter()
        .map(|param| {
            param
                .split_once('=')
                .ok_or_else(|| CliError::invalid_input(format!("expected KEY=VALUE, got '{}'", param)))
        })
        .collect::<CliResult<Vec<(&str, &str)>>>()?;
    Ok(ListQuery::from_pairs(pairs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FieldDefinition;
    use crate::crud::FilterOperator;
    use crate::registry::LogicalType;

    #[test]
    fn test_parse_params() {
        let query = parse_params(&["email=eq.jean@x.com".to_string(), "limit=5".to_string()]).unwrap();
        assert_eq!(query.limit, Some(5));
        assert_eq!(query.filters.len(), 1);
        assert_eq!(query.filters[0].operator, FilterOperator::Eq);

        let err = parse_params(&["nonsense".to_string()]).unwrap_err();
        assert_eq!(err.code_str(), "TS_CLI_INVALID_INPUT");
    }

    #[test]
    fn test_confirmation_flags() {
        assert_eq!(confirmation(false, true), Confirmation::none());
        assert_eq!(confirmation(true, true), Confirmation::reject_overflow());
    }

    #[test]
    fn test_init_writes_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tablesmith.json");
        let database = dir.path().join("data.db").display().to_string();
        let config = init_config(&path, &database).unwrap();
        assert_eq!(config.database_path, database);
        assert_eq!(PlatformConfig::load(&path).unwrap(), config);
    }

    #[tokio::test]
    async fn test_execute_apply_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let definition = dir.path().join("notes.json");
        let request = json!({
            "name": "notes",
            "fields": [serde_json::to_value(FieldDefinition::new("body", LogicalType::long_text())).unwrap()]
        });
        std::fs::write(&definition, request.to_string()).unwrap();

        let platform = open_platform(PlatformConfig::in_memory(), "p1").await.unwrap();
        execute(&platform, "p1", Command::Apply { file: definition }).await.unwrap();
        assert_eq!(platform.list_tables(CLI_TOKEN, "p1").unwrap().len(), 1);

        let err = execute(&platform, "p1", Command::DropProject { confirm: false })
            .await
            .unwrap_err();
        assert_eq!(err.code_str(), "TS_DESTRUCTIVE_CHANGE_REJECTED");
    }
}
