//! CubeJS deployment health checks.
//!
//! This binary runs the diagnostic engine against a live deployment and
//! prints JSON reports. Every report is computed fresh; nothing is persisted.
//!
//! # Security Guarantees
//! - Read-only database operations only
//! - No credentials in reports or logs
//! - Cube definitions are read as data, never evaluated

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use cubecheck_core::{
    CatalogHandles, CubeQuery, DatabaseConfig, DiagnosticContext, DiagnosticEngine,
    EngineSettings, Environment, HealthStatus, Registry, SecurityContext,
    config::ConfigurationValidationOptions,
    logging::{LogFormat, init_logging},
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cubecheck")]
#[command(about = "Health checks and error triage for CubeJS deployments")]
#[command(version)]
#[command(long_about = "
cubecheck - CubeJS deployment diagnostics

Checks a CubeJS deployment end to end and prints JSON reports:
- Configuration and JWT signing secret
- PostgreSQL reachability and materialized view access
- Cube definitions against the live catalog
- Schema drift and connection pool health
- Dashboard query shapes and security contexts

Database settings come from the CUBEJS_DB_* environment variables.

EXAMPLES:
  cubecheck diagnose
  cubecheck --schema-dir ./schema schemas --fix
  cubecheck validate-query '{\"measures\":[\"Members.count\"]}' --context '{\"tenantId\":\"t1\"}'
  cubecheck explain-error 'relation \"mv_members\" does not exist'
")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every check and print the combined report
    Diagnose,
    /// Validate every cube definition against the database
    Schemas(SchemasArgs),
    /// Test database connectivity with a fresh connection
    Connectivity,
    /// Check access to the known materialized views
    Views,
    /// Detect schema drift between snapshots
    Drift(DriftArgs),
    /// Report connection pool health and tuning suggestions
    Pool,
    /// Validate environment, JWT secret, database parameters and schema directory
    Config,
    /// Validate a query and its security context
    ValidateQuery(ValidateQueryArgs),
    /// Classify an error message and render the user-facing response
    ExplainError(ExplainErrorArgs),
}

#[derive(Args)]
struct SchemasArgs {
    /// Include suggested fixes for invalid cubes
    #[arg(long)]
    fix: bool,
}

#[derive(Args)]
struct DriftArgs {
    /// Number of snapshot rounds; drift between rounds is reported
    #[arg(long, default_value = "1")]
    rounds: u32,

    /// Seconds between rounds
    #[arg(long, default_value = "60")]
    interval: u64,
}

#[derive(Args)]
struct ValidateQueryArgs {
    /// Query as JSON, or @path to a JSON file
    query: String,

    /// Security context as JSON, or @path; the registry's smoke-test context by default
    #[arg(long)]
    context: Option<String>,
}

#[derive(Args)]
struct ExplainErrorArgs {
    /// Error message to classify
    message: String,

    /// Query that failed, as JSON or @path
    #[arg(long)]
    query: Option<String>,

    /// Security context of the request, as JSON or @path
    #[arg(long)]
    context: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Args)]
struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all log output except errors")]
    quiet: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormatArg,

    /// Directory of cube definition files
    #[arg(long, global = true, env = "CUBECHECK_SCHEMA_DIR", default_value = "schema")]
    schema_dir: PathBuf,

    /// Registry of known cubes, views and smoke-test queries (JSON)
    #[arg(long, global = true, env = "CUBECHECK_REGISTRY")]
    registry: Option<PathBuf>,

    /// Include error chains in error responses (also enabled by CUBEJS_DEV_MODE)
    #[arg(long, global = true)]
    dev_mode: bool,

    /// Skip the connection probe during configuration checks
    #[arg(long, global = true)]
    no_db_probe: bool,

    /// Write the report here instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_format.into())?;

    let env = Environment::from_process();
    let registry = load_registry(cli.global.registry.as_deref())?;

    match &cli.command {
        Command::ValidateQuery(args) => {
            let query = read_json_arg(&args.query).context("Invalid query")?;
            let context = match &args.context {
                Some(context) => read_json_arg(context).context("Invalid security context")?,
                None => serde_json::to_value(&registry.smoke_test_context)?,
            };
            let validator = cubecheck_core::QueryValidator::new(registry.into());
            let result = validator.validate_query_value(&query, &context);
            write_report(&result, cli.global.output.as_deref())?;
            return Ok(exit_code(result.is_valid));
        }
        Command::ExplainError(args) => {
            let query: CubeQuery = match &args.query {
                Some(query) => serde_json::from_value(read_json_arg(query)?)
                    .context("Query does not match the CubeJS query shape")?,
                None => CubeQuery::default(),
            };
            let context: SecurityContext = match &args.context {
                Some(context) => serde_json::from_value(read_json_arg(context)?)
                    .context("Invalid security context")?,
                None => SecurityContext::default(),
            };
            let dev_mode = cli.global.dev_mode || env.flag("CUBEJS_DEV_MODE").unwrap_or(false);
            let handler = cubecheck_core::ErrorHandler::new(dev_mode);
            let response = handler.handle_error_message(&args.message, &query, &context);
            write_report(&response, cli.global.output.as_deref())?;
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let db_config = DatabaseConfig::from_environment(&env);
    info!(database = %db_config, "Using database");

    let mut settings = EngineSettings::new(env, &cli.global.schema_dir)
        .with_registry(registry)
        .with_database_probe(!cli.global.no_db_probe)
        .with_configuration_options(ConfigurationValidationOptions::default());
    if cli.global.dev_mode {
        settings = settings.with_dev_mode(true);
    }
    let engine = DiagnosticEngine::new(settings, CatalogHandles::postgres(&db_config));

    let code = run_engine_command(&cli, &engine).await;
    engine.close().await;
    code
}

async fn run_engine_command(cli: &Cli, engine: &DiagnosticEngine) -> anyhow::Result<ExitCode> {
    let output = cli.global.output.as_deref();

    match &cli.command {
        Command::Diagnose => {
            let token = CancellationToken::new();
            let context = DiagnosticContext::with_cancellation(token.clone());
            let watcher = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling diagnosis");
                    token.cancel();
                }
            });

            let report = engine.run_full_diagnosis(&context).await;
            watcher.abort();

            write_report(&report, output)?;
            Ok(match report.overall_status {
                HealthStatus::Critical => ExitCode::from(2),
                HealthStatus::Degraded | HealthStatus::Healthy => ExitCode::SUCCESS,
            })
        }
        Command::Schemas(args) => {
            let results = engine.validate_schemas().await;
            let valid = results.iter().all(|r| r.is_valid);
            if args.fix {
                let fixes = engine.generate_schema_fixes(&results).await;
                write_report(&SchemasWithFixes { results, fixes }, output)?;
            } else {
                write_report(&results, output)?;
            }
            Ok(exit_code(valid))
        }
        Command::Connectivity => {
            let result = engine.test_connectivity().await;
            write_report(&result, output)?;
            Ok(exit_code(result.is_connected))
        }
        Command::Views => {
            let access = engine.connection_tester().check_materialized_view_access().await;
            let accessible = access.iter().all(|v| v.accessible);
            write_report(&access, output)?;
            Ok(exit_code(accessible))
        }
        Command::Drift(args) => {
            let detector = engine.drift_detector();
            let rounds = args.rounds.max(1);
            let mut report = detector.detect_schema_drift().await?;
            for _ in 1..rounds {
                tokio::time::sleep(Duration::from_secs(args.interval)).await;
                report = detector.detect_schema_drift().await?;
            }
            write_report(&report, output)?;
            Ok(exit_code(report.total_drifts == 0))
        }
        Command::Pool => {
            // Exercise the pool so the report reflects real connections.
            engine.connection_tester().check_materialized_view_access().await;
            let report = engine.pool_monitor().generate_pool_report();
            let healthy = report.summary.status == HealthStatus::Healthy;
            write_report(&report, output)?;
            Ok(exit_code(healthy))
        }
        Command::Config => {
            let report = engine.config_validator().generate_configuration_report().await;
            let healthy = report.overall_status == HealthStatus::Healthy;
            write_report(&report, output)?;
            Ok(exit_code(healthy))
        }
        Command::ValidateQuery(_) | Command::ExplainError(_) => Ok(ExitCode::SUCCESS),
    }
}

#[derive(Serialize)]
struct SchemasWithFixes {
    results: Vec<cubecheck_core::CubeValidationResult>,
    fixes: Vec<cubecheck_core::corrector::SchemaFix>,
}

fn exit_code(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn load_registry(path: Option<&Path>) -> anyhow::Result<Registry> {
    match path {
        Some(path) => Registry::from_file(path)
            .with_context(|| format!("Failed to load registry from {}", path.display())),
        None => Ok(Registry::default()),
    }
}

/// Parses inline JSON, or the contents of a file for `@path`.
fn read_json_arg(arg: &str) -> anyhow::Result<serde_json::Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).context("Argument is not valid JSON")
}

fn write_report<T: Serialize>(report: &T, output: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    match output {
        Some(path) => {
            std::fs::write(path, json + "\n")
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Report written");
        }
        None => println!("{}", json),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cubecheck",
            "schemas",
            "--fix",
            "--schema-dir",
            "/srv/schema",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.global.schema_dir, PathBuf::from("/srv/schema"));
        assert_eq!(cli.global.verbose, 2);
        assert!(matches!(cli.command, Command::Schemas(SchemasArgs { fix: true })));
    }

    #[test]
    fn test_schema_dir_from_environment() {
        temp_env::with_var("CUBECHECK_SCHEMA_DIR", Some("/from/env"), || {
            let cli = Cli::try_parse_from(["cubecheck", "diagnose"]).unwrap();
            assert_eq!(cli.global.schema_dir, PathBuf::from("/from/env"));
        });
    }

    #[test]
    fn test_read_json_arg_inline_and_file() {
        let inline = read_json_arg(r#"{"measures":["Members.count"]}"#).unwrap();
        assert_eq!(inline["measures"][0], "Members.count");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.json");
        std::fs::write(&path, r#"{"measures":[]}"#).unwrap();
        let from_file = read_json_arg(&format!("@{}", path.display())).unwrap();
        assert!(from_file["measures"].as_array().unwrap().is_empty());

        assert!(read_json_arg("{not json").is_err());
    }

    #[test]
    fn test_write_report_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(&serde_json::json!({"ok": true}), Some(&path)).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"ok\": true"));
    }
}
