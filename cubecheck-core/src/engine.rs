//! Full-system diagnosis.
//!
//! [`DiagnosticEngine`] composes every checker and runs them in a fixed order:
//! configuration, connectivity, schema validation, drift detection, pool
//! health and dashboard query smoke tests. Their findings are folded into one
//! [`DiagnosticReport`]. A failing or cancelled stage never propagates out of
//! [`DiagnosticEngine::run_full_diagnosis`]; the report is returned with what
//! was collected so far.

use crate::catalog::{Catalog, Connector, MemoryCatalog, MemoryConnector};
use crate::config::{
    ConfigurationValidationOptions, ConfigurationValidator, DatabaseConfig, Environment,
};
use crate::connection_tester::{ConnectionTestResult, ConnectionTester};
use crate::context::DiagnosticContext;
use crate::corrector::{SchemaCorrector, SchemaFix};
use crate::cube::CubeRepository;
use crate::drift::{DriftType, SchemaDriftDetector};
use crate::error_handler::{ErrorHandler, ErrorResponse};
use crate::models::{HealthStatus, Severity};
use crate::pool_monitor::{ConnectionPoolMonitor, EventRecorder, FixedPoolSource, PoolSource};
use crate::query::{CubeQuery, QueryValidationResult, QueryValidator, SecurityContext};
use crate::registry::Registry;
use crate::schema_validator::{CubeValidationResult, SchemaErrorType, SchemaValidator};
use crate::{DiagnosticError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, error, info, warn};

/// Where a schema issue came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaIssueType {
    SchemaError,
    SchemaDrift,
}

/// A problem with one cube definition or its backing relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaIssue {
    #[serde(rename = "type")]
    pub issue_type: SchemaIssueType,
    pub cube_name: String,
    pub severity: Severity,
    pub message: String,
    pub suggestion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<SchemaErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_type: Option<DriftType>,
}

impl SchemaIssue {
    fn is_missing_column(&self) -> bool {
        self.error_type == Some(SchemaErrorType::MissingColumn)
            || self.drift_type == Some(DriftType::ColumnMissing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityIssueType {
    ConnectionFailure,
    ConfigurationError,
}

/// A problem reaching or configuring the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityIssue {
    #[serde(rename = "type")]
    pub issue_type: ConnectivityIssueType,
    pub severity: Severity,
    pub message: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIssueType {
    QueryValidationError,
}

/// A dashboard query that failed validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryIssue {
    #[serde(rename = "type")]
    pub issue_type: QueryIssueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_name: Option<String>,
    pub severity: Severity,
    pub message: String,
    pub suggestion: String,
}

/// Outcome of one full diagnosis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub duration_ms: u64,
    pub overall_status: HealthStatus,
    pub schema_issues: Vec<SchemaIssue>,
    pub connectivity_issues: Vec<ConnectivityIssue>,
    pub query_issues: Vec<QueryIssue>,
    pub recommendations: Vec<String>,
    /// Set when the run was stopped before every stage completed
    #[serde(default)]
    pub cancelled: bool,
}

impl DiagnosticReport {
    fn new(correlation_id: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: correlation_id.to_string(),
            duration_ms: 0,
            overall_status: HealthStatus::Healthy,
            schema_issues: Vec::new(),
            connectivity_issues: Vec::new(),
            query_issues: Vec::new(),
            recommendations: Vec::new(),
            cancelled: false,
        }
    }

    fn severities(&self) -> impl Iterator<Item = Severity> + '_ {
        self.schema_issues
            .iter()
            .map(|i| i.severity)
            .chain(self.connectivity_issues.iter().map(|i| i.severity))
            .chain(self.query_issues.iter().map(|i| i.severity))
    }

    pub fn issue_count(&self) -> usize {
        self.schema_issues.len() + self.connectivity_issues.len() + self.query_issues.len()
    }
}

/// Critical if any issue is critical, degraded if any is high, else healthy.
pub fn determine_overall_status(report: &DiagnosticReport) -> HealthStatus {
    match report.severities().max() {
        Some(Severity::Critical) => HealthStatus::Critical,
        Some(Severity::High) => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    }
}

/// Fixed advice for each kind of issue present in the report.
pub fn generate_recommendations(report: &DiagnosticReport) -> Vec<String> {
    let mut recommendations = Vec::new();

    if report
        .schema_issues
        .iter()
        .any(|i| i.severity == Severity::Critical)
    {
        recommendations
            .push("CRITICAL: Fix missing table references in cube definitions immediately".to_string());
    }
    if report.schema_issues.iter().any(SchemaIssue::is_missing_column) {
        recommendations.push("Update cube definitions to match current database schema".to_string());
    }

    let has_connectivity = |kind| report.connectivity_issues.iter().any(|i| i.issue_type == kind);
    if has_connectivity(ConnectivityIssueType::ConnectionFailure) {
        recommendations.push(
            "Verify database connection parameters and PostgreSQL service status".to_string(),
        );
    }
    if has_connectivity(ConnectivityIssueType::ConfigurationError) {
        recommendations.push("Review and fix CubeJS configuration before proceeding".to_string());
    }

    if !report.query_issues.is_empty() {
        recommendations
            .push("Review dashboard query structures and security context validation".to_string());
    }

    match report.overall_status {
        HealthStatus::Critical => recommendations.insert(
            0,
            "IMMEDIATE ACTION REQUIRED: System has critical issues that prevent normal operation"
                .to_string(),
        ),
        HealthStatus::Degraded => recommendations.insert(
            0,
            "System performance may be impacted - address high-priority issues".to_string(),
        ),
        HealthStatus::Healthy if !report.cancelled => {
            recommendations.push("System is healthy - continue regular monitoring".to_string());
        }
        HealthStatus::Healthy => {}
    }

    if report.cancelled {
        recommendations
            .push("Diagnosis was cancelled before completion - rerun for a full report".to_string());
    }

    recommendations
}

/// Database handles shared by every checker
#[derive(Clone)]
pub struct CatalogHandles {
    pub catalog: Arc<dyn Catalog>,
    pub connector: Arc<dyn Connector>,
    pub pool: Arc<dyn PoolSource>,
    pub recorder: EventRecorder,
}

impl std::fmt::Debug for CatalogHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogHandles")
            .field("pool", &self.pool.settings())
            .finish_non_exhaustive()
    }
}

impl CatalogHandles {
    /// A lazily connected PostgreSQL pool sized from `config`.
    ///
    /// Nothing connects until the first check runs.
    #[cfg(feature = "postgresql")]
    pub fn postgres(config: &DatabaseConfig) -> Self {
        use crate::catalog::{PostgresCatalog, PostgresConnector};

        let recorder = EventRecorder::new();
        let catalog = Arc::new(PostgresCatalog::connect_lazy(
            config,
            config.effective_pool_size(),
            recorder.clone(),
        ));
        Self {
            catalog: Arc::clone(&catalog) as Arc<dyn Catalog>,
            connector: Arc::new(PostgresConnector::new(config.clone(), recorder.clone())),
            pool: catalog,
            recorder,
        }
    }

    /// An in-memory catalog with an idle, default-sized pool
    pub fn memory(catalog: Arc<MemoryCatalog>) -> Self {
        Self {
            connector: Arc::new(MemoryConnector::new(Arc::clone(&catalog))),
            catalog,
            pool: Arc::new(FixedPoolSource::default()),
            recorder: EventRecorder::new(),
        }
    }

    /// Builder method to observe a different pool.
    pub fn with_pool_source(mut self, pool: Arc<dyn PoolSource>) -> Self {
        self.pool = pool;
        self
    }

    /// Builder method to connect through a different connector.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }
}

/// Inputs to [`DiagnosticEngine::new`] other than the database
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub env: Environment,
    pub schema_dir: PathBuf,
    pub registry: Arc<Registry>,
    /// Include error chains in error responses
    pub dev_mode: bool,
    pub configuration: ConfigurationValidationOptions,
    /// Let the configuration check open a probe connection
    pub probe_database: bool,
}

impl EngineSettings {
    /// Built-in registry; development mode from `CUBEJS_DEV_MODE`.
    pub fn new(env: Environment, schema_dir: impl Into<PathBuf>) -> Self {
        let dev_mode = env.flag("CUBEJS_DEV_MODE").unwrap_or(false);
        Self {
            env,
            schema_dir: schema_dir.into(),
            registry: Arc::new(Registry::default()),
            dev_mode,
            configuration: ConfigurationValidationOptions::default(),
            probe_database: true,
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    pub fn with_configuration_options(mut self, options: ConfigurationValidationOptions) -> Self {
        self.configuration = options;
        self
    }

    pub fn with_database_probe(mut self, probe: bool) -> Self {
        self.probe_database = probe;
        self
    }
}

/// Orchestrates every diagnostic component against one deployment.
pub struct DiagnosticEngine {
    registry: Arc<Registry>,
    configuration: ConfigurationValidationOptions,
    config_validator: ConfigurationValidator,
    connection_tester: ConnectionTester,
    schema_validator: SchemaValidator,
    drift_detector: SchemaDriftDetector,
    corrector: SchemaCorrector,
    pool_monitor: ConnectionPoolMonitor,
    query_validator: QueryValidator,
    error_handler: ErrorHandler,
}

impl std::fmt::Debug for DiagnosticEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticEngine")
            .field("schema_dir", &self.schema_validator.repository().root())
            .field("connection_tester", &self.connection_tester)
            .field("pool_monitor", &self.pool_monitor)
            .finish_non_exhaustive()
    }
}

impl DiagnosticEngine {
    /// Wires every component to the shared catalog, repository and registry.
    pub fn new(settings: EngineSettings, handles: CatalogHandles) -> Self {
        let EngineSettings {
            env,
            schema_dir,
            registry,
            dev_mode,
            configuration,
            probe_database,
        } = settings;
        let CatalogHandles {
            catalog,
            connector,
            pool,
            recorder,
        } = handles;

        let db_config = DatabaseConfig::from_environment(&env);
        let repository = CubeRepository::new(&schema_dir);

        let mut config_validator = ConfigurationValidator::new(env.clone(), &schema_dir);
        if probe_database {
            config_validator = config_validator.with_connector(Arc::clone(&connector));
        }

        Self {
            connection_tester: ConnectionTester::new(
                db_config,
                connector,
                Arc::clone(&catalog),
                Arc::clone(&registry),
            )
            .with_environment(env),
            schema_validator: SchemaValidator::new(Arc::clone(&catalog), repository.clone()),
            drift_detector: SchemaDriftDetector::new(Arc::clone(&catalog), repository.clone()),
            corrector: SchemaCorrector::new(catalog, repository),
            pool_monitor: ConnectionPoolMonitor::new(pool, recorder),
            query_validator: QueryValidator::new(Arc::clone(&registry)),
            error_handler: ErrorHandler::new(dev_mode),
            config_validator,
            configuration,
            registry,
        }
    }

    /// Runs every stage in order and returns the combined report.
    ///
    /// Never fails. A stage error becomes a critical configuration issue and
    /// cancellation through `context` returns the partial report with
    /// `cancelled` set.
    pub async fn run_full_diagnosis(&self, context: &DiagnosticContext) -> DiagnosticReport {
        let span = context.span();
        async {
            info!("Starting full CubeJS diagnostic check");
            let mut report = DiagnosticReport::new(context.correlation_id());

            match self.run_stages(context, &mut report).await {
                Ok(()) => {}
                Err(DiagnosticError::Cancelled { stage }) => {
                    warn!(stage = %stage, "Diagnostic check cancelled");
                    report.cancelled = true;
                }
                Err(e) => {
                    let message = e.detailed_message();
                    error!(error = %message, "Diagnostic check failed");
                    report.connectivity_issues.push(ConnectivityIssue {
                        issue_type: ConnectivityIssueType::ConfigurationError,
                        severity: Severity::Critical,
                        message: format!("Diagnostic engine failure: {}", message),
                        suggestion:
                            "Check system configuration and logs for detailed error information"
                                .to_string(),
                    });
                }
            }

            report.overall_status = determine_overall_status(&report);
            report.recommendations = generate_recommendations(&report);
            report.duration_ms = context.elapsed_ms();

            info!(
                overall_status = %report.overall_status,
                schema_issues = report.schema_issues.len(),
                connectivity_issues = report.connectivity_issues.len(),
                query_issues = report.query_issues.len(),
                cancelled = report.cancelled,
                duration_ms = report.duration_ms,
                "Full diagnostic completed"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn run_stages(&self, context: &DiagnosticContext, report: &mut DiagnosticReport) -> Result<()> {
        info!("Validating CubeJS configuration");
        let config = context
            .run_stage(
                "configuration",
                self.config_validator.validate_configuration(&self.configuration),
            )
            .await?;
        report
            .connectivity_issues
            .extend(config.errors.into_iter().map(|message| ConnectivityIssue {
                issue_type: ConnectivityIssueType::ConfigurationError,
                severity: Severity::High,
                message,
                suggestion: "Review and fix configuration issues before proceeding".to_string(),
            }));

        info!("Testing database connectivity");
        let connectivity = context
            .run_stage("connectivity", self.connection_tester.test_database_connection())
            .await?;
        if !connectivity.is_connected {
            report.connectivity_issues.push(ConnectivityIssue {
                issue_type: ConnectivityIssueType::ConnectionFailure,
                severity: Severity::Critical,
                message: format!(
                    "Database connection failed: {}",
                    connectivity.error.as_deref().unwrap_or("unknown error")
                ),
                suggestion: "Check database connection parameters and ensure PostgreSQL is running"
                    .to_string(),
            });
        }

        info!("Validating cube schemas");
        let schemas = context
            .run_stage("schema_validation", self.schema_validator.validate_all_cubes())
            .await?;
        for result in schemas.into_iter().filter(|r| !r.is_valid) {
            report
                .schema_issues
                .extend(result.errors.into_iter().map(|error| SchemaIssue {
                    issue_type: SchemaIssueType::SchemaError,
                    cube_name: result.cube_name.clone(),
                    severity: error.error_type.severity(),
                    message: error.message,
                    suggestion: error.suggestion,
                    error_type: Some(error.error_type),
                    drift_type: None,
                }));
        }

        info!("Detecting schema drift");
        let drift = context
            .run_stage("drift_detection", self.drift_detector.detect_schema_drift())
            .await??;
        report
            .schema_issues
            .extend(drift.drifts.into_iter().map(|drift| SchemaIssue {
                issue_type: SchemaIssueType::SchemaDrift,
                cube_name: drift.cube_name,
                severity: drift.severity,
                message: drift.description,
                suggestion: drift.recommendation,
                error_type: None,
                drift_type: Some(drift.drift_type),
            }));

        info!("Checking connection pool health");
        context.ensure_active("pool_health")?;
        let pool = self.pool_monitor.get_pool_health();
        if pool.status != HealthStatus::Healthy {
            report
                .connectivity_issues
                .extend(pool.issues.into_iter().map(|issue| ConnectivityIssue {
                    issue_type: ConnectivityIssueType::ConnectionFailure,
                    severity: issue.severity,
                    message: issue.description,
                    suggestion: issue.recommendation,
                }));
        }

        info!("Testing dashboard queries");
        context.ensure_active("query_validation")?;
        let dashboard = &self.registry.dashboard_queries;
        let queries: Vec<CubeQuery> = dashboard.iter().map(|d| d.query.clone()).collect();
        let results = self.validate_queries(&queries);
        for (query, result) in dashboard.iter().zip(results) {
            report
                .query_issues
                .extend(result.errors.into_iter().map(|message| QueryIssue {
                    issue_type: QueryIssueType::QueryValidationError,
                    query_name: Some(query.name.clone()),
                    severity: Severity::Medium,
                    message,
                    suggestion: "Review query structure and security context".to_string(),
                }));
        }

        Ok(())
    }

    /// Validates every cube in the definition directory.
    pub async fn validate_schemas(&self) -> Vec<CubeValidationResult> {
        info!("Starting schema validation for all cubes");
        let results = self.schema_validator.validate_all_cubes().await;
        let valid = results.iter().filter(|r| r.is_valid).count();
        info!(
            total_cubes = results.len(),
            valid_cubes = valid,
            invalid_cubes = results.len() - valid,
            "Schema validation completed"
        );
        results
    }

    /// Probes the database with a fresh connection.
    pub async fn test_connectivity(&self) -> ConnectionTestResult {
        let result = self.connection_tester.test_database_connection().await;
        info!(
            connected = result.is_connected,
            connection_time_ms = result.connection_time_ms,
            postgres_version = %result.postgres_version,
            available_tables = result.available_tables.len(),
            "Database connectivity test completed"
        );
        result
    }

    /// Validates queries under the registry's smoke-test security context.
    pub fn validate_queries(&self, queries: &[CubeQuery]) -> Vec<QueryValidationResult> {
        let context = &self.registry.smoke_test_context;
        let results: Vec<QueryValidationResult> = queries
            .iter()
            .map(|query| self.query_validator.validate_query(query, context))
            .collect();
        let valid = results.iter().filter(|r| r.is_valid).count();
        info!(
            total_queries = queries.len(),
            valid_queries = valid,
            invalid_queries = queries.len() - valid,
            "Query validation completed"
        );
        results
    }

    /// Suggested fixes for every invalid cube in `results`.
    pub async fn generate_schema_fixes(&self, results: &[CubeValidationResult]) -> Vec<SchemaFix> {
        let mut fixes = Vec::new();
        for result in results.iter().filter(|r| !r.is_valid) {
            fixes.extend(self.corrector.generate_schema_fixes(result).await);
        }
        fixes
    }

    /// Translates a query error into a response for the caller.
    pub fn handle_query_error(
        &self,
        error: &(dyn std::error::Error + 'static),
        query: &CubeQuery,
        context: &SecurityContext,
    ) -> ErrorResponse {
        self.error_handler.handle_query_error(error, query, context)
    }

    pub fn connection_tester(&self) -> &ConnectionTester {
        &self.connection_tester
    }

    pub fn schema_validator(&self) -> &SchemaValidator {
        &self.schema_validator
    }

    pub fn drift_detector(&self) -> &SchemaDriftDetector {
        &self.drift_detector
    }

    pub fn pool_monitor(&self) -> &ConnectionPoolMonitor {
        &self.pool_monitor
    }

    pub fn query_validator(&self) -> &QueryValidator {
        &self.query_validator
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.error_handler
    }

    pub fn config_validator(&self) -> &ConfigurationValidator {
        &self.config_validator
    }

    /// Releases the shared pool.
    pub async fn close(&self) {
        self.pool_monitor.stop_lifecycle_monitoring();
        self.connection_tester.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryRelation;
    use crate::pool_monitor::{PoolGauges, PoolSettings};
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn env() -> Environment {
        Environment::from_pairs([
            ("CUBEJS_DB_HOST", "localhost"),
            ("CUBEJS_DB_PORT", "5432"),
            ("CUBEJS_DB_NAME", "crowd"),
            ("CUBEJS_DB_USER", "cube"),
            ("CUBEJS_DB_PASS", "secret"),
            ("CUBEJS_DB_TYPE", "postgres"),
            ("CUBEJS_API_SECRET", SECRET),
        ])
    }

    fn write(dir: &Path, cube: &str, json: &str) {
        std::fs::write(dir.join(format!("{}.json", cube)), json).unwrap();
    }

    fn healthy_catalog() -> Arc<MemoryCatalog> {
        Arc::new(
            MemoryCatalog::new()
                .with_version("PostgreSQL 16.2 on x86_64-pc-linux-gnu")
                .with_relation(
                    MemoryRelation::materialized_view("mv_members")
                        .with_columns(["id", "tenantId", "isBot"])
                        .with_rows(10),
                ),
        )
    }

    fn members_cube(dir: &Path) {
        write(
            dir,
            "Members",
            r#"{
                "sql_table": "mv_members",
                "measures": { "count": { "type": "count" } },
                "dimensions": { "isBot": { "sql": "${CUBE}.\"isBot\"", "type": "boolean" } }
            }"#,
        );
    }

    fn engine(dir: &Path, handles: CatalogHandles) -> DiagnosticEngine {
        DiagnosticEngine::new(EngineSettings::new(env(), dir), handles)
    }

    fn schema_issue(severity: Severity, error_type: SchemaErrorType) -> SchemaIssue {
        SchemaIssue {
            issue_type: SchemaIssueType::SchemaError,
            cube_name: "Members".to_string(),
            severity,
            message: "m".to_string(),
            suggestion: "s".to_string(),
            error_type: Some(error_type),
            drift_type: None,
        }
    }

    #[test]
    fn test_overall_status_from_severities() {
        let mut report = DiagnosticReport::new("c");
        assert_eq!(determine_overall_status(&report), HealthStatus::Healthy);

        report.query_issues.push(QueryIssue {
            issue_type: QueryIssueType::QueryValidationError,
            query_name: None,
            severity: Severity::Medium,
            message: "m".to_string(),
            suggestion: "s".to_string(),
        });
        assert_eq!(determine_overall_status(&report), HealthStatus::Healthy);

        report
            .schema_issues
            .push(schema_issue(Severity::High, SchemaErrorType::MissingColumn));
        assert_eq!(determine_overall_status(&report), HealthStatus::Degraded);

        report.connectivity_issues.push(ConnectivityIssue {
            issue_type: ConnectivityIssueType::ConnectionFailure,
            severity: Severity::Critical,
            message: "m".to_string(),
            suggestion: "s".to_string(),
        });
        assert_eq!(determine_overall_status(&report), HealthStatus::Critical);
    }

    #[test]
    fn test_recommendations_for_critical_report() {
        let mut report = DiagnosticReport::new("c");
        report
            .schema_issues
            .push(schema_issue(Severity::Critical, SchemaErrorType::MissingTable));
        report
            .schema_issues
            .push(schema_issue(Severity::High, SchemaErrorType::MissingColumn));
        report.overall_status = determine_overall_status(&report);

        let recommendations = generate_recommendations(&report);
        assert_eq!(
            recommendations,
            vec![
                "IMMEDIATE ACTION REQUIRED: System has critical issues that prevent normal operation",
                "CRITICAL: Fix missing table references in cube definitions immediately",
                "Update cube definitions to match current database schema",
            ]
        );
    }

    #[tokio::test]
    async fn test_healthy_deployment() {
        let dir = tempfile::tempdir().unwrap();
        members_cube(dir.path());
        let engine = engine(dir.path(), CatalogHandles::memory(healthy_catalog()));

        let report = engine.run_full_diagnosis(&DiagnosticContext::new()).await;

        assert!(report.schema_issues.is_empty(), "{:?}", report.schema_issues);
        assert!(report.connectivity_issues.is_empty(), "{:?}", report.connectivity_issues);
        assert!(report.query_issues.is_empty(), "{:?}", report.query_issues);
        assert_eq!(report.overall_status, HealthStatus::Healthy);
        assert_eq!(
            report.recommendations,
            vec!["System is healthy - continue regular monitoring"]
        );
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_missing_table_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        members_cube(dir.path());
        write(
            dir.path(),
            "Organizations",
            r#"{ "sql_table": "mv_organizations", "measures": { "count": { "type": "count" } } }"#,
        );
        let engine = engine(dir.path(), CatalogHandles::memory(healthy_catalog()));

        let report = engine.run_full_diagnosis(&DiagnosticContext::new()).await;

        assert_eq!(report.overall_status, HealthStatus::Critical);
        let issue = report
            .schema_issues
            .iter()
            .find(|i| i.cube_name == "Organizations")
            .unwrap();
        assert_eq!(issue.error_type, Some(SchemaErrorType::MissingTable));
        assert_eq!(issue.severity, Severity::Critical);
        assert!(report.recommendations[0].starts_with("IMMEDIATE ACTION REQUIRED"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_database_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        members_cube(dir.path());
        let catalog = healthy_catalog();
        catalog.set_unreachable(true);
        let engine = DiagnosticEngine::new(
            EngineSettings::new(env(), dir.path()).with_database_probe(false),
            CatalogHandles::memory(catalog),
        );

        let report = engine.run_full_diagnosis(&DiagnosticContext::new()).await;

        assert_eq!(report.overall_status, HealthStatus::Critical);
        let failure = report
            .connectivity_issues
            .iter()
            .find(|i| i.issue_type == ConnectivityIssueType::ConnectionFailure)
            .unwrap();
        assert!(failure.message.starts_with("Database connection failed:"));
        assert!(report.recommendations.contains(
            &"Verify database connection parameters and PostgreSQL service status".to_string()
        ));
    }

    #[tokio::test]
    async fn test_configuration_errors_degrade() {
        let dir = tempfile::tempdir().unwrap();
        members_cube(dir.path());
        let engine = DiagnosticEngine::new(
            EngineSettings::new(Environment::from_pairs([("CUBEJS_API_SECRET", "short")]), dir.path())
                .with_database_probe(false),
            CatalogHandles::memory(healthy_catalog()),
        );

        let report = engine.run_full_diagnosis(&DiagnosticContext::new()).await;

        assert_eq!(report.overall_status, HealthStatus::Degraded);
        assert!(
            report
                .connectivity_issues
                .iter()
                .all(|i| i.issue_type == ConnectivityIssueType::ConfigurationError)
        );
        assert!(
            report
                .connectivity_issues
                .iter()
                .any(|i| i.message.contains("at least 32 characters"))
        );
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        members_cube(dir.path());
        let pool = Arc::new(FixedPoolSource::new(
            PoolGauges {
                total: 10,
                idle: 0,
                waiting: 6,
            },
            PoolSettings::default(),
        ));
        let handles = CatalogHandles::memory(healthy_catalog()).with_pool_source(pool);
        let engine = engine(dir.path(), handles);

        let report = engine.run_full_diagnosis(&DiagnosticContext::new()).await;

        assert_eq!(report.overall_status, HealthStatus::Critical);
        assert!(
            report
                .connectivity_issues
                .iter()
                .any(|i| i.issue_type == ConnectivityIssueType::ConnectionFailure
                    && i.severity == Severity::Critical)
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        members_cube(dir.path());
        let engine = engine(dir.path(), CatalogHandles::memory(healthy_catalog()));
        let token = CancellationToken::new();
        token.cancel();

        let report = engine
            .run_full_diagnosis(&DiagnosticContext::with_cancellation(token))
            .await;

        assert!(report.cancelled);
        assert_eq!(report.issue_count(), 0);
        assert_eq!(
            report.recommendations,
            vec!["Diagnosis was cancelled before completion - rerun for a full report"]
        );
    }

    #[tokio::test]
    async fn test_validate_queries_uses_smoke_context() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), CatalogHandles::memory(healthy_catalog()));

        let results = engine.validate_queries(&[
            CubeQuery::with_measures(["Organizations.count"]),
            CubeQuery::default(),
        ]);
        assert!(results[0].is_valid);
        assert!(!results[1].is_valid);
    }

    #[tokio::test]
    async fn test_handle_query_error_delegates() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), CatalogHandles::memory(healthy_catalog()));
        let error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "ECONNREFUSED");

        let response = engine.handle_query_error(
            &error,
            &CubeQuery::with_measures(["Members.count"]),
            &SecurityContext::for_tenant("t1"),
        );
        assert_eq!(response.status_code, 500);
        assert_eq!(engine.error_handler().history_len(), 1);
    }
}
