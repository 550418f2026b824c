//! End-to-end scenarios against the in-memory catalog.
//!
//! Each test builds a definition directory in a temp dir and a catalog that
//! reproduces one deployment problem, then checks the component that should
//! surface it.

use cubecheck_core::catalog::{MemoryCatalog, MemoryConnector, MemoryRelation};
use cubecheck_core::config::{ConfigurationValidator, DatabaseConfig, Environment};
use cubecheck_core::connection_tester::ConnectionTester;
use cubecheck_core::corrector::{FixType, SchemaCorrector};
use cubecheck_core::cube::CubeRepository;
use cubecheck_core::drift::{DriftType, SchemaDriftDetector};
use cubecheck_core::engine::{CatalogHandles, DiagnosticEngine, EngineSettings};
use cubecheck_core::error_handler::{ErrorCategory, ErrorHandler, classify_error};
use cubecheck_core::models::{ColumnInfo, HealthStatus};
use cubecheck_core::pool_monitor::{
    ConnectionPoolMonitor, EventRecorder, FixedPoolSource, PoolGauges, PoolIssueType, PoolSettings,
};
use cubecheck_core::query::{CubeQuery, QueryValidator, SecurityContext};
use cubecheck_core::registry::Registry;
use cubecheck_core::retry::{CircuitBreaker, CircuitState, RetryOptions};
use cubecheck_core::schema_validator::{SchemaErrorType, SchemaValidator};
use cubecheck_core::{DiagnosticContext, DiagnosticError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn write(dir: &Path, cube: &str, json: &str) {
    std::fs::write(dir.join(format!("{}.json", cube)), json).unwrap();
}

fn crowd_catalog() -> Arc<MemoryCatalog> {
    Arc::new(
        MemoryCatalog::new()
            .with_relation(
                MemoryRelation::materialized_view("mv_members")
                    .with_column(ColumnInfo::new("id", "uuid").primary_key())
                    .with_column(ColumnInfo::new("tenantId", "uuid"))
                    .with_rows(3),
            )
            .with_relation(
                MemoryRelation::materialized_view("mv_activities")
                    .with_columns(["id", "memberId", "platform", "timestamp"]),
            ),
    )
}

fn crowd_definitions(dir: &Path) {
    write(
        dir,
        "Members",
        r#"{
            "sql_table": "mv_members",
            "measures": { "count": { "type": "count" } },
            "dimensions": {
                "id": { "sql": "${CUBE}.id", "type": "string", "primary_key": true },
                "isBot": { "sql": "${CUBE}.\"isBot\"", "type": "boolean" }
            },
            "joins": {
                "Activities": { "sql": "${CUBE}.id = ${Activities}.\"memberId\"", "relationship": "hasMany" }
            }
        }"#,
    );
    write(
        dir,
        "Organizations",
        r#"{ "sql_table": "mv_organizations", "measures": { "count": { "type": "count" } } }"#,
    );
    write(
        dir,
        "Activities",
        r#"{
            "sql_table": "mv_activities",
            "measures": { "count": { "type": "count" } },
            "dimensions": { "platform": { "sql": "${CUBE}.platform", "type": "string" } }
        }"#,
    );
}

#[tokio::test]
async fn test_missing_materialized_view_scenario() {
    let dir = tempfile::tempdir().unwrap();
    crowd_definitions(dir.path());
    let validator = SchemaValidator::new(crowd_catalog(), CubeRepository::new(dir.path()));

    let result = validator.validate_cube("Organizations").await;

    assert!(!result.is_valid);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].error_type, SchemaErrorType::MissingTable);
    assert_eq!(result.table_name, "mv_organizations");
}

#[tokio::test]
async fn test_dangling_column_scenario() {
    let dir = tempfile::tempdir().unwrap();
    crowd_definitions(dir.path());
    let catalog = crowd_catalog();
    let validator = SchemaValidator::new(catalog.clone(), CubeRepository::new(dir.path()));

    let result = validator.validate_cube("Members").await;

    assert!(!result.is_valid);
    assert_eq!(result.missing_columns, vec!["isBot"]);
    let missing: Vec<_> = result
        .errors
        .iter()
        .filter(|e| e.error_type == SchemaErrorType::MissingColumn)
        .collect();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].field, "dimensions.isBot");

    let corrector = SchemaCorrector::new(catalog, CubeRepository::new(dir.path()));
    let fixes = corrector.generate_schema_fixes(&result).await;
    assert!(fixes.iter().all(|f| f.cube_name == "Members"));
    assert!(
        fixes
            .iter()
            .all(|f| f.fix_type != FixType::ColumnRename || f.original_value == "isBot")
    );
}

#[tokio::test]
async fn test_validate_all_cubes_continues_past_bad_definition() {
    let dir = tempfile::tempdir().unwrap();
    crowd_definitions(dir.path());
    write(dir.path(), "Broken", "{ not json");
    let validator = SchemaValidator::new(crowd_catalog(), CubeRepository::new(dir.path()));

    let results = validator.validate_all_cubes().await;

    assert_eq!(results.len(), 4);
    let broken = results.iter().find(|r| r.cube_name == "Broken").unwrap();
    assert_eq!(broken.errors.len(), 1);
    assert_eq!(broken.errors[0].error_type, SchemaErrorType::SyntaxError);
    let activities = results.iter().find(|r| r.cube_name == "Activities").unwrap();
    assert!(activities.is_valid);
}

#[tokio::test]
async fn test_snapshot_idempotence_and_column_drop() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "Activities",
        r#"{ "sql_table": "mv_activities", "dimensions": { "platform": { "sql": "${CUBE}.platform" } } }"#,
    );
    let catalog = crowd_catalog();
    let detector = SchemaDriftDetector::new(catalog.clone(), CubeRepository::new(dir.path()));

    let first = detector.create_schema_snapshot("Activities").await.unwrap();
    let second = detector.create_schema_snapshot("Activities").await.unwrap();
    assert_eq!(first.checksum, second.checksum);

    let report = detector.detect_schema_drift().await.unwrap();
    assert_eq!(report.total_drifts, 0);

    assert!(catalog.alter_relation("mv_activities", |relation| {
        *relation = MemoryRelation::materialized_view("mv_activities")
            .with_columns(["id", "memberId", "timestamp", "channel"]);
    }));

    let report = detector.detect_schema_drift().await.unwrap();
    let types: Vec<DriftType> = report.drifts.iter().map(|d| d.drift_type).collect();
    assert!(types.contains(&DriftType::ColumnMissing));
    assert!(types.contains(&DriftType::ColumnAdded));
    assert!(
        report
            .drifts
            .iter()
            .any(|d| d.drift_type == DriftType::ColumnMissing && d.expected_value == "platform")
    );
}

#[test]
fn test_healthy_query_scenario() {
    let validator = QueryValidator::new(Arc::new(Registry::default()));
    let query = CubeQuery::with_measures(["Organizations.count"]);

    let result = validator.validate_query(&query, &SecurityContext::for_tenant("t1"));

    assert!(result.is_valid);
    assert!(result.errors.is_empty());
    assert_eq!(result.sanitized_query.unwrap().measures, query.measures);
}

#[test]
fn test_security_context_precedence() {
    let validator = QueryValidator::new(Arc::new(Registry::default()));
    let security_only = validator.validate_security_context(&SecurityContext::default());

    for query in [CubeQuery::default(), CubeQuery::with_measures(["Nope.count"])] {
        let result = validator.validate_query(&query, &SecurityContext::default());
        assert!(!result.is_valid);
        assert_eq!(result.errors, security_only.errors);
    }
}

#[test]
fn test_dashboard_catalog_passes_with_smoke_context() {
    let validator = QueryValidator::new(Arc::new(Registry::default()));
    let results = validator.test_dashboard_queries();

    assert_eq!(results.len(), Registry::default().dashboard_queries.len());
    assert!(results.iter().all(|r| r.success), "{:?}", results);
}

#[test]
fn test_pool_exhaustion_scenario() {
    let source = Arc::new(FixedPoolSource::new(
        PoolGauges {
            total: 4,
            idle: 2,
            waiting: 6,
        },
        PoolSettings::default(),
    ));
    let monitor = ConnectionPoolMonitor::new(source, EventRecorder::new());

    let health = monitor.get_pool_health();

    assert_eq!(health.status, HealthStatus::Critical);
    let exhaustion: Vec<_> = health
        .issues
        .iter()
        .filter(|i| i.issue_type == PoolIssueType::PoolExhaustion)
        .collect();
    assert_eq!(exhaustion.len(), 1);
}

#[test]
fn test_short_api_secret_scenario() {
    let env = Environment::from_pairs([("CUBEJS_API_SECRET", "only-twenty-chars!!!")]);
    let validator = ConfigurationValidator::new(env, "/nonexistent");

    let jwt = validator.validate_jwt_functionality();

    assert!(!jwt.is_valid);
    assert!(jwt.errors.iter().any(|e| e.contains("32")));
}

#[test]
fn test_connection_refused_classification() {
    let handler = ErrorHandler::default();
    let contexts = [
        SecurityContext::default(),
        SecurityContext::for_tenant("t1"),
        SecurityContext {
            segments: Some(Vec::new()),
            ..SecurityContext::for_tenant("t2")
        },
    ];
    let queries = [CubeQuery::default(), CubeQuery::with_measures(["Members.count"])];

    for context in &contexts {
        assert_eq!(
            classify_error("connect ECONNREFUSED 10.0.0.5:5432", context),
            ErrorCategory::Database
        );
        for query in &queries {
            let response =
                handler.handle_error_message("connect ECONNREFUSED 10.0.0.5:5432", query, context);
            assert_eq!(response.status_code, 500);
            assert!(!response.debug_info.correlation_id.is_empty());
            assert!((2..=5).contains(&response.suggestions.len()));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_connection_tester_recovers_from_refusals() {
    let catalog = crowd_catalog();
    let connector = Arc::new(MemoryConnector::new(catalog.clone()).failing_first(2));
    let tester = ConnectionTester::new(
        DatabaseConfig::default(),
        connector.clone(),
        catalog,
        Arc::new(Registry::default()),
    );

    let result = tester.test_database_connection().await;

    assert!(result.is_connected);
    assert_eq!(result.attempts, 3);
    assert_eq!(connector.attempts(), 3);
    assert_eq!(tester.breaker().state(), CircuitState::Closed);
    assert!(
        result
            .available_tables
            .iter()
            .any(|t| t.contains("mv_members"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_on_unreachable_target() {
    let catalog = crowd_catalog();
    catalog.set_unreachable(true);
    let tester = ConnectionTester::new(
        DatabaseConfig::default(),
        Arc::new(MemoryConnector::new(catalog.clone())),
        catalog,
        Arc::new(Registry::default()),
    )
    .with_breaker(CircuitBreaker::new(2, Duration::from_secs(60)))
    .with_retry_options(
        RetryOptions::database_connection().with_max_attempts(2),
        RetryOptions::query().with_max_attempts(1),
    );

    let first = tester.test_database_connection().await;
    assert!(!first.is_connected);
    assert_eq!(tester.breaker().state(), CircuitState::Open);

    let views = tester.check_materialized_view_access().await;
    assert!(views.iter().all(|v| !v.accessible));
    assert!(
        views
            .iter()
            .all(|v| v.error.as_deref().is_some_and(|e| e.contains("Circuit breaker is open")))
    );
}

#[tokio::test]
async fn test_materialized_view_access() {
    let catalog = crowd_catalog();
    let tester = ConnectionTester::new(
        DatabaseConfig::default(),
        Arc::new(MemoryConnector::new(catalog.clone())),
        catalog,
        Arc::new(Registry::default()),
    );

    let views = tester.check_materialized_view_access().await;
    let members = views.iter().find(|v| v.view_name == "mv_members").unwrap();
    assert!(members.accessible);
    assert_eq!(members.column_count, 2);
    let organizations = views.iter().find(|v| v.view_name == "mv_organizations").unwrap();
    assert!(!organizations.accessible);

    let info = tester.get_materialized_view_info("mv_members").await;
    assert!(info.exists);
    assert_eq!(info.row_count, Some(3));
}

#[tokio::test]
async fn test_full_diagnosis_of_crowd_deployment() {
    let dir = tempfile::tempdir().unwrap();
    crowd_definitions(dir.path());
    let env = Environment::from_pairs([
        ("CUBEJS_DB_HOST", "localhost"),
        ("CUBEJS_DB_PORT", "5432"),
        ("CUBEJS_DB_NAME", "crowd"),
        ("CUBEJS_DB_USER", "cube"),
        ("CUBEJS_DB_PASS", "secret"),
        ("CUBEJS_DB_TYPE", "postgres"),
        ("CUBEJS_API_SECRET", "0123456789abcdef0123456789abcdef"),
    ]);
    let engine = DiagnosticEngine::new(
        EngineSettings::new(env, dir.path()),
        CatalogHandles::memory(crowd_catalog()),
    );

    let report = engine.run_full_diagnosis(&DiagnosticContext::new()).await;

    assert_eq!(report.overall_status, HealthStatus::Critical);
    assert!(report.connectivity_issues.is_empty(), "{:?}", report.connectivity_issues);
    assert!(report.schema_issues.iter().any(|i| i.cube_name == "Organizations"));
    assert!(report.schema_issues.iter().any(|i| i.cube_name == "Members"));
    assert!(
        report
            .recommendations
            .contains(&"Update cube definitions to match current database schema".to_string())
    );

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["overall_status"], "critical");
    assert_eq!(json["schema_issues"][0]["type"], "schema_error");
}

#[tokio::test]
async fn test_cancelled_error_is_distinct() {
    let context = DiagnosticContext::new();
    context.cancellation().cancel();
    assert!(matches!(
        context.ensure_active("connectivity"),
        Err(DiagnosticError::Cancelled { .. })
    ));
}
