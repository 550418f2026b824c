//! Database reachability and materialized view access probes.
//!
//! Every probe runs as `retry_with_backoff(|| breaker.execute(op), profile)`
//! against one [`CircuitBreaker`] owned by the tester, so a target that keeps
//! failing is rejected quickly instead of being retried on every call.

use crate::catalog::{Catalog, Connector};
use crate::config::{DatabaseConfig, Environment};
use crate::models::{ColumnInfo, ConfigValidationResult};
use crate::registry::Registry;
use crate::retry::{CircuitBreaker, RetryOptions, retry_with_backoff};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of [`ConnectionTester::test_database_connection`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub is_connected: bool,
    /// Wall time including retries, in milliseconds
    pub connection_time_ms: u64,
    /// Product and version, e.g. `PostgreSQL 16.2`, or `Unknown`
    pub postgres_version: String,
    /// Every non-system relation as `schema.name (kind)`
    pub available_tables: Vec<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Accessibility of one materialized view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewAccessResult {
    pub view_name: String,
    pub accessible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub column_count: usize,
}

/// Detailed state of one materialized view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedViewInfo {
    pub view_name: String,
    pub exists: bool,
    pub columns: Vec<ColumnInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

#[derive(Debug)]
struct ServerInfo {
    version: String,
    relations: Vec<String>,
}

/// `PostgreSQL 16.2 on x86_64-pc-linux-gnu, ...` becomes `PostgreSQL 16.2`.
fn short_version(banner: &str) -> String {
    let short: Vec<&str> = banner.split_whitespace().take(2).collect();
    if short.is_empty() {
        "Unknown".to_string()
    } else {
        short.join(" ").trim_end_matches(',').to_string()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Connectivity checks for one database target.
///
/// `test_database_connection` opens its own single-connection pool through
/// the connector, so it reflects whether a fresh client can log in. View
/// probes use the shared catalog.
pub struct ConnectionTester {
    config: DatabaseConfig,
    env: Option<Environment>,
    connector: Arc<dyn Connector>,
    catalog: Arc<dyn Catalog>,
    registry: Arc<Registry>,
    breaker: CircuitBreaker,
    connection_retry: RetryOptions,
    query_retry: RetryOptions,
}

impl std::fmt::Debug for ConnectionTester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTester")
            .field("target", &self.config.to_string())
            .field("breaker", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionTester {
    /// Creates a tester with the default retry profiles and a breaker of
    /// 5 failures / 60 s recovery.
    pub fn new(
        config: DatabaseConfig,
        connector: Arc<dyn Connector>,
        catalog: Arc<dyn Catalog>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            config,
            env: None,
            connector,
            catalog,
            registry,
            breaker: CircuitBreaker::default(),
            connection_retry: RetryOptions::database_connection(),
            query_retry: RetryOptions::query(),
        }
    }

    /// Builder method to include the environment check in
    /// [`validate_configuration`](Self::validate_configuration).
    pub fn with_environment(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    /// Builder method to replace both retry profiles.
    pub fn with_retry_options(mut self, connection: RetryOptions, query: RetryOptions) -> Self {
        self.connection_retry = connection;
        self.query_retry = query;
        self
    }

    /// Builder method to replace the circuit breaker.
    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    /// The breaker guarding this target
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Logs in with a fresh single-connection pool and lists the server's
    /// version and relations.
    ///
    /// Failures are reported in the result, never returned as errors.
    pub async fn test_database_connection(&self) -> ConnectionTestResult {
        let start = Instant::now();

        let outcome = retry_with_backoff(
            || {
                self.breaker.execute(|| async {
                    let catalog = self.connector.connect(1).await?;
                    let probe = async {
                        let version = catalog.server_version().await?;
                        let relations = catalog.list_relations().await?;
                        Ok::<_, crate::DiagnosticError>(ServerInfo {
                            version: short_version(&version),
                            relations: relations.iter().map(ToString::to_string).collect(),
                        })
                    }
                    .await;
                    catalog.close().await;
                    probe
                })
            },
            &self.connection_retry,
        )
        .await;

        let connection_time_ms = elapsed_ms(start);
        let attempts = outcome.attempts;

        match outcome.into_result() {
            Ok(info) => {
                info!(
                    connection_time_ms,
                    attempts,
                    postgres_version = %info.version,
                    table_count = info.relations.len(),
                    "Database connection test successful"
                );
                ConnectionTestResult {
                    is_connected: true,
                    connection_time_ms,
                    postgres_version: info.version,
                    available_tables: info.relations,
                    attempts,
                    error: None,
                }
            }
            Err(e) => {
                let message = e.detailed_message();
                error!(
                    error = %message,
                    attempts,
                    connection_time_ms,
                    target = %self.config,
                    "Database connection test failed after retries"
                );
                ConnectionTestResult {
                    is_connected: false,
                    connection_time_ms,
                    postgres_version: "Unknown".to_string(),
                    available_tables: Vec::new(),
                    attempts,
                    error: Some(message),
                }
            }
        }
    }

    /// Presence and range checks on the connection parameters, plus the
    /// soft environment check when an environment was supplied.
    pub fn validate_configuration(&self) -> ConfigValidationResult {
        let result = self.config.validate_parameters_with(self.env.as_ref());
        info!(
            is_valid = result.is_valid,
            error_count = result.errors.len(),
            warning_count = result.warnings.len(),
            checked_item_count = result.checked_items.len(),
            "Configuration validation completed"
        );
        result
    }

    /// Probes every materialized view in the registry.
    ///
    /// If the pool cannot hand out a connection at all, every view is
    /// reported inaccessible with that error.
    pub async fn check_materialized_view_access(&self) -> Vec<ViewAccessResult> {
        let views = &self.registry.materialized_views;

        let reachable = retry_with_backoff(
            || self.breaker.execute(|| self.catalog.ping()),
            &self.query_retry,
        )
        .await;
        if let Err(e) = reachable.into_result() {
            let message = e.detailed_message();
            error!(error = %message, "Failed to check materialized view access");
            return views
                .iter()
                .map(|view| ViewAccessResult {
                    view_name: view.clone(),
                    accessible: false,
                    error: Some(format!("Pool connection failed: {}", message)),
                    column_count: 0,
                })
                .collect();
        }

        let mut results = Vec::with_capacity(views.len());
        for view in views {
            let outcome = retry_with_backoff(
                || {
                    self.breaker.execute(|| async {
                        if self.catalog.materialized_view(view).await?.is_none() {
                            return Ok(None);
                        }
                        let column_count = self.catalog.column_count(view).await?;
                        Ok::<_, crate::DiagnosticError>(Some(column_count))
                    })
                },
                &self.query_retry,
            )
            .await;
            let attempts = outcome.attempts;

            let result = match outcome.into_result() {
                Ok(Some(column_count)) => {
                    debug!(view = %view, column_count, attempts, "Materialized view is accessible");
                    ViewAccessResult {
                        view_name: view.clone(),
                        accessible: true,
                        error: None,
                        column_count,
                    }
                }
                Ok(None) => {
                    warn!(view = %view, "Materialized view does not exist");
                    ViewAccessResult {
                        view_name: view.clone(),
                        accessible: false,
                        error: Some("Materialized view does not exist".to_string()),
                        column_count: 0,
                    }
                }
                Err(e) => {
                    let message = e.detailed_message();
                    error!(view = %view, error = %message, attempts, "Failed to access materialized view after retries");
                    ViewAccessResult {
                        view_name: view.clone(),
                        accessible: false,
                        error: Some(message),
                        column_count: 0,
                    }
                }
            };
            results.push(result);
        }

        results
    }

    /// Columns and, if populated, row count of one materialized view.
    ///
    /// Best effort: any failure reports the view as nonexistent.
    pub async fn get_materialized_view_info(&self, view_name: &str) -> MaterializedViewInfo {
        let missing = || MaterializedViewInfo {
            view_name: view_name.to_string(),
            exists: false,
            columns: Vec::new(),
            row_count: None,
        };

        let record = match self.catalog.materialized_view(view_name).await {
            Ok(Some(record)) => record,
            Ok(None) => return missing(),
            Err(e) => {
                error!(view = %view_name, error = %e.detailed_message(), "Failed to get materialized view info");
                return missing();
            }
        };

        let columns = match self.catalog.columns(view_name).await {
            Ok(columns) => columns,
            Err(e) => {
                error!(view = %view_name, error = %e.detailed_message(), "Failed to get materialized view info");
                return missing();
            }
        };

        let row_count = if record.populated {
            match self.catalog.row_count(view_name).await {
                Ok(count) => Some(count),
                Err(e) => {
                    warn!(view = %view_name, error = %e.detailed_message(), "Could not get row count");
                    None
                }
            }
        } else {
            None
        };

        MaterializedViewInfo {
            view_name: view_name.to_string(),
            exists: true,
            columns,
            row_count,
        }
    }

    /// Releases the shared pool.
    pub async fn close(&self) {
        self.catalog.close().await;
        info!("Connection tester pool closed");
    }
}
