//! PostgreSQL catalog backed by a shared sqlx pool.
//!
//! # Security
//! - Every pooled session is read-only and carries a statement timeout
//! - Connection parameters are never logged; only the redacted URL is
//! - Relation names are bound as parameters except in `COUNT(*)`, where they
//!   are quoted identifiers
//!
//! Introspection reads `pg_catalog` directly. `information_schema` does not
//! list materialized views or their columns.

use super::helpers::{RowExt, quote_identifier};
use super::{Catalog, Connector};
use crate::config::DatabaseConfig;
use crate::models::{
    ColumnInfo, ConstraintInfo, ConstraintKind, IndexInfo, MaterializedViewRecord, RelationInfo,
    RelationKind,
};
use crate::pool_monitor::{
    ConnectionLifecycleEvent, EventRecorder, Lease, LifecycleEventType, PoolGauges, PoolSettings,
    PoolSource,
};
use crate::{DiagnosticError, Result};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode, Postgres};
use std::sync::Arc;
use std::time::Duration;

/// Schema searched for unqualified relation names
pub const DEFAULT_SCHEMA: &str = "public";

const SYSTEM_SCHEMA_FILTER: &str =
    "n.nspname NOT IN ('pg_catalog', 'information_schema') AND n.nspname NOT LIKE 'pg_toast%'";

/// Builds connect options from a [`DatabaseConfig`].
pub(crate) fn connect_options(config: &DatabaseConfig) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .username(&config.user)
        .password(config.password.as_str())
        .database(&config.database)
        .ssl_mode(if config.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        });
    if let Some(port) = config.socket_port() {
        options = options.port(port);
    }
    options
}

/// Catalog over a lazily connecting PostgreSQL pool.
///
/// All connections are leased through an [`EventRecorder`], so the same
/// value doubles as the [`PoolSource`] for pool monitoring.
pub struct PostgresCatalog {
    pool: PgPool,
    schema: String,
    recorder: EventRecorder,
    settings: PoolSettings,
    target: String,
}

impl std::fmt::Debug for PostgresCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCatalog")
            .field("target", &self.target)
            .field("schema", &self.schema)
            .field("pool_size", &self.pool.size())
            .field("pool_idle", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresCatalog {
    /// Creates the pool without connecting.
    ///
    /// Every new session gets the configured statement timeout, an
    /// `application_name` and read-only transactions, and is recorded as a
    /// `Created` lifecycle event.
    pub fn connect_lazy(
        config: &DatabaseConfig,
        max_connections: u32,
        recorder: EventRecorder,
    ) -> Self {
        let max_connections = max_connections.clamp(1, 100);
        let statement_timeout_ms = config.statement_timeout.as_millis();
        let session_recorder = recorder.clone();

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(0)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .test_before_acquire(true)
            .after_connect(move |conn, _meta| {
                let recorder = session_recorder.clone();
                Box::pin(async move {
                    use sqlx::Executor;

                    conn.execute(
                        format!("SET statement_timeout = '{}ms'", statement_timeout_ms).as_str(),
                    )
                    .await?;

                    let app_name = format!("cubecheck-{}", env!("CARGO_PKG_VERSION"));
                    conn.execute(format!("SET application_name = '{}'", app_name).as_str())
                        .await?;

                    conn.execute("SET default_transaction_read_only = on")
                        .await?;

                    let connection_id = recorder.next_connection_id();
                    recorder.record(ConnectionLifecycleEvent::new(
                        LifecycleEventType::Created,
                        connection_id,
                    ));
                    Ok(())
                })
            })
            .connect_lazy_with(connect_options(config));

        tracing::debug!(
            target = %config.redacted_url(),
            max_connections,
            "Created lazy PostgreSQL pool"
        );

        Self {
            pool,
            schema: DEFAULT_SCHEMA.to_string(),
            recorder,
            settings: PoolSettings {
                max_connections,
                min_connections: 0,
                connection_timeout_ms: u64::try_from(config.connect_timeout.as_millis())
                    .unwrap_or(u64::MAX),
                idle_timeout_ms: u64::try_from(config.idle_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            },
            target: config.to_string(),
        }
    }

    /// Creates the pool and opens one connection to prove reachability.
    ///
    /// # Errors
    /// Returns a connection error if the server cannot be reached or the
    /// login is rejected.
    pub async fn connect(
        config: &DatabaseConfig,
        max_connections: u32,
        recorder: EventRecorder,
    ) -> Result<Self> {
        let catalog = Self::connect_lazy(config, max_connections, recorder);
        catalog.ping().await?;
        tracing::info!(target = %catalog.target, "Connected to PostgreSQL");
        Ok(catalog)
    }

    /// Builder method to resolve relations in another schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Recorder receiving this pool's lifecycle events
    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    async fn acquire(&self) -> Result<Lease<PoolConnection<Postgres>>> {
        let timeout = Duration::from_millis(self.settings.connection_timeout_ms);
        self.recorder
            .acquire(self.pool.acquire())
            .await
            .map_err(|e| match e {
                sqlx::Error::PoolTimedOut => {
                    DiagnosticError::connection_timeout("connection pool", timeout)
                }
                other => DiagnosticError::connection_failed(other),
            })
    }
}

fn relation_kind(code: &str) -> RelationKind {
    match code {
        "m" => RelationKind::MaterializedView,
        "v" => RelationKind::View,
        _ => RelationKind::Table,
    }
}

fn constraint_kind(code: &str) -> Option<ConstraintKind> {
    match code {
        "p" => Some(ConstraintKind::PrimaryKey),
        "f" => Some(ConstraintKind::ForeignKey),
        "u" => Some(ConstraintKind::Unique),
        "c" => Some(ConstraintKind::Check),
        _ => None,
    }
}

fn matview_record(row: &sqlx::postgres::PgRow) -> Result<MaterializedViewRecord> {
    Ok(MaterializedViewRecord {
        schema: row.get_field("schema_name", Some("pg_matviews"))?,
        name: row.get_field("view_name", Some("pg_matviews"))?,
        populated: row.get_field("is_populated", Some("pg_matviews"))?,
        has_indexes: row.get_field("has_indexes", Some("pg_matviews"))?,
    })
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.acquire().await?;
        let result: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&mut **conn)
            .await
            .map_err(DiagnosticError::connection_failed)?;
        if result != 1 {
            return Err(DiagnosticError::configuration(
                "Basic connectivity test failed: unexpected result",
            ));
        }
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        let mut conn = self.acquire().await?;
        sqlx::query_scalar("SELECT version()")
            .fetch_one(&mut **conn)
            .await
            .map_err(|e| DiagnosticError::query_failed("Failed to read server version", e))
    }

    async fn list_relations(&self) -> Result<Vec<RelationInfo>> {
        let mut conn = self.acquire().await?;
        let query = format!(
            r#"
            SELECT n.nspname::text AS schema_name,
                   c.relname::text AS relation_name,
                   c.relkind::text AS relation_kind
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p', 'v', 'm')
              AND {}
            ORDER BY n.nspname, c.relname
            "#,
            SYSTEM_SCHEMA_FILTER
        );
        let rows = sqlx::query(&query)
            .fetch_all(&mut **conn)
            .await
            .map_err(|e| DiagnosticError::query_failed("Failed to list relations", e))?;

        let mut relations = Vec::with_capacity(rows.len());
        for row in &rows {
            let kind: String = row.get_field("relation_kind", None)?;
            relations.push(RelationInfo {
                schema: row.get_field("schema_name", None)?,
                name: row.get_field("relation_name", None)?,
                kind: relation_kind(&kind),
            });
        }
        tracing::debug!("Listed {} relations", relations.len());
        Ok(relations)
    }

    async fn relation_exists(&self, relation: &str) -> Result<bool> {
        let mut conn = self.acquire().await?;
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM pg_class c
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1
                  AND c.relname = $2
                  AND c.relkind IN ('r', 'p', 'v', 'm')
            )
            "#,
        )
        .bind(&self.schema)
        .bind(relation)
        .fetch_one(&mut **conn)
        .await
        .map_err(|e| {
            DiagnosticError::query_failed(format!("Failed to look up relation {}", relation), e)
        })
    }

    async fn columns(&self, relation: &str) -> Result<Vec<ColumnInfo>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT a.attname::text AS column_name,
                   format_type(a.atttypid, NULL) AS data_type,
                   NOT a.attnotnull AS is_nullable,
                   EXISTS (
                       SELECT 1 FROM pg_index i
                       WHERE i.indrelid = c.oid
                         AND i.indisprimary
                         AND a.attnum = ANY (i.indkey::int2[])
                   ) AS is_primary_key
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1
              AND c.relname = $2
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY a.attnum
            "#,
        )
        .bind(&self.schema)
        .bind(relation)
        .fetch_all(&mut **conn)
        .await
        .map_err(|e| {
            DiagnosticError::query_failed(format!("Failed to read columns of {}", relation), e)
        })?;

        rows.iter()
            .map(|row| {
                Ok(ColumnInfo {
                    name: row.get_field("column_name", Some(relation))?,
                    data_type: row.get_field("data_type", Some(relation))?,
                    nullable: row.get_field("is_nullable", Some(relation))?,
                    is_primary_key: row.get_field("is_primary_key", Some(relation))?,
                })
            })
            .collect()
    }

    async fn indexes(&self, relation: &str) -> Result<Vec<IndexInfo>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT ic.relname::text AS index_name,
                   ix.indisunique AS is_unique,
                   am.amname::text AS index_type,
                   ARRAY(
                       SELECT a.attname::text
                       FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                       JOIN pg_attribute a ON a.attrelid = ix.indrelid AND a.attnum = k.attnum
                       ORDER BY k.ord
                   ) AS column_names
            FROM pg_index ix
            JOIN pg_class t ON t.oid = ix.indrelid
            JOIN pg_class ic ON ic.oid = ix.indexrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_am am ON am.oid = ic.relam
            WHERE n.nspname = $1
              AND t.relname = $2
            ORDER BY ic.relname
            "#,
        )
        .bind(&self.schema)
        .bind(relation)
        .fetch_all(&mut **conn)
        .await
        .map_err(|e| {
            DiagnosticError::query_failed(format!("Failed to read indexes of {}", relation), e)
        })?;

        rows.iter()
            .map(|row| {
                Ok(IndexInfo {
                    name: row.get_field("index_name", Some(relation))?,
                    columns: row.get_field("column_names", Some(relation))?,
                    unique: row.get_field("is_unique", Some(relation))?,
                    index_type: row.get_field("index_type", Some(relation))?,
                })
            })
            .collect()
    }

    async fn constraints(&self, relation: &str) -> Result<Vec<ConstraintInfo>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT con.conname::text AS constraint_name,
                   con.contype::text AS constraint_type,
                   ARRAY(
                       SELECT a.attname::text
                       FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                       JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                       ORDER BY k.ord
                   ) AS column_names,
                   ref.relname::text AS referenced_table,
                   ARRAY(
                       SELECT a.attname::text
                       FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                       JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                       ORDER BY k.ord
                   ) AS referenced_columns
            FROM pg_constraint con
            JOIN pg_class c ON c.oid = con.conrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_class ref ON ref.oid = con.confrelid
            WHERE n.nspname = $1
              AND c.relname = $2
              AND con.contype IN ('p', 'f', 'u', 'c')
            ORDER BY con.conname
            "#,
        )
        .bind(&self.schema)
        .bind(relation)
        .fetch_all(&mut **conn)
        .await
        .map_err(|e| {
            DiagnosticError::query_failed(format!("Failed to read constraints of {}", relation), e)
        })?;

        let mut constraints = Vec::with_capacity(rows.len());
        for row in &rows {
            let code: String = row.get_field("constraint_type", Some(relation))?;
            let Some(kind) = constraint_kind(&code) else {
                continue;
            };
            constraints.push(ConstraintInfo {
                name: row.get_field("constraint_name", Some(relation))?,
                kind,
                columns: row.get_field("column_names", Some(relation))?,
                referenced_table: row.get_field("referenced_table", Some(relation))?,
                referenced_columns: row.get_field("referenced_columns", Some(relation))?,
            });
        }
        Ok(constraints)
    }

    async fn materialized_views(&self) -> Result<Vec<MaterializedViewRecord>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT schemaname::text AS schema_name,
                   matviewname::text AS view_name,
                   ispopulated AS is_populated,
                   hasindexes AS has_indexes
            FROM pg_matviews
            WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
            ORDER BY schemaname, matviewname
            "#,
        )
        .fetch_all(&mut **conn)
        .await
        .map_err(|e| DiagnosticError::query_failed("Failed to list materialized views", e))?;

        rows.iter().map(matview_record).collect()
    }

    async fn materialized_view(&self, name: &str) -> Result<Option<MaterializedViewRecord>> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT schemaname::text AS schema_name,
                   matviewname::text AS view_name,
                   ispopulated AS is_populated,
                   hasindexes AS has_indexes
            FROM pg_matviews
            WHERE matviewname = $1
              AND schemaname NOT IN ('pg_catalog', 'information_schema')
            ORDER BY (schemaname = $2) DESC, schemaname
            LIMIT 1
            "#,
        )
        .bind(name)
        .bind(&self.schema)
        .fetch_optional(&mut **conn)
        .await
        .map_err(|e| {
            DiagnosticError::query_failed(format!("Failed to look up materialized view {}", name), e)
        })?;

        row.as_ref().map(matview_record).transpose()
    }

    async fn row_count(&self, relation: &str) -> Result<u64> {
        let mut conn = self.acquire().await?;
        let query = format!(
            "SELECT COUNT(*) FROM {}.{}",
            quote_identifier(&self.schema),
            quote_identifier(relation)
        );
        let count: i64 = sqlx::query_scalar(&query)
            .fetch_one(&mut **conn)
            .await
            .map_err(|e| {
                DiagnosticError::query_failed(format!("Failed to count rows of {}", relation), e)
            })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn close(&self) {
        let open = self.pool.size();
        self.pool.close().await;
        self.recorder.record(ConnectionLifecycleEvent::new(
            LifecycleEventType::Destroyed,
            format!("pool_{}_connections", open),
        ));
        tracing::info!(target = %self.target, "Closed PostgreSQL pool");
    }
}

impl PoolSource for PostgresCatalog {
    fn gauges(&self) -> PoolGauges {
        PoolGauges {
            total: self.pool.size(),
            idle: u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX),
            waiting: self.recorder.waiting(),
        }
    }

    fn settings(&self) -> PoolSettings {
        self.settings
    }
}

/// Opens [`PostgresCatalog`]s for one [`DatabaseConfig`].
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: DatabaseConfig,
    recorder: EventRecorder,
}

impl PostgresConnector {
    /// Creates a connector; catalogs it opens share `recorder`.
    pub fn new(config: DatabaseConfig, recorder: EventRecorder) -> Self {
        Self { config, recorder }
    }

    /// Connection settings used by this connector
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self, max_connections: u32) -> Result<Arc<dyn Catalog>> {
        let catalog =
            PostgresCatalog::connect(&self.config, max_connections, self.recorder.clone()).await?;
        Ok(Arc::new(catalog))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_from_config() {
        let config = DatabaseConfig::new("db.internal")
            .with_port(6543)
            .with_database("crowd")
            .with_user("cube");
        let options = connect_options(&config);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("crowd"));
        assert_eq!(options.get_username(), "cube");
    }

    #[test]
    fn test_catalog_code_mapping() {
        assert_eq!(relation_kind("m"), RelationKind::MaterializedView);
        assert_eq!(relation_kind("v"), RelationKind::View);
        assert_eq!(relation_kind("p"), RelationKind::Table);
        assert_eq!(constraint_kind("f"), Some(ConstraintKind::ForeignKey));
        assert_eq!(constraint_kind("x"), None);
    }

    #[tokio::test]
    async fn test_lazy_pool_reports_settings_without_connecting() {
        let config = DatabaseConfig::default();
        let catalog = PostgresCatalog::connect_lazy(&config, 500, EventRecorder::new());
        assert_eq!(catalog.settings().max_connections, 100);
        assert_eq!(catalog.settings().connection_timeout_ms, 10_000);
        assert_eq!(catalog.gauges(), PoolGauges::default());
        assert!(!format!("{:?}", catalog).contains("devspace@"));
    }
}
