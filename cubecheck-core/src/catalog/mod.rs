//! Read-only access to the database catalog.
//!
//! Diagnostics only need a narrow slice of introspection: relation listing,
//! column/index/constraint metadata for one relation, and materialized view
//! state. [`Catalog`] is that slice, so every component can run against the
//! PostgreSQL implementation or the in-memory one used by tests.

pub mod memory;

#[cfg(feature = "postgresql")]
mod helpers;
#[cfg(feature = "postgresql")]
pub mod postgres;

pub use memory::{MemoryCatalog, MemoryConnector, MemoryRelation};
#[cfg(feature = "postgresql")]
pub use postgres::{PostgresCatalog, PostgresConnector};

use crate::Result;
use crate::models::{ColumnInfo, ConstraintInfo, IndexInfo, MaterializedViewRecord, RelationInfo};
use async_trait::async_trait;
use std::sync::Arc;

/// Catalog introspection over one database.
///
/// Relation names are unqualified; implementations resolve them in their
/// configured schema.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Acquires and releases one connection.
    async fn ping(&self) -> Result<()>;

    /// Full server version banner, as returned by `SELECT version()`.
    async fn server_version(&self) -> Result<String>;

    /// All non-system tables and materialized views, ordered by schema and name.
    async fn list_relations(&self) -> Result<Vec<RelationInfo>>;

    /// Whether a table, view or materialized view with this name exists.
    async fn relation_exists(&self, relation: &str) -> Result<bool>;

    /// Columns of a relation in ordinal order; empty if it does not exist.
    async fn columns(&self, relation: &str) -> Result<Vec<ColumnInfo>>;

    /// Indexes defined on a relation.
    async fn indexes(&self, relation: &str) -> Result<Vec<IndexInfo>>;

    /// Constraints defined on a relation.
    async fn constraints(&self, relation: &str) -> Result<Vec<ConstraintInfo>>;

    /// All non-system materialized views.
    async fn materialized_views(&self) -> Result<Vec<MaterializedViewRecord>>;

    /// One materialized view by name, in any non-system schema.
    async fn materialized_view(&self, name: &str) -> Result<Option<MaterializedViewRecord>>;

    /// `COUNT(*)` over a relation.
    async fn row_count(&self, relation: &str) -> Result<u64>;

    /// Number of columns of a relation.
    async fn column_count(&self, relation: &str) -> Result<usize> {
        Ok(self.columns(relation).await?.len())
    }

    /// Releases pooled connections. Later calls may fail.
    async fn close(&self) {}
}

/// Opens new catalog connections with a given pool size.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects eagerly, so unreachable servers fail here.
    async fn connect(&self, max_connections: u32) -> Result<Arc<dyn Catalog>>;
}
