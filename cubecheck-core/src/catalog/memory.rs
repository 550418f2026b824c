//! In-memory catalog for tests, demos and offline dry runs.
//!
//! Relations can be altered at runtime, so drift between two snapshots can be
//! produced without a database. Failure switches simulate an unreachable
//! server and transient errors.

use super::{Catalog, Connector};
use crate::models::{
    ColumnInfo, ConstraintInfo, IndexInfo, MaterializedViewRecord, RelationInfo, RelationKind,
};
use crate::{DiagnosticError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// A relation held by a [`MemoryCatalog`]
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRelation {
    pub name: String,
    pub kind: RelationKind,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub constraints: Vec<ConstraintInfo>,
    pub row_count: u64,
    pub populated: bool,
}

impl MemoryRelation {
    fn new(name: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            columns: Vec::new(),
            indexes: Vec::new(),
            constraints: Vec::new(),
            row_count: 0,
            populated: true,
        }
    }

    /// A plain table
    pub fn table(name: impl Into<String>) -> Self {
        Self::new(name, RelationKind::Table)
    }

    /// A view
    pub fn view(name: impl Into<String>) -> Self {
        Self::new(name, RelationKind::View)
    }

    /// A populated materialized view
    pub fn materialized_view(name: impl Into<String>) -> Self {
        Self::new(name, RelationKind::MaterializedView)
    }

    /// Builder method to append a column.
    pub fn with_column(mut self, column: ColumnInfo) -> Self {
        self.columns.push(column);
        self
    }

    /// Builder method to append `text` columns by name.
    pub fn with_columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns
            .extend(names.into_iter().map(|n| ColumnInfo::new(n, "text")));
        self
    }

    /// Builder method to append an index.
    pub fn with_index(mut self, index: IndexInfo) -> Self {
        self.indexes.push(index);
        self
    }

    /// Builder method to append a constraint.
    pub fn with_constraint(mut self, constraint: ConstraintInfo) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Builder method to set the row count.
    pub fn with_rows(mut self, row_count: u64) -> Self {
        self.row_count = row_count;
        self
    }

    /// Builder method to mark a materialized view as never refreshed.
    pub fn unpopulated(mut self) -> Self {
        self.populated = false;
        self
    }
}

/// Catalog over a mutable set of [`MemoryRelation`]s in one schema.
#[derive(Debug)]
pub struct MemoryCatalog {
    schema: String,
    version: String,
    relations: RwLock<BTreeMap<String, MemoryRelation>>,
    unreachable: AtomicBool,
    transient_failures: AtomicU32,
    failing_relations: RwLock<BTreeSet<String>>,
    calls: AtomicU32,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            version: "PostgreSQL 16.2 (in-memory)".to_string(),
            relations: RwLock::new(BTreeMap::new()),
            unreachable: AtomicBool::new(false),
            transient_failures: AtomicU32::new(0),
            failing_relations: RwLock::new(BTreeSet::new()),
            calls: AtomicU32::new(0),
        }
    }
}

fn refused() -> DiagnosticError {
    DiagnosticError::connection_failed(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connect ECONNREFUSED 127.0.0.1:5432",
    ))
}

impl MemoryCatalog {
    /// Creates an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to add a relation.
    pub fn with_relation(self, relation: MemoryRelation) -> Self {
        self.insert_relation(relation);
        self
    }

    /// Builder method to set the reported server version banner.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds or replaces a relation
    pub fn insert_relation(&self, relation: MemoryRelation) {
        self.relations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(relation.name.clone(), relation);
    }

    /// Removes a relation, returning it if present
    pub fn drop_relation(&self, name: &str) -> Option<MemoryRelation> {
        self.relations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Applies `alter` to a relation in place. Returns false if it does not exist.
    pub fn alter_relation(&self, name: &str, alter: impl FnOnce(&mut MemoryRelation)) -> bool {
        let mut relations = self.relations.write().unwrap_or_else(PoisonError::into_inner);
        match relations.get_mut(name) {
            Some(relation) => {
                alter(relation);
                true
            }
            None => false,
        }
    }

    /// Makes every call fail with a connection-refused error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail with a connection-reset error
    pub fn fail_next(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Makes metadata queries against `relation` fail
    pub fn fail_relation(&self, relation: impl Into<String>) {
        self.failing_relations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(relation.into());
    }

    /// Number of catalog calls made so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(refused());
        }
        let consumed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(DiagnosticError::connection_failed(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "server closed the connection unexpectedly",
            )));
        }
        Ok(())
    }

    fn check_relation(&self, relation: &str) -> Result<()> {
        self.check_reachable()?;
        let failing = self
            .failing_relations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(relation);
        if failing {
            return Err(DiagnosticError::query_failed(
                format!("Failed to read metadata of {}", relation),
                std::io::Error::other(format!("permission denied for relation {}", relation)),
            ));
        }
        Ok(())
    }

    fn with_relation_ref<T>(&self, name: &str, read: impl FnOnce(&MemoryRelation) -> T) -> Option<T> {
        self.relations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(read)
    }

    fn matview_record(&self, relation: &MemoryRelation) -> MaterializedViewRecord {
        MaterializedViewRecord {
            schema: self.schema.clone(),
            name: relation.name.clone(),
            populated: relation.populated,
            has_indexes: !relation.indexes.is_empty(),
        }
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn server_version(&self) -> Result<String> {
        self.check_reachable()?;
        Ok(self.version.clone())
    }

    async fn list_relations(&self) -> Result<Vec<RelationInfo>> {
        self.check_reachable()?;
        Ok(self
            .relations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|r| RelationInfo {
                schema: self.schema.clone(),
                name: r.name.clone(),
                kind: r.kind,
            })
            .collect())
    }

    async fn relation_exists(&self, relation: &str) -> Result<bool> {
        self.check_relation(relation)?;
        Ok(self.with_relation_ref(relation, |_| ()).is_some())
    }

    async fn columns(&self, relation: &str) -> Result<Vec<ColumnInfo>> {
        self.check_relation(relation)?;
        Ok(self
            .with_relation_ref(relation, |r| r.columns.clone())
            .unwrap_or_default())
    }

    async fn indexes(&self, relation: &str) -> Result<Vec<IndexInfo>> {
        self.check_relation(relation)?;
        Ok(self
            .with_relation_ref(relation, |r| r.indexes.clone())
            .unwrap_or_default())
    }

    async fn constraints(&self, relation: &str) -> Result<Vec<ConstraintInfo>> {
        self.check_relation(relation)?;
        Ok(self
            .with_relation_ref(relation, |r| r.constraints.clone())
            .unwrap_or_default())
    }

    async fn materialized_views(&self) -> Result<Vec<MaterializedViewRecord>> {
        self.check_reachable()?;
        Ok(self
            .relations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.kind == RelationKind::MaterializedView)
            .map(|r| self.matview_record(r))
            .collect())
    }

    async fn materialized_view(&self, name: &str) -> Result<Option<MaterializedViewRecord>> {
        self.check_relation(name)?;
        Ok(self
            .with_relation_ref(name, |r| {
                (r.kind == RelationKind::MaterializedView).then(|| self.matview_record(r))
            })
            .flatten())
    }

    async fn row_count(&self, relation: &str) -> Result<u64> {
        self.check_relation(relation)?;
        self.with_relation_ref(relation, |r| r.row_count)
            .ok_or_else(|| {
                DiagnosticError::query_failed(
                    format!("Failed to count rows of {}", relation),
                    std::io::Error::other(format!("relation \"{}\" does not exist", relation)),
                )
            })
    }
}

/// Hands out a shared [`MemoryCatalog`], optionally failing the first
/// connection attempts.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    catalog: Arc<MemoryCatalog>,
    failures_remaining: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

impl MemoryConnector {
    /// Creates a connector over `catalog`
    pub fn new(catalog: Arc<MemoryCatalog>) -> Self {
        Self {
            catalog,
            failures_remaining: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Builder method to refuse the first `count` connection attempts.
    pub fn failing_first(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Connection attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The catalog handed out on success
    pub fn catalog(&self) -> &Arc<MemoryCatalog> {
        &self.catalog
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _max_connections: u32) -> Result<Arc<dyn Catalog>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(refused());
        }
        self.catalog.ping().await?;
        Ok(Arc::clone(&self.catalog) as Arc<dyn Catalog>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::new()
            .with_relation(MemoryRelation::table("members").with_columns(["id", "tenantId"]))
            .with_relation(
                MemoryRelation::materialized_view("mv_members")
                    .with_columns(["id"])
                    .with_rows(42),
            )
    }

    #[tokio::test]
    async fn test_listing_and_lookup() {
        let catalog = catalog();
        let relations = catalog.list_relations().await.unwrap();
        assert_eq!(relations.len(), 2);
        assert_eq!(relations[1].to_string(), "public.mv_members (materialized_view)");

        assert!(catalog.relation_exists("members").await.unwrap());
        assert!(!catalog.relation_exists("missing").await.unwrap());
        assert_eq!(catalog.column_count("members").await.unwrap(), 2);
        assert_eq!(catalog.row_count("mv_members").await.unwrap(), 42);
        assert!(catalog.materialized_view("members").await.unwrap().is_none());
        assert_eq!(catalog.materialized_views().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_alter_relation() {
        let catalog = catalog();
        assert!(catalog.alter_relation("members", |r| {
            r.columns.retain(|c| c.name != "tenantId");
        }));
        assert_eq!(catalog.columns("members").await.unwrap().len(), 1);
        assert!(!catalog.alter_relation("missing", |_| {}));
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let catalog = catalog();
        catalog.fail_next(1);
        assert!(catalog.ping().await.is_err());
        assert!(catalog.ping().await.is_ok());

        catalog.fail_relation("members");
        assert!(catalog.columns("members").await.is_err());
        assert!(catalog.columns("mv_members").await.is_ok());

        catalog.set_unreachable(true);
        let error = catalog.ping().await.unwrap_err();
        assert!(
            crate::error::error_chain_message(&error).contains("ECONNREFUSED"),
            "{}",
            error
        );
    }

    #[tokio::test]
    async fn test_connector_refuses_first_attempts() {
        let connector = MemoryConnector::new(Arc::new(catalog())).failing_first(2);
        assert!(connector.connect(1).await.is_err());
        assert!(connector.connect(1).await.is_err());
        assert!(connector.connect(1).await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }
}
