//! Schema drift detection.
//!
//! A [`SchemaSnapshot`] captures the columns, indexes and constraints backing
//! one cube at a point in time. Successive snapshots are diffed to find
//! structural changes, and every snapshot is also checked against the cube's
//! own column references so mismatches are caught on the first run.
//!
//! Snapshots live in memory only and are lost when the process exits.

use crate::catalog::Catalog;
use crate::cube::{CubeDefinition, CubeRepository, sql};
use crate::models::{ColumnInfo, ConstraintInfo, IndexInfo, Severity};
use crate::{DiagnosticError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, error, info};

/// Structural state of one cube's backing relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cube_name: String,
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub constraints: Vec<ConstraintInfo>,
    /// Hex SHA-256 over the structural content; timestamps are excluded
    pub checksum: String,
}

impl SchemaSnapshot {
    /// Builds a snapshot stamped now, computing its checksum
    pub fn new(
        cube_name: impl Into<String>,
        table_name: impl Into<String>,
        columns: Vec<ColumnInfo>,
        indexes: Vec<IndexInfo>,
        constraints: Vec<ConstraintInfo>,
    ) -> Self {
        let checksum = structure_checksum(&columns, &indexes, &constraints);
        Self {
            timestamp: Utc::now(),
            cube_name: cube_name.into(),
            table_name: table_name.into(),
            columns,
            indexes,
            constraints,
            checksum,
        }
    }

    fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

fn structure_checksum(
    columns: &[ColumnInfo],
    indexes: &[IndexInfo],
    constraints: &[ConstraintInfo],
) -> String {
    let mut hasher = Sha256::new();
    let mut field = |value: &str| {
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    };

    field("columns");
    for column in columns {
        field(&column.name);
        field(&column.data_type);
        field(if column.nullable { "null" } else { "not null" });
        field(if column.is_primary_key { "pk" } else { "" });
    }
    field("indexes");
    for index in indexes {
        field(&index.name);
        field(&index.columns.join(","));
        field(if index.unique { "unique" } else { "" });
        field(&index.index_type);
    }
    field("constraints");
    for constraint in constraints {
        field(&constraint.name);
        field(&constraint.kind.to_string());
        field(&constraint.columns.join(","));
        field(constraint.referenced_table.as_deref().unwrap_or(""));
        field(&constraint.referenced_columns.join(","));
    }

    hex::encode(hasher.finalize())
}

/// Kinds of structural drift
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    TableMissing,
    ColumnMissing,
    ColumnTypeChanged,
    ColumnAdded,
    TableStructureChanged,
}

impl DriftType {
    /// Every drift type, in report order
    pub const ALL: [DriftType; 5] = [
        DriftType::TableMissing,
        DriftType::ColumnMissing,
        DriftType::ColumnTypeChanged,
        DriftType::ColumnAdded,
        DriftType::TableStructureChanged,
    ];
}

impl std::fmt::Display for DriftType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriftType::TableMissing => write!(f, "table_missing"),
            DriftType::ColumnMissing => write!(f, "column_missing"),
            DriftType::ColumnTypeChanged => write!(f, "column_type_changed"),
            DriftType::ColumnAdded => write!(f, "column_added"),
            DriftType::TableStructureChanged => write!(f, "table_structure_changed"),
        }
    }
}

/// One detected discrepancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDrift {
    pub cube_name: String,
    pub drift_type: DriftType,
    pub severity: Severity,
    pub description: String,
    pub expected_value: String,
    pub actual_value: String,
    pub recommendation: String,
    pub detected_at: DateTime<Utc>,
}

impl SchemaDrift {
    fn new(
        cube_name: &str,
        drift_type: DriftType,
        severity: Severity,
        description: String,
        expected_value: impl Into<String>,
        actual_value: impl Into<String>,
        recommendation: String,
    ) -> Self {
        Self {
            cube_name: cube_name.to_string(),
            drift_type,
            severity,
            description,
            expected_value: expected_value.into(),
            actual_value: actual_value.into(),
            recommendation,
            detected_at: Utc::now(),
        }
    }
}

/// Overall drift verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    NoDrift,
    MinorDrift,
    MajorDrift,
    CriticalDrift,
}

impl DriftStatus {
    /// Critical if any drift is critical, major if any is high, minor if any exist
    pub fn from_drifts(drifts: &[SchemaDrift]) -> Self {
        match drifts.iter().map(|d| d.severity).max() {
            None => DriftStatus::NoDrift,
            Some(Severity::Critical) => DriftStatus::CriticalDrift,
            Some(Severity::High) => DriftStatus::MajorDrift,
            Some(_) => DriftStatus::MinorDrift,
        }
    }
}

/// Aggregated result of one drift detection run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDriftReport {
    pub timestamp: DateTime<Utc>,
    pub total_drifts: usize,
    /// Counts for every severity, zero included
    pub drifts_by_severity: BTreeMap<Severity, usize>,
    /// Counts for every drift type, zero included
    pub drifts_by_type: BTreeMap<DriftType, usize>,
    pub drifts: Vec<SchemaDrift>,
    pub recommendations: Vec<String>,
    pub overall_status: DriftStatus,
}

impl SchemaDriftReport {
    /// Builds a report from a drift list
    pub fn from_drifts(drifts: Vec<SchemaDrift>) -> Self {
        let mut by_severity: BTreeMap<Severity, usize> =
            [Severity::Low, Severity::Medium, Severity::High, Severity::Critical]
                .into_iter()
                .map(|s| (s, 0))
                .collect();
        let mut by_type: BTreeMap<DriftType, usize> =
            DriftType::ALL.into_iter().map(|t| (t, 0)).collect();
        for drift in &drifts {
            *by_severity.entry(drift.severity).or_default() += 1;
            *by_type.entry(drift.drift_type).or_default() += 1;
        }

        Self {
            timestamp: Utc::now(),
            total_drifts: drifts.len(),
            drifts_by_severity: by_severity,
            drifts_by_type: by_type,
            recommendations: generate_drift_recommendations(&drifts),
            overall_status: DriftStatus::from_drifts(&drifts),
            drifts,
        }
    }
}

/// Diffs two snapshots of the same cube.
///
/// Columns dropped since `previous` are high severity, changed column types
/// medium, new columns low. Dropped indexes (low) and dropped constraints
/// (medium) are reported as structure changes.
pub fn compare_schema_snapshots(
    previous: &SchemaSnapshot,
    current: &SchemaSnapshot,
) -> Vec<SchemaDrift> {
    let cube = current.cube_name.as_str();
    let mut drifts = Vec::new();

    for before in &previous.columns {
        match current.column(&before.name) {
            None => drifts.push(SchemaDrift::new(
                cube,
                DriftType::ColumnMissing,
                Severity::High,
                format!("Column '{}' was removed from table", before.name),
                before.name.clone(),
                "column not found",
                format!(
                    "Restore column '{}' or update cube definition",
                    before.name
                ),
            )),
            Some(after) if after.data_type != before.data_type => {
                drifts.push(SchemaDrift::new(
                    cube,
                    DriftType::ColumnTypeChanged,
                    Severity::Medium,
                    format!(
                        "Column '{}' type changed from {} to {}",
                        before.name, before.data_type, after.data_type
                    ),
                    before.data_type.clone(),
                    after.data_type.clone(),
                    "Update cube measures/dimensions to handle new column type".to_string(),
                ));
            }
            Some(_) => {}
        }
    }

    for after in &current.columns {
        if previous.column(&after.name).is_none() {
            drifts.push(SchemaDrift::new(
                cube,
                DriftType::ColumnAdded,
                Severity::Low,
                format!("New column '{}' added to table", after.name),
                "column not present",
                after.name.clone(),
                "Consider adding column to cube definition if useful for analytics".to_string(),
            ));
        }
    }

    for index in &previous.indexes {
        if !current.indexes.iter().any(|i| i.name == index.name) {
            drifts.push(SchemaDrift::new(
                cube,
                DriftType::TableStructureChanged,
                Severity::Low,
                format!("Index '{}' was removed", index.name),
                index.name.clone(),
                "index not found",
                "Consider recreating index for query performance".to_string(),
            ));
        }
    }

    for constraint in &previous.constraints {
        if !current.constraints.iter().any(|c| c.name == constraint.name) {
            drifts.push(SchemaDrift::new(
                cube,
                DriftType::TableStructureChanged,
                Severity::Medium,
                format!("Constraint '{}' was removed", constraint.name),
                constraint.name.clone(),
                "constraint not found",
                "Review data integrity implications and update cube joins if needed".to_string(),
            ));
        }
    }

    drifts
}

/// One fixed recommendation per drift type present, plus an urgent one if
/// any drift is critical.
pub fn generate_drift_recommendations(drifts: &[SchemaDrift]) -> Vec<String> {
    let present = |kind: DriftType| drifts.iter().any(|d| d.drift_type == kind);
    let mut recommendations = Vec::new();

    if present(DriftType::TableMissing) {
        recommendations
            .push("Create missing tables or update cube SQL to reference existing tables".to_string());
    }
    if present(DriftType::ColumnMissing) {
        recommendations.push(
            "Add missing columns to database tables or update cube definitions to remove references"
                .to_string(),
        );
    }
    if present(DriftType::ColumnTypeChanged) {
        recommendations.push(
            "Update cube measure and dimension types to match database column types".to_string(),
        );
    }
    if present(DriftType::ColumnAdded) {
        recommendations.push(
            "Consider adding new columns to cube definitions if they provide business value"
                .to_string(),
        );
    }
    if present(DriftType::TableStructureChanged) {
        recommendations.push(
            "Review and update cube joins and relationships to match current table structure"
                .to_string(),
        );
    }
    if drifts.iter().any(|d| d.severity == Severity::Critical) {
        recommendations
            .push("Address critical schema drifts immediately to prevent query failures".to_string());
    }

    recommendations
}

/// Checks the cube's own column references against a snapshot.
fn validate_against_snapshot(
    cube: &str,
    definition: &CubeDefinition,
    snapshot: &SchemaSnapshot,
) -> Vec<SchemaDrift> {
    let mut drifts = Vec::new();
    for (field, member, expression) in definition.member_expressions() {
        let (kind, sql_kind) = if field.starts_with("dimensions.") {
            ("dimension", "dimension SQL")
        } else {
            ("measure", "measure SQL")
        };
        for column in sql::column_references(expression, cube) {
            if snapshot.column(&column).is_some() {
                continue;
            }
            drifts.push(SchemaDrift::new(
                cube,
                DriftType::ColumnMissing,
                Severity::High,
                format!(
                    "Column '{}' referenced in {} '{}' does not exist",
                    column, kind, member
                ),
                column.clone(),
                "column not found",
                format!("Add column '{}' to table or update {}", column, sql_kind),
            ));
        }
    }
    drifts
}

/// Tracks snapshots per cube and reports drift between runs.
pub struct SchemaDriftDetector {
    catalog: Arc<dyn Catalog>,
    repository: CubeRepository,
    snapshots: RwLock<HashMap<String, SchemaSnapshot>>,
}

impl std::fmt::Debug for SchemaDriftDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaDriftDetector")
            .field("repository", &self.repository)
            .field("snapshots", &self.snapshot_count())
            .finish_non_exhaustive()
    }
}

impl SchemaDriftDetector {
    pub fn new(catalog: Arc<dyn Catalog>, repository: CubeRepository) -> Self {
        Self {
            catalog,
            repository,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn resolve_table(definition: &CubeDefinition, cube: &str) -> Result<String> {
        definition.table_name().ok_or_else(|| {
            DiagnosticError::definition(cube, "could not extract table name from cube SQL")
        })
    }

    /// Introspects the cube's backing relation and stores the snapshot,
    /// replacing any earlier one for the same cube.
    ///
    /// # Errors
    /// Fails if the definition cannot be loaded, names no resolvable
    /// relation, or any introspection query fails.
    pub async fn create_schema_snapshot(&self, cube: &str) -> Result<SchemaSnapshot> {
        let definition = self.repository.load(cube)?;
        let table = Self::resolve_table(&definition, cube)?;
        self.snapshot_table(cube, &table).await
    }

    async fn snapshot_table(&self, cube: &str, table: &str) -> Result<SchemaSnapshot> {
        let (columns, indexes, constraints) = tokio::try_join!(
            self.catalog.columns(table),
            self.catalog.indexes(table),
            self.catalog.constraints(table),
        )
        .inspect_err(|e| {
            error!(
                cube = %cube,
                table = %table,
                error = %e.detailed_message(),
                "Failed to create schema snapshot"
            );
        })?;

        let snapshot = SchemaSnapshot::new(cube, table, columns, indexes, constraints);
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cube.to_string(), snapshot.clone());
        debug!(cube = %cube, checksum = %snapshot.checksum, "Stored schema snapshot");
        Ok(snapshot)
    }

    /// The most recent snapshot stored for a cube
    pub fn snapshot(&self, cube: &str) -> Option<SchemaSnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cube)
            .cloned()
    }

    /// Number of cubes with a stored snapshot
    pub fn snapshot_count(&self) -> usize {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Forgets every stored snapshot
    pub fn clear_snapshots(&self) {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Runs drift detection over every defined cube.
    ///
    /// A cube whose table is missing yields one critical drift and nothing
    /// else. Otherwise a fresh snapshot is diffed against the stored one and
    /// the cube's column references are checked against it. Failures for a
    /// single cube are logged and skipped.
    ///
    /// # Errors
    /// Fails only if the definition directory cannot be listed.
    pub async fn detect_schema_drift(&self) -> Result<SchemaDriftReport> {
        let started = Instant::now();
        info!("Starting schema drift detection");

        let cubes = self.repository.list_cubes().inspect_err(|e| {
            error!(error = %e.detailed_message(), "Schema drift detection failed");
        })?;

        let mut drifts = Vec::new();
        for cube in &cubes {
            match self.detect_cube_drift(cube).await {
                Ok(found) => drifts.extend(found),
                Err(e) => error!(
                    cube = %cube,
                    error = %e.detailed_message(),
                    "Failed to detect schema drift for cube"
                ),
            }
        }

        let report = SchemaDriftReport::from_drifts(drifts);
        info!(
            total_drifts = report.total_drifts,
            overall_status = ?report.overall_status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Schema drift detection completed"
        );
        Ok(report)
    }

    async fn detect_cube_drift(&self, cube: &str) -> Result<Vec<SchemaDrift>> {
        let definition = self.repository.load(cube)?;
        let table = Self::resolve_table(&definition, cube)?;

        if !self.catalog.relation_exists(&table).await? {
            return Ok(vec![SchemaDrift::new(
                cube,
                DriftType::TableMissing,
                Severity::Critical,
                format!("Table '{}' referenced in cube does not exist", table),
                table.clone(),
                "table not found",
                format!(
                    "Create table '{}' or update cube SQL to reference existing table",
                    table
                ),
            )]);
        }

        let previous = self.snapshot(cube);
        let current = self.snapshot_table(cube, &table).await?;

        let mut drifts = match &previous {
            Some(previous) if previous.checksum != current.checksum => {
                compare_schema_snapshots(previous, &current)
            }
            _ => Vec::new(),
        };
        drifts.extend(validate_against_snapshot(cube, &definition, &current));
        Ok(drifts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, MemoryRelation};
    use crate::models::ConstraintKind;
    use std::path::Path;

    fn write(dir: &Path, cube: &str, json: &str) {
        std::fs::write(dir.join(format!("{}.json", cube)), json).unwrap();
    }

    fn members_relation() -> MemoryRelation {
        MemoryRelation::materialized_view("mv_members")
            .with_column(ColumnInfo::new("id", "uuid").primary_key())
            .with_column(ColumnInfo::new("tenantId", "uuid"))
            .with_column(ColumnInfo::new("score", "integer"))
            .with_index(IndexInfo {
                name: "mv_members_tenant_idx".to_string(),
                columns: vec!["tenantId".to_string()],
                unique: false,
                index_type: "btree".to_string(),
            })
            .with_constraint(ConstraintInfo {
                name: "mv_members_pkey".to_string(),
                kind: ConstraintKind::PrimaryKey,
                columns: vec!["id".to_string()],
                referenced_table: None,
                referenced_columns: Vec::new(),
            })
    }

    fn setup() -> (tempfile::TempDir, Arc<MemoryCatalog>, SchemaDriftDetector) {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "Members",
            r#"{"sql_table": "mv_members", "dimensions": {"score": {"sql": "${CUBE}.score"}}}"#,
        );
        let catalog = Arc::new(MemoryCatalog::new().with_relation(members_relation()));
        let detector = SchemaDriftDetector::new(catalog.clone(), CubeRepository::new(dir.path()));
        (dir, catalog, detector)
    }

    #[tokio::test]
    async fn test_snapshot_checksum_is_stable() {
        let (_dir, _catalog, detector) = setup();
        let first = detector.create_schema_snapshot("Members").await.unwrap();
        let second = detector.create_schema_snapshot("Members").await.unwrap();
        assert_eq!(first.checksum, second.checksum);
        assert_eq!(first.checksum.len(), 64);
        assert_eq!(detector.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn test_first_run_has_no_drift() {
        let (_dir, _catalog, detector) = setup();
        let report = detector.detect_schema_drift().await.unwrap();
        assert_eq!(report.overall_status, DriftStatus::NoDrift);
        assert_eq!(report.total_drifts, 0);
        assert_eq!(report.drifts_by_type.len(), 5);
        assert!(report.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_detects_changes_between_runs() {
        let (_dir, catalog, detector) = setup();
        detector.detect_schema_drift().await.unwrap();

        catalog.alter_relation("mv_members", |r| {
            r.columns.retain(|c| c.name != "score");
            r.columns.push(ColumnInfo::new("isBot", "boolean"));
            r.columns[1].data_type = "text".to_string();
            r.indexes.clear();
        });

        let report = detector.detect_schema_drift().await.unwrap();
        let kinds: Vec<DriftType> = report.drifts.iter().map(|d| d.drift_type).collect();
        assert_eq!(
            kinds,
            vec![
                DriftType::ColumnTypeChanged,
                DriftType::ColumnMissing,
                DriftType::ColumnAdded,
                DriftType::TableStructureChanged,
                // the dimension still references the dropped column
                DriftType::ColumnMissing,
            ]
        );
        assert_eq!(report.overall_status, DriftStatus::MajorDrift);
        assert_eq!(report.drifts_by_type[&DriftType::ColumnMissing], 2);
        assert_eq!(report.drifts_by_severity[&Severity::High], 2);
        assert_eq!(
            report.drifts[4].description,
            "Column 'score' referenced in dimension 'score' does not exist"
        );
    }

    #[tokio::test]
    async fn test_missing_table_is_critical() {
        let (_dir, catalog, detector) = setup();
        catalog.drop_relation("mv_members");

        let report = detector.detect_schema_drift().await.unwrap();
        assert_eq!(report.total_drifts, 1);
        assert_eq!(report.drifts[0].drift_type, DriftType::TableMissing);
        assert_eq!(report.overall_status, DriftStatus::CriticalDrift);
        assert_eq!(
            report.recommendations.last().map(String::as_str),
            Some("Address critical schema drifts immediately to prevent query failures")
        );
        assert_eq!(detector.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_cube_failure_does_not_abort_run() {
        let (dir, catalog, detector) = setup();
        write(dir.path(), "Broken", "not json");
        catalog.fail_relation("mv_members");

        let report = detector.detect_schema_drift().await.unwrap();
        assert_eq!(report.total_drifts, 0);
    }

    #[test]
    fn test_recommendations_are_per_type() {
        let snapshot = |columns: &[&str]| {
            SchemaSnapshot::new(
                "Members",
                "mv_members",
                columns.iter().map(|c| ColumnInfo::new(*c, "text")).collect(),
                Vec::new(),
                Vec::new(),
            )
        };
        let drifts = compare_schema_snapshots(&snapshot(&["a", "b", "c"]), &snapshot(&["d"]));
        assert_eq!(drifts.len(), 4);
        assert_eq!(
            generate_drift_recommendations(&drifts),
            vec![
                "Add missing columns to database tables or update cube definitions to remove references",
                "Consider adding new columns to cube definitions if they provide business value",
            ]
        );
    }

    #[test]
    fn test_report_serialization() {
        let report = SchemaDriftReport::from_drifts(Vec::new());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["overall_status"], "no_drift");
        assert_eq!(json["drifts_by_type"]["table_structure_changed"], 0);
        assert_eq!(json["drifts_by_severity"]["critical"], 0);
    }
}
