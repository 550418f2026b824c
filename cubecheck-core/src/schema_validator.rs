//! Cross-checks cube definitions against the live catalog.
//!
//! For each cube the backing relation must exist, every column referenced by
//! a measure or dimension must exist in it, and every join must point at a
//! defined cube with an SQL condition and a known relationship.

use crate::catalog::Catalog;
use crate::cube::{CubeDefinition, CubeRepository, Relationship, is_valid_cube_name, sql};
use crate::models::{ColumnInfo, Severity};
use crate::{DiagnosticError, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Kinds of schema errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaErrorType {
    MissingTable,
    MissingColumn,
    InvalidJoin,
    SyntaxError,
    /// The catalog could not be queried, so the cube was not checked
    CatalogUnavailable,
}

impl SchemaErrorType {
    /// Severity reported for this kind of error in a diagnostic report
    pub fn severity(self) -> Severity {
        match self {
            Self::MissingTable => Severity::Critical,
            Self::MissingColumn | Self::SyntaxError | Self::CatalogUnavailable => Severity::High,
            Self::InvalidJoin => Severity::Medium,
        }
    }
}

impl std::fmt::Display for SchemaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTable => write!(f, "missing_table"),
            Self::MissingColumn => write!(f, "missing_column"),
            Self::InvalidJoin => write!(f, "invalid_join"),
            Self::SyntaxError => write!(f, "syntax_error"),
            Self::CatalogUnavailable => write!(f, "catalog_unavailable"),
        }
    }
}

/// One problem that makes a cube invalid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaError {
    #[serde(rename = "type")]
    pub error_type: SchemaErrorType,
    pub cube_name: String,
    /// Path of the offending field, e.g. `dimensions.isBot`
    pub field: String,
    pub message: String,
    pub suggestion: String,
}

/// Kinds of schema warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaWarningType {
    PerformanceConcern,
    NamingConvention,
}

/// Advisory finding; never affects validity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaWarning {
    #[serde(rename = "type")]
    pub warning_type: SchemaWarningType,
    pub cube_name: String,
    pub field: String,
    pub message: String,
}

/// Validation outcome for one cube
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeValidationResult {
    pub cube_name: String,
    pub is_valid: bool,
    pub errors: Vec<SchemaError>,
    pub warnings: Vec<SchemaWarning>,
    /// Resolved backing relation; empty if the definition could not be read
    pub table_name: String,
    /// Referenced columns absent from the relation, deduplicated
    pub missing_columns: Vec<String>,
    pub invalid_joins: Vec<String>,
}

impl CubeValidationResult {
    fn failed(cube: &str, table_name: String, error: SchemaError) -> Self {
        Self {
            cube_name: cube.to_string(),
            is_valid: false,
            errors: vec![error],
            warnings: Vec::new(),
            table_name,
            missing_columns: Vec::new(),
            invalid_joins: Vec::new(),
        }
    }
}

/// Catalog-level state of one materialized view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedViewStatus {
    pub view_name: String,
    pub exists: bool,
    /// Whether the view is populated and can be queried
    pub accessible: bool,
    pub column_count: usize,
    pub last_checked: DateTime<Utc>,
}

/// Validates cube definitions against the database.
#[derive(Clone)]
pub struct SchemaValidator {
    catalog: Arc<dyn Catalog>,
    repository: CubeRepository,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}

impl SchemaValidator {
    pub fn new(catalog: Arc<dyn Catalog>, repository: CubeRepository) -> Self {
        Self {
            catalog,
            repository,
        }
    }

    /// Definition directory this validator reads
    pub fn repository(&self) -> &CubeRepository {
        &self.repository
    }

    /// Validates one cube.
    ///
    /// A missing backing relation short-circuits with a single
    /// `missing_table` error. A definition that cannot be read yields a single
    /// `syntax_error`; a database failure yields a single
    /// `catalog_unavailable`. Nothing is returned as `Err`.
    pub async fn validate_cube(&self, cube: &str) -> CubeValidationResult {
        match self.try_validate_cube(cube).await {
            Ok(result) => {
                debug!(
                    cube = %cube,
                    is_valid = result.is_valid,
                    errors = result.errors.len(),
                    "Validated cube"
                );
                result
            }
            Err(e) if e.is_operational() => {
                let message = e.detailed_message();
                warn!(cube = %cube, error = %message, "Cube could not be checked against the database");
                CubeValidationResult::failed(
                    cube,
                    String::new(),
                    SchemaError {
                        error_type: SchemaErrorType::CatalogUnavailable,
                        cube_name: cube.to_string(),
                        field: "sql_table".to_string(),
                        message: format!("Database catalog unavailable: {}", message),
                        suggestion:
                            "Check database connectivity and permissions, then validate again"
                                .to_string(),
                    },
                )
            }
            Err(e) => {
                let message = e.detailed_message();
                warn!(cube = %cube, error = %message, "Cube validation failed");
                CubeValidationResult::failed(
                    cube,
                    String::new(),
                    SchemaError {
                        error_type: SchemaErrorType::SyntaxError,
                        cube_name: cube.to_string(),
                        field: "cube_definition".to_string(),
                        message: format!("Failed to validate cube: {}", message),
                        suggestion:
                            "Check cube definition syntax and ensure the file is valid JSON"
                                .to_string(),
                    },
                )
            }
        }
    }

    async fn try_validate_cube(&self, cube: &str) -> Result<CubeValidationResult> {
        let definition = self.repository.load(cube)?;
        let table = definition.table_name().ok_or_else(|| {
            DiagnosticError::definition(
                cube,
                "no backing table could be resolved from sql_table or sql",
            )
        })?;

        if !self.catalog.relation_exists(&table).await? {
            return Ok(CubeValidationResult::failed(
                cube,
                table.clone(),
                SchemaError {
                    error_type: SchemaErrorType::MissingTable,
                    cube_name: cube.to_string(),
                    field: "sql_table".to_string(),
                    message: format!("Table or view '{}' does not exist", table),
                    suggestion: format!(
                        "Ensure the materialized view '{}' is created and accessible",
                        table
                    ),
                },
            ));
        }

        let columns = self.catalog.columns(&table).await?;
        let mut errors = Vec::new();
        let mut missing_columns = Vec::new();
        check_column_references(cube, &definition, &table, &columns, &mut errors, &mut missing_columns);

        let mut invalid_joins = Vec::new();
        for (join_name, join) in &definition.joins {
            if let Some((message, suggestion)) = self.check_join(join_name, join) {
                invalid_joins.push(join_name.clone());
                errors.push(SchemaError {
                    error_type: SchemaErrorType::InvalidJoin,
                    cube_name: cube.to_string(),
                    field: format!("joins.{}", join_name),
                    message,
                    suggestion,
                });
            }
        }

        let warnings = self.collect_warnings(cube, &definition, &table).await?;

        let mut seen = BTreeSet::new();
        missing_columns.retain(|c: &String| seen.insert(c.clone()));

        Ok(CubeValidationResult {
            cube_name: cube.to_string(),
            is_valid: errors.is_empty(),
            errors,
            warnings,
            table_name: table,
            missing_columns,
            invalid_joins,
        })
    }

    /// Returns `(message, suggestion)` if the join is invalid.
    fn check_join(
        &self,
        join_name: &str,
        join: &crate::cube::JoinDefinition,
    ) -> Option<(String, String)> {
        let target = join.target(join_name);
        if !self.repository.exists(target) {
            return Some((
                format!("Referenced cube '{}' in join does not exist", target),
                format!("Ensure cube '{}' is defined or remove the join", target),
            ));
        }

        if join.sql.as_deref().is_none_or(|s| s.trim().is_empty()) {
            return Some((
                format!("Join '{}' is missing SQL definition", join_name),
                format!("Add SQL definition for join '{}'", join_name),
            ));
        }

        if let Some(relationship) = join.relationship.as_deref()
            && Relationship::parse(relationship).is_none()
        {
            return Some((
                format!(
                    "Invalid relationship type '{}' in join '{}'",
                    relationship, join_name
                ),
                format!("Use one of: {}", Relationship::NAMES.join(", ")),
            ));
        }

        None
    }

    async fn collect_warnings(
        &self,
        cube: &str,
        definition: &CubeDefinition,
        table: &str,
    ) -> Result<Vec<SchemaWarning>> {
        let mut warnings = Vec::new();

        if let Some(view) = self.catalog.materialized_view(table).await?
            && !view.populated
        {
            warnings.push(SchemaWarning {
                warning_type: SchemaWarningType::PerformanceConcern,
                cube_name: cube.to_string(),
                field: "sql_table".to_string(),
                message: format!(
                    "Materialized view '{}' is not populated; queries fail until it is refreshed",
                    table
                ),
            });
        }

        let members = definition
            .dimensions
            .keys()
            .map(|name| ("dimensions", name))
            .chain(definition.measures.keys().map(|name| ("measures", name)));
        for (section, name) in members {
            if !is_valid_cube_name(name) {
                warnings.push(SchemaWarning {
                    warning_type: SchemaWarningType::NamingConvention,
                    cube_name: cube.to_string(),
                    field: format!("{}.{}", section, name),
                    message: format!(
                        "Member name '{}' is not a plain identifier and may not be addressable in queries",
                        name
                    ),
                });
            }
        }

        Ok(warnings)
    }

    /// Validates every cube in the definition directory.
    ///
    /// Each cube is validated independently. If the directory cannot be
    /// listed the result is empty.
    pub async fn validate_all_cubes(&self) -> Vec<CubeValidationResult> {
        let cubes = match self.repository.list_cubes() {
            Ok(cubes) => cubes,
            Err(e) => {
                error!(error = %e.detailed_message(), "Failed to list cube definitions");
                return Vec::new();
            }
        };

        let results = join_all(cubes.iter().map(|cube| self.validate_cube(cube))).await;

        info!(
            total_cubes = results.len(),
            valid_cubes = results.iter().filter(|r| r.is_valid).count(),
            "Schema validation completed"
        );
        results
    }

    /// Lists every materialized view in the database with its column count.
    ///
    /// # Errors
    /// Returns the catalog error if views cannot be listed or a view's
    /// columns cannot be read.
    pub async fn check_materialized_views(&self) -> Result<Vec<MaterializedViewStatus>> {
        let mut views = self.catalog.materialized_views().await?;
        views.sort_by(|a, b| a.name.cmp(&b.name));

        let mut statuses = Vec::with_capacity(views.len());
        for view in views {
            let column_count = self.catalog.column_count(&view.name).await?;
            statuses.push(MaterializedViewStatus {
                view_name: view.name,
                exists: true,
                accessible: view.populated,
                column_count,
                last_checked: Utc::now(),
            });
        }
        Ok(statuses)
    }
}

fn check_column_references(
    cube: &str,
    definition: &CubeDefinition,
    table: &str,
    columns: &[ColumnInfo],
    errors: &mut Vec<SchemaError>,
    missing_columns: &mut Vec<String>,
) {
    for (field, member, expression) in definition.member_expressions() {
        let (kind, section) = if field.starts_with("dimensions.") {
            ("dimension", "dimension definition")
        } else {
            ("measure", "measure definition")
        };

        for column in sql::column_references(expression, cube) {
            if columns.iter().any(|c| c.name == column) {
                continue;
            }
            errors.push(SchemaError {
                error_type: SchemaErrorType::MissingColumn,
                cube_name: cube.to_string(),
                field: field.clone(),
                message: format!(
                    "Column '{}' referenced in {} '{}' does not exist in table '{}'",
                    column, kind, member, table
                ),
                suggestion: format!(
                    "Check if column '{}' exists in the materialized view or update the {}",
                    column, section
                ),
            });
            missing_columns.push(column);
        }
    }
}
