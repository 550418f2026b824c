//! Fix suggestions and correction guidance for schema errors.
//!
//! Fixes are proposals only. Nothing here writes to definition files or the
//! database.

use crate::catalog::Catalog;
use crate::cube::{CubeRepository, Relationship};
use crate::models::Severity;
use crate::schema_validator::{CubeValidationResult, SchemaError, SchemaErrorType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Minimum similarity for a column to be proposed as a replacement
pub const COLUMN_SIMILARITY_THRESHOLD: f64 = 0.6;
/// Minimum similarity for a relation to be proposed as a replacement
pub const TABLE_SIMILARITY_THRESHOLD: f64 = 0.7;
/// Maximum number of candidates returned per missing column
pub const MAX_SUGGESTIONS: usize = 3;

/// What a fix changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    ColumnRename,
    JoinFix,
    SyntaxFix,
    TableReferenceFix,
}

/// How likely a proposed fix is to be right
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    fn for_column(similarity: f64) -> Self {
        if similarity > 0.9 {
            Confidence::High
        } else if similarity > 0.7 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    fn for_table(similarity: f64) -> Self {
        if similarity > 0.95 {
            Confidence::High
        } else if similarity > 0.8 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

/// A proposed change to one cube definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaFix {
    #[serde(rename = "type")]
    pub fix_type: FixType,
    pub cube_name: String,
    pub field: String,
    pub original_value: String,
    pub suggested_value: String,
    pub description: String,
    pub confidence: Confidence,
    /// Safe to apply mechanically. Only high-confidence renames qualify.
    pub auto_applicable: bool,
}

/// Step-by-step guidance for resolving a schema error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionGuidance {
    pub issue: String,
    pub severity: Severity,
    pub steps: Vec<String>,
    pub examples: Vec<String>,
    pub references: Vec<String>,
}

/// Normalized Levenshtein similarity in `[0, 1]`, case-insensitive.
///
/// Two empty strings are identical.
///
/// # Example
/// ```rust
/// use cubecheck_core::corrector::similarity;
///
/// assert_eq!(similarity("isBot", "isbot"), 1.0);
/// assert!(similarity("tenantId", "tenant_id") > 0.6);
/// assert!(similarity("id", "createdAt") < 0.3);
/// ```
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    let distance = previous[b.len()];
    (longest - distance) as f64 / longest as f64
}

/// Candidates above `threshold`, best first, at most [`MAX_SUGGESTIONS`]
fn closest<'a>(target: &str, candidates: impl Iterator<Item = &'a str>, threshold: f64) -> Vec<(String, f64)> {
    let mut scored: Vec<(String, f64)> = candidates
        .map(|c| (c.to_string(), similarity(target, c)))
        .filter(|(_, score)| *score > threshold)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(MAX_SUGGESTIONS);
    scored
}

fn missing_column_name(error: &SchemaError) -> Option<String> {
    static COLUMN: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = COLUMN
        .get_or_init(|| regex::Regex::new(r"Column '(\w+)'").expect("Invalid column message pattern"));

    pattern
        .captures(&error.message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| error.field.rsplit_once('.').map(|(_, name)| name.to_string()))
}

fn join_name(field: &str) -> Option<&str> {
    field
        .strip_prefix("joins.")
        .map(|rest| rest.split('.').next().unwrap_or(rest))
        .filter(|name| !name.is_empty())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Proposes fixes for schema validation errors.
#[derive(Clone)]
pub struct SchemaCorrector {
    catalog: Arc<dyn Catalog>,
    repository: CubeRepository,
}

impl std::fmt::Debug for SchemaCorrector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCorrector")
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}

impl SchemaCorrector {
    pub fn new(catalog: Arc<dyn Catalog>, repository: CubeRepository) -> Self {
        Self {
            catalog,
            repository,
        }
    }

    /// One fix per error where a plausible fix exists.
    ///
    /// Catalog failures while looking for candidates drop the fix for that
    /// error rather than failing the whole call.
    pub async fn generate_schema_fixes(&self, result: &CubeValidationResult) -> Vec<SchemaFix> {
        let mut fixes = Vec::new();
        for error in &result.errors {
            let fix = match error.error_type {
                SchemaErrorType::MissingColumn => self.missing_column_fix(error, result).await,
                SchemaErrorType::MissingTable => self.missing_table_fix(error, result).await,
                SchemaErrorType::InvalidJoin => self.invalid_join_fix(error),
                SchemaErrorType::SyntaxError => Some(SchemaFix {
                    fix_type: FixType::SyntaxFix,
                    cube_name: error.cube_name.clone(),
                    field: error.field.clone(),
                    original_value: String::new(),
                    suggested_value: String::new(),
                    description: format!("Manual syntax correction required: {}", error.message),
                    confidence: Confidence::Low,
                    auto_applicable: false,
                }),
                SchemaErrorType::CatalogUnavailable => None,
            };
            fixes.extend(fix);
        }
        debug!(cube = %result.cube_name, fixes = fixes.len(), "Generated schema fixes");
        fixes
    }

    async fn missing_column_fix(
        &self,
        error: &SchemaError,
        result: &CubeValidationResult,
    ) -> Option<SchemaFix> {
        let missing = missing_column_name(error)?;
        let columns = match self.catalog.columns(&result.table_name).await {
            Ok(columns) => columns,
            Err(e) => {
                warn!(table = %result.table_name, error = %e, "Could not list columns for fix");
                return None;
            }
        };

        let (best, score) = closest(
            &missing,
            columns.iter().map(|c| c.name.as_str()),
            COLUMN_SIMILARITY_THRESHOLD,
        )
        .into_iter()
        .next()?;
        let confidence = Confidence::for_column(score);

        Some(SchemaFix {
            fix_type: FixType::ColumnRename,
            cube_name: error.cube_name.clone(),
            field: error.field.clone(),
            description: format!(
                "Replace missing column '{}' with similar column '{}'",
                missing, best
            ),
            original_value: missing,
            suggested_value: best,
            confidence,
            auto_applicable: confidence == Confidence::High,
        })
    }

    async fn missing_table_fix(
        &self,
        error: &SchemaError,
        result: &CubeValidationResult,
    ) -> Option<SchemaFix> {
        let relations = match self.catalog.list_relations().await {
            Ok(relations) => relations,
            Err(e) => {
                warn!(error = %e, "Could not list relations for fix");
                return None;
            }
        };

        let missing = &result.table_name;
        let (best, score) = closest(
            missing,
            relations.iter().map(|r| r.name.as_str()),
            TABLE_SIMILARITY_THRESHOLD,
        )
        .into_iter()
        .next()?;

        Some(SchemaFix {
            fix_type: FixType::TableReferenceFix,
            cube_name: error.cube_name.clone(),
            field: "sql_table".to_string(),
            original_value: missing.clone(),
            description: format!(
                "Replace missing table '{}' with similar table '{}'",
                missing, best
            ),
            suggested_value: best,
            confidence: Confidence::for_table(score),
            auto_applicable: false,
        })
    }

    fn invalid_join_fix(&self, error: &SchemaError) -> Option<SchemaFix> {
        let name = join_name(&error.field)?;
        let target = self
            .repository
            .load(&error.cube_name)
            .ok()
            .and_then(|d| d.joins.get(name).map(|j| j.target(name).to_string()))
            .unwrap_or_else(|| name.to_string());

        if self.repository.exists(&target) {
            return None;
        }

        Some(SchemaFix {
            fix_type: FixType::JoinFix,
            cube_name: error.cube_name.clone(),
            field: error.field.clone(),
            original_value: name.to_string(),
            suggested_value: String::new(),
            description: format!(
                "Remove invalid join '{}' as the referenced cube does not exist",
                name
            ),
            confidence: Confidence::High,
            auto_applicable: false,
        })
    }

    /// Scans a cube's joins for undefined targets and unknown relationships.
    ///
    /// Returns nothing if the definition cannot be loaded.
    pub fn detect_invalid_joins(&self, cube: &str) -> Vec<SchemaFix> {
        let Ok(definition) = self.repository.load(cube) else {
            return Vec::new();
        };

        let mut fixes = Vec::new();
        for (name, join) in &definition.joins {
            let target = join.target(name);
            if !self.repository.exists(target) {
                fixes.push(SchemaFix {
                    fix_type: FixType::JoinFix,
                    cube_name: cube.to_string(),
                    field: format!("joins.{}", name),
                    original_value: target.to_string(),
                    suggested_value: String::new(),
                    description: format!("Referenced cube '{}' does not exist", target),
                    confidence: Confidence::High,
                    auto_applicable: false,
                });
            }

            if let Some(relationship) = join.relationship.as_deref()
                && Relationship::parse(relationship).is_none()
            {
                fixes.push(SchemaFix {
                    fix_type: FixType::JoinFix,
                    cube_name: cube.to_string(),
                    field: format!("joins.{}.relationship", name),
                    original_value: relationship.to_string(),
                    suggested_value: Relationship::BelongsTo.to_string(),
                    description: format!(
                        "Invalid relationship type '{}', should be one of: {}",
                        relationship,
                        Relationship::NAMES.join(", ")
                    ),
                    confidence: Confidence::Medium,
                    auto_applicable: false,
                });
            }
        }
        fixes
    }

    /// Up to three existing columns resembling each missing column.
    ///
    /// Columns with no candidate are omitted. A catalog failure yields an
    /// empty map.
    pub async fn suggest_column_mappings(
        &self,
        table: &str,
        missing: &[String],
    ) -> BTreeMap<String, Vec<String>> {
        let columns = match self.catalog.columns(table).await {
            Ok(columns) => columns,
            Err(e) => {
                warn!(table = %table, error = %e, "Could not list columns for mapping");
                return BTreeMap::new();
            }
        };

        missing
            .iter()
            .filter_map(|column| {
                let candidates: Vec<String> = closest(
                    column,
                    columns.iter().map(|c| c.name.as_str()),
                    COLUMN_SIMILARITY_THRESHOLD,
                )
                .into_iter()
                .map(|(name, _)| name)
                .collect();
                (!candidates.is_empty()).then(|| (column.clone(), candidates))
            })
            .collect()
    }

    /// Static guidance for an error kind
    pub fn generate_correction_guidance(&self, error: &SchemaError) -> CorrectionGuidance {
        match error.error_type {
            SchemaErrorType::MissingTable => CorrectionGuidance {
                issue: format!("Missing table or materialized view: {}", error.message),
                severity: Severity::Critical,
                steps: strings(&[
                    "Check if the materialized view exists in the database",
                    "Verify the table name spelling in the cube definition",
                    "Ensure the materialized view is properly created and populated",
                    "Check database connection and permissions",
                ]),
                examples: strings(&[
                    r#""sql_table": "mv_organizations""#,
                    r#""sql_table": "mv_members""#,
                    r#""sql_table": "mv_activities""#,
                ]),
                references: strings(&[
                    "CubeJS sql_table documentation",
                    "PostgreSQL materialized views guide",
                ]),
            },
            SchemaErrorType::MissingColumn => CorrectionGuidance {
                issue: format!("Missing column in table: {}", error.message),
                severity: Severity::High,
                steps: strings(&[
                    "Check if the column exists in the materialized view",
                    "Verify column name spelling and case sensitivity",
                    "Check if the column was renamed in a recent schema change",
                    "Consider using a different available column",
                    "Update the materialized view if the column should exist",
                ]),
                examples: strings(&[
                    r#""sql": "${CUBE}.\"tenantId\"""#,
                    r#""sql": "${CUBE}.\"createdAt\"""#,
                    r#""sql": "${CUBE}.id""#,
                ]),
                references: strings(&[
                    "CubeJS dimensions documentation",
                    "CubeJS measures documentation",
                ]),
            },
            SchemaErrorType::InvalidJoin => CorrectionGuidance {
                issue: format!("Invalid join definition: {}", error.message),
                severity: Severity::Medium,
                steps: strings(&[
                    "Check if the referenced cube exists",
                    "Verify the join SQL syntax",
                    "Ensure the relationship type is correct (hasMany, belongsTo, hasOne)",
                    "Validate that the joined columns exist in both tables",
                    "Consider removing the join if it's not needed",
                ]),
                examples: strings(&[
                    r#""sql": "${CUBE}.id = ${Members}.\"organizationId\"""#,
                    r#""relationship": "hasMany""#,
                    r#""relationship": "belongsTo""#,
                ]),
                references: strings(&["CubeJS joins documentation", "CubeJS relationships guide"]),
            },
            SchemaErrorType::SyntaxError => CorrectionGuidance {
                issue: format!("Syntax error in cube definition: {}", error.message),
                severity: Severity::Critical,
                steps: strings(&[
                    "Check that the definition file is valid JSON",
                    "Ensure all braces and brackets are properly closed",
                    "Verify comma placement between object members",
                    "Check for typos in property names",
                    "Validate that string quotes are properly escaped",
                ]),
                examples: strings(&[
                    r#"{ "sql_table": "mv_members", "measures": { ... } }"#,
                    r#""measures": { "count": { "type": "count" } }"#,
                    r#""dimensions": { "id": { "sql": "${CUBE}.id", "type": "string" } }"#,
                ]),
                references: strings(&["CubeJS cube definition guide", "JSON syntax reference"]),
            },
            SchemaErrorType::CatalogUnavailable => CorrectionGuidance {
                issue: format!("Cube could not be checked: {}", error.message),
                severity: Severity::High,
                steps: strings(&[
                    "Verify the CUBEJS_DB_* connection parameters",
                    "Check that PostgreSQL is running and accepting connections",
                    "Confirm the database user can read pg_catalog and information_schema",
                    "Run the validation again once the database is reachable",
                ]),
                examples: Vec::new(),
                references: strings(&["PostgreSQL connection troubleshooting"]),
            },
        }
    }
}
