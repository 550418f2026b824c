//! Shared table of the entities a healthy deployment is expected to have.
//!
//! The connection tester reads the materialized-view list, the query
//! validator reads the known cubes/measures and the dashboard catalog, and the
//! engine reads the smoke-test security context. Keeping them in one table
//! means the lists cannot diverge between components.

use crate::query::{CubeQuery, Filter, SecurityContext, TimeDimension};
use crate::{DiagnosticError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A named representative query used for smoke tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardQuery {
    pub name: String,
    pub query: CubeQuery,
}

impl DashboardQuery {
    fn new(name: &str, query: CubeQuery) -> Self {
        Self {
            name: name.to_string(),
            query,
        }
    }
}

/// Registry of known cubes, views, operators and smoke-test queries.
///
/// Fields missing from a registry file take their built-in values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Registry {
    pub known_cubes: Vec<String>,
    pub known_measures: Vec<String>,
    pub materialized_views: Vec<String>,
    pub filter_operators: Vec<String>,
    pub granularities: Vec<String>,
    pub dashboard_queries: Vec<DashboardQuery>,
    pub smoke_test_context: SecurityContext,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn count_with_filter(cube: &str, member: &str, value: &str) -> CubeQuery {
    CubeQuery {
        measures: vec![format!("{}.count", cube)],
        filters: Some(vec![Filter {
            member: format!("{}.{}", cube, member),
            operator: "equals".to_string(),
            values: vec![value.to_string()],
        }]),
        ..Default::default()
    }
}

impl Default for Registry {
    fn default() -> Self {
        let dashboard_queries = vec![
            DashboardQuery::new(
                "Organizations.count",
                CubeQuery::with_measures(["Organizations.count"]),
            ),
            DashboardQuery::new("Members.count", CubeQuery::with_measures(["Members.count"])),
            DashboardQuery::new(
                "Members.count with isOrganization filter",
                count_with_filter("Members", "isOrganization", "false"),
            ),
            DashboardQuery::new(
                "Members.count with isTeamMember filter",
                count_with_filter("Members", "isTeamMember", "true"),
            ),
            DashboardQuery::new(
                "Members.count with isBot filter",
                count_with_filter("Members", "isBot", "false"),
            ),
            DashboardQuery::new(
                "Activities.count",
                CubeQuery::with_measures(["Activities.count"]),
            ),
            DashboardQuery::new(
                "Activities.count with time dimension",
                CubeQuery {
                    time_dimensions: Some(vec![TimeDimension {
                        dimension: "Activities.date".to_string(),
                        granularity: Some("day".to_string()),
                        date_range: None,
                    }]),
                    ..CubeQuery::with_measures(["Activities.count"])
                },
            ),
            DashboardQuery::new(
                "Activities.count with sentiment and platform dimensions",
                CubeQuery {
                    dimensions: Some(strings(&["Activities.sentimentMood", "Activities.platform"])),
                    ..CubeQuery::with_measures(["Activities.count"])
                },
            ),
        ];

        Self {
            known_cubes: strings(&["Organizations", "Members", "Activities", "Conversations"]),
            known_measures: strings(&["count", "cumulativeCount"]),
            materialized_views: strings(&[
                "mv_organizations",
                "mv_members",
                "mv_activities",
                "mv_segments",
            ]),
            filter_operators: strings(&[
                "equals",
                "notEquals",
                "contains",
                "notContains",
                "gt",
                "gte",
                "lt",
                "lte",
                "inDateRange",
            ]),
            granularities: strings(&[
                "second", "minute", "hour", "day", "week", "month", "quarter", "year",
            ]),
            dashboard_queries,
            smoke_test_context: SecurityContext {
                tenant_id: Some("test-tenant-id".to_string()),
                segments: Some(vec!["test-segment".to_string()]),
                ..Default::default()
            },
        }
    }
}

impl Registry {
    /// Loads a registry from a JSON file.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be read, or a serialization
    /// error if it is not a valid registry document.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiagnosticError::io(format!("Failed to read registry file {}", path.display()), e)
        })?;
        serde_json::from_str(&content).map_err(|e| {
            DiagnosticError::serialization(
                format!("Failed to parse registry file {}", path.display()),
                e,
            )
        })
    }

    /// Whether `cube` is one of the known cubes
    pub fn is_known_cube(&self, cube: &str) -> bool {
        self.known_cubes.iter().any(|c| c == cube)
    }

    /// Whether `measure` is one of the known measure names
    pub fn is_known_measure(&self, measure: &str) -> bool {
        self.known_measures.iter().any(|m| m == measure)
    }
}
