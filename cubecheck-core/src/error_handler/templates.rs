//! User-facing message templates and step-by-step guidance.
//!
//! Template selection is keyword driven: the lowercase error text is matched
//! against a short vocabulary per category, in a fixed order.

use super::ErrorCategory;
use crate::models::Severity;
use crate::query::{CubeQuery, DateRange, SecurityContext};
use chrono::{DateTime, NaiveDate};
use serde::Serialize;

/// Canned message for one recognizable error situation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorTemplate {
    pub title: &'static str,
    pub message: &'static str,
    pub suggestions: &'static [&'static str],
    pub documentation: &'static str,
    pub severity: Severity,
}

pub const MISSING_TENANT_ID: ErrorTemplate = ErrorTemplate {
    title: "Missing Tenant ID",
    message: "Your request is missing a required tenant identifier. This is needed to ensure you can only access data you're authorized to see.",
    suggestions: &[
        "Ensure you're logged in to your organization",
        "Check that your session hasn't expired",
        "Contact your administrator if you continue to see this error",
    ],
    documentation: "https://docs.gitmesh.com/authentication#tenant-context",
    severity: Severity::High,
};

pub const INVALID_TENANT_ID: ErrorTemplate = ErrorTemplate {
    title: "Invalid Tenant ID",
    message: "The tenant identifier in your request is not valid or you don't have access to this organization.",
    suggestions: &[
        "Verify you're accessing the correct organization",
        "Check that you haven't been removed from this organization",
        "Try logging out and logging back in",
    ],
    documentation: "https://docs.gitmesh.com/authentication#tenant-access",
    severity: Severity::High,
};

pub const MISSING_SEGMENTS: ErrorTemplate = ErrorTemplate {
    title: "Missing User Segments",
    message: "Your user profile is missing required access segments. This determines what data you can view.",
    suggestions: &[
        "Contact your organization administrator to configure your access",
        "Ensure your user role is properly assigned",
        "Try refreshing your browser to reload your permissions",
    ],
    documentation: "https://docs.gitmesh.com/permissions#user-segments",
    severity: Severity::Medium,
};

pub const EXPIRED_TOKEN: ErrorTemplate = ErrorTemplate {
    title: "Authentication Token Expired",
    message: "Your authentication token has expired and needs to be refreshed.",
    suggestions: &[
        "Please log out and log back in",
        "Clear your browser cache and cookies",
        "Contact support if the problem persists",
    ],
    documentation: "https://docs.gitmesh.com/authentication#token-refresh",
    severity: Severity::Medium,
};

pub const INSUFFICIENT_PERMISSIONS: ErrorTemplate = ErrorTemplate {
    title: "Insufficient Permissions",
    message: "You don't have permission to access the requested data or perform this action.",
    suggestions: &[
        "Contact your organization administrator to request access",
        "Verify you're using the correct user account",
        "Check if your role includes analytics permissions",
    ],
    documentation: "https://docs.gitmesh.com/permissions#analytics-access",
    severity: Severity::Medium,
};

pub const MISSING_TABLE: ErrorTemplate = ErrorTemplate {
    title: "Data Source Not Found",
    message: "The requested data source doesn't exist in the database. This might be due to a recent schema change.",
    suggestions: &[
        "Check if the data source name is spelled correctly",
        "Verify that the materialized view exists and is accessible",
        "Contact your administrator if this data was recently available",
        "Try refreshing the page to reload the latest schema",
    ],
    documentation: "https://docs.gitmesh.com/troubleshooting#missing-data-sources",
    severity: Severity::High,
};

pub const MISSING_COLUMN: ErrorTemplate = ErrorTemplate {
    title: "Data Field Not Available",
    message: "A requested data field is not available in the current data source. The field may have been renamed or removed.",
    suggestions: &[
        "Check if similar fields are available in the data source",
        "Verify the field name spelling and capitalization",
        "Contact your administrator about recent schema changes",
        "Try using alternative fields that provide similar information",
    ],
    documentation: "https://docs.gitmesh.com/troubleshooting#missing-fields",
    severity: Severity::Medium,
};

pub const INVALID_JOIN: ErrorTemplate = ErrorTemplate {
    title: "Data Relationship Error",
    message: "There's an issue with how different data sources are connected. This prevents combining data from multiple sources.",
    suggestions: &[
        "Try querying each data source separately",
        "Contact your administrator about data relationship configuration",
        "Check if the related data sources are available",
        "Use simpler queries that don't require data joins",
    ],
    documentation: "https://docs.gitmesh.com/troubleshooting#data-relationships",
    severity: Severity::High,
};

pub const SCHEMA_DRIFT: ErrorTemplate = ErrorTemplate {
    title: "Data Structure Changed",
    message: "The underlying data structure has changed since this query was created. The query needs to be updated.",
    suggestions: &[
        "Refresh the page to load the latest data structure",
        "Recreate your query using the current available fields",
        "Contact your administrator about recent database changes",
        "Check the system status page for maintenance notifications",
    ],
    documentation: "https://docs.gitmesh.com/troubleshooting#schema-changes",
    severity: Severity::Medium,
};

pub const INVALID_SYNTAX: ErrorTemplate = ErrorTemplate {
    title: "Query Format Error",
    message: "The query format is not valid. This usually happens when required fields are missing or incorrectly formatted.",
    suggestions: &[
        "Ensure at least one measure (metric) is selected",
        "Check that all filter values are properly formatted",
        "Verify date ranges are in the correct format (YYYY-MM-DD)",
        "Try simplifying the query by removing some filters or dimensions",
    ],
    documentation: "https://docs.gitmesh.com/analytics#query-format",
    severity: Severity::Medium,
};

pub const MISSING_MEASURES: ErrorTemplate = ErrorTemplate {
    title: "No Metrics Selected",
    message: "Your query doesn't include any metrics to calculate. At least one metric (like count, sum, or average) is required.",
    suggestions: &[
        "Select at least one metric from the available options",
        "Common metrics include: Count, Total, Average, Maximum, Minimum",
        "Check the widget configuration to ensure metrics are properly selected",
        "Try using a pre-built dashboard widget as a starting point",
    ],
    documentation: "https://docs.gitmesh.com/analytics#metrics",
    severity: Severity::Low,
};

pub const INVALID_FILTER: ErrorTemplate = ErrorTemplate {
    title: "Filter Configuration Error",
    message: "One or more filters in your query are not configured correctly.",
    suggestions: &[
        "Check that all filters have valid values",
        "Ensure date filters use the correct date format",
        "Verify that filter values exist in the data",
        "Remove complex filters and add them back one at a time",
    ],
    documentation: "https://docs.gitmesh.com/analytics#filters",
    severity: Severity::Medium,
};

pub const QUERY_TOO_COMPLEX: ErrorTemplate = ErrorTemplate {
    title: "Query Too Complex",
    message: "Your query is too complex and may take too long to process or use too many resources.",
    suggestions: &[
        "Reduce the number of dimensions and measures",
        "Add more specific filters to limit the data range",
        "Break complex queries into smaller, simpler ones",
        "Consider using pre-aggregated data or summary views",
    ],
    documentation: "https://docs.gitmesh.com/analytics#performance",
    severity: Severity::Medium,
};

pub const QUERY_TIMEOUT: ErrorTemplate = ErrorTemplate {
    title: "Query Timeout",
    message: "Your query took too long to process and was cancelled to prevent system overload.",
    suggestions: &[
        "Add more specific filters to reduce the amount of data processed",
        "Try querying a smaller date range",
        "Reduce the number of dimensions in your query",
        "Contact support if you need to analyze large datasets regularly",
    ],
    documentation: "https://docs.gitmesh.com/analytics#timeouts",
    severity: Severity::Medium,
};

pub const CONNECTION_FAILED: ErrorTemplate = ErrorTemplate {
    title: "Database Connection Error",
    message: "Unable to connect to the data source. This is usually a temporary issue.",
    suggestions: &[
        "Wait a moment and try again",
        "Check your internet connection",
        "Try refreshing the page",
        "Contact support if the problem persists for more than a few minutes",
    ],
    documentation: "https://docs.gitmesh.com/troubleshooting#connectivity",
    severity: Severity::High,
};

pub const CONNECTION_TIMEOUT: ErrorTemplate = ErrorTemplate {
    title: "Database Connection Timeout",
    message: "The connection to the data source timed out. This might be due to high system load.",
    suggestions: &[
        "Wait a few minutes and try again",
        "Try during off-peak hours for better performance",
        "Simplify your query to reduce processing time",
        "Contact support if timeouts occur frequently",
    ],
    documentation: "https://docs.gitmesh.com/troubleshooting#timeouts",
    severity: Severity::Medium,
};

pub const MAINTENANCE_MODE: ErrorTemplate = ErrorTemplate {
    title: "System Maintenance",
    message: "The analytics system is currently undergoing maintenance. Some features may be temporarily unavailable.",
    suggestions: &[
        "Check the system status page for maintenance schedules",
        "Try again after the maintenance window",
        "Use cached data if available",
        "Subscribe to status updates for maintenance notifications",
    ],
    documentation: "https://status.gitmesh.com",
    severity: Severity::Low,
};

pub const RESOURCE_EXHAUSTED: ErrorTemplate = ErrorTemplate {
    title: "System Resources Unavailable",
    message: "The system is currently at capacity and cannot process additional requests.",
    suggestions: &[
        "Wait a few minutes and try again",
        "Try during off-peak hours",
        "Use simpler queries that require fewer resources",
        "Contact support if you consistently see this error",
    ],
    documentation: "https://docs.gitmesh.com/troubleshooting#capacity",
    severity: Severity::High,
};

fn contains_all(text: &str, words: &[&str]) -> bool {
    words.iter().all(|w| text.contains(w))
}

fn contains_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// Picks the template for an error. `message` must already be lowercase.
pub fn select_template(
    category: ErrorCategory,
    message: &str,
    query: &CubeQuery,
    context: &SecurityContext,
) -> &'static ErrorTemplate {
    match category {
        ErrorCategory::Security => {
            if context.tenant().is_none() {
                &MISSING_TENANT_ID
            } else if contains_any(message, &["expired", "invalid token"]) {
                &EXPIRED_TOKEN
            } else if contains_any(message, &["forbidden", "insufficient"]) {
                &INSUFFICIENT_PERMISSIONS
            } else if context.segments.as_ref().is_none_or(Vec::is_empty) {
                &MISSING_SEGMENTS
            } else if contains_all(message, &["tenant", "invalid"]) {
                &INVALID_TENANT_ID
            } else {
                &INSUFFICIENT_PERMISSIONS
            }
        }
        ErrorCategory::Schema => {
            if contains_all(message, &["relation", "does not exist"]) {
                &MISSING_TABLE
            } else if contains_all(message, &["column", "does not exist"]) {
                &MISSING_COLUMN
            } else if contains_any(message, &["join", "relationship"]) {
                &INVALID_JOIN
            } else if contains_all(message, &["schema", "changed"]) {
                &SCHEMA_DRIFT
            } else {
                &MISSING_TABLE
            }
        }
        ErrorCategory::Query => {
            if query.measures.is_empty() {
                &MISSING_MEASURES
            } else if message.contains("timeout") {
                &QUERY_TIMEOUT
            } else if contains_any(message, &["complex", "too many"]) {
                &QUERY_TOO_COMPLEX
            } else if contains_any(message, &["filter", "invalid value"]) {
                &INVALID_FILTER
            } else {
                &INVALID_SYNTAX
            }
        }
        ErrorCategory::Database => {
            if message.contains("timeout") {
                &CONNECTION_TIMEOUT
            } else if contains_any(message, &["maintenance", "unavailable"]) {
                &MAINTENANCE_MODE
            } else if contains_any(message, &["capacity", "resource"]) {
                &RESOURCE_EXHAUSTED
            } else {
                &CONNECTION_FAILED
            }
        }
    }
}

fn parse_day(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|d| d.date_naive()))
}

fn spans_more_than_a_year(range: &DateRange) -> bool {
    range
        .bounds()
        .and_then(|(from, to)| Some((parse_day(from)?, parse_day(to)?)))
        .is_some_and(|(from, to)| (to - from).num_days() > 365)
}

/// Template suggestions plus hints derived from the query and context
pub fn contextual_suggestions(
    category: ErrorCategory,
    template: &ErrorTemplate,
    query: &CubeQuery,
    context: &SecurityContext,
) -> Vec<String> {
    let mut suggestions: Vec<String> = template.suggestions.iter().map(|s| (*s).to_string()).collect();

    match category {
        ErrorCategory::Query => {
            if query.filter_count() > 5 {
                suggestions.push(
                    "Consider reducing the number of filters to improve performance".to_string(),
                );
            }
            if query.dimension_count() > 10 {
                suggestions
                    .push("Try reducing the number of dimensions for better performance".to_string());
            }
            let large_range = query
                .time_dimensions
                .iter()
                .flatten()
                .filter_map(|t| t.date_range.as_ref())
                .any(spans_more_than_a_year);
            if large_range {
                suggestions
                    .push("Consider using a smaller date range for better performance".to_string());
            }
        }
        ErrorCategory::Security => {
            if context.segments.as_ref().is_some_and(Vec::is_empty) {
                suggestions.push(
                    "Your user account may need additional permissions configured".to_string(),
                );
            }
        }
        ErrorCategory::Schema | ErrorCategory::Database => {}
    }

    suggestions
}

/// Numbered resolution steps for a category
pub fn step_by_step_guidance(
    category: ErrorCategory,
    query: &CubeQuery,
    context: &SecurityContext,
) -> Vec<String> {
    let steps: &[&str] = match category {
        ErrorCategory::Security if context.tenant().is_none() => &[
            "1. Log out of your current session",
            "2. Clear your browser cache and cookies",
            "3. Log back in to your organization",
            "4. Try your request again",
        ],
        ErrorCategory::Security => &[
            "1. Verify you have the correct permissions for this data",
            "2. Contact your organization administrator if needed",
            "3. Try accessing different data to confirm your access level",
        ],
        ErrorCategory::Schema => &[
            "1. Refresh the page to load the latest data structure",
            "2. Check if the data source name is spelled correctly",
            "3. Try using a different, similar data source",
            "4. Contact your administrator if the data was recently available",
            "5. Check the system status page for any ongoing maintenance",
        ],
        ErrorCategory::Query if query.measures.is_empty() => &[
            "1. Select at least one metric (count, sum, average, etc.)",
            "2. Choose the dimensions you want to analyze",
            "3. Add any necessary filters",
            "4. Submit your query",
        ],
        ErrorCategory::Query => &[
            "1. Simplify your query by removing some filters",
            "2. Reduce the number of dimensions",
            "3. Try a smaller date range if using time filters",
            "4. Test the query with minimal parameters first",
            "5. Gradually add complexity back",
        ],
        ErrorCategory::Database => &[
            "1. Wait 30 seconds and try again",
            "2. Check your internet connection",
            "3. Refresh the page",
            "4. Try a simpler query to test connectivity",
            "5. Contact support if the problem persists",
        ],
    };
    steps.iter().map(|s| (*s).to_string()).collect()
}
