//! Error classification and user-facing error responses.
//!
//! [`ErrorHandler::handle_query_error`] turns any error raised while serving
//! a query into an [`ErrorResponse`] with an HTTP status, a templated message
//! and suggestions. Every handled error is logged as a [`StructuredError`]
//! and kept in a bounded history for reporting. Filter values and user ids
//! are redacted before anything is logged or stored.

mod classify;
pub mod templates;

pub use classify::{ErrorCategory, classify_error};
pub use templates::ErrorTemplate;

use crate::error::error_chain_message;
use crate::models::Severity;
use crate::query::{CubeQuery, SecurityContext};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tracing::{error, warn};
use uuid::Uuid;

/// Default number of errors kept in history
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

const REDACTED: &str = "[REDACTED]";
const RECENT_ERROR_LIMIT: usize = 10;

/// Log level a handled error was recorded at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLevel {
    Error,
    Warn,
}

/// Query and context attached to a logged error, already redacted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredErrorDetails {
    pub query: Option<CubeQuery>,
    pub security_context: Option<SecurityContext>,
    pub suggestions: Vec<String>,
}

/// One handled error as logged and kept in history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    pub timestamp: DateTime<Utc>,
    pub level: ErrorLevel,
    pub category: ErrorCategory,
    pub message: String,
    pub details: StructuredErrorDetails,
    pub correlation_id: String,
}

/// Debugging aids returned to the caller.
///
/// Outside development mode only the correlation id is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_chain: Option<Vec<String>>,
}

/// Response body for a failed query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status_code: u16,
    pub category: ErrorCategory,
    pub title: String,
    pub message: String,
    pub details: String,
    pub suggestions: Vec<String>,
    pub guidance: Vec<String>,
    pub documentation: String,
    pub severity: Severity,
    pub debug_info: DebugInfo,
}

/// Error volume over the last 24 hours
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub generated_at: DateTime<Utc>,
    pub total_errors: usize,
    pub errors_by_category: BTreeMap<ErrorCategory, usize>,
    /// Up to ten most recent errors, oldest first
    pub recent_errors: Vec<StructuredError>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    /// Every error in history, regardless of age
    pub total: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub last_24_hours: usize,
}

fn redact_query(query: &CubeQuery) -> CubeQuery {
    let mut query = query.clone();
    for filter in query.filters.iter_mut().flatten() {
        filter.values = vec![REDACTED.to_string(); filter.values.len()];
    }
    query
}

fn redact_context(context: &SecurityContext) -> SecurityContext {
    SecurityContext {
        user_id: context.user_id.as_ref().map(|_| REDACTED.to_string()),
        ..context.clone()
    }
}

fn count_by_category<'a>(errors: impl Iterator<Item = &'a StructuredError>) -> BTreeMap<ErrorCategory, usize> {
    let mut counts = BTreeMap::new();
    for error in errors {
        *counts.entry(error.category).or_insert(0) += 1;
    }
    counts
}

/// Classifies, logs and renders query errors.
#[derive(Debug)]
pub struct ErrorHandler {
    history: Mutex<VecDeque<StructuredError>>,
    capacity: usize,
    dev_mode: bool,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ErrorHandler {
    /// Creates a handler. In development mode responses include the full
    /// error chain.
    pub fn new(dev_mode: bool) -> Self {
        Self::with_capacity(dev_mode, DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(dev_mode: bool, capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
            capacity: capacity.max(1),
            dev_mode,
        }
    }

    /// Handles an error value, classifying on its full source chain.
    pub fn handle_query_error(
        &self,
        error: &(dyn std::error::Error + 'static),
        query: &CubeQuery,
        context: &SecurityContext,
    ) -> ErrorResponse {
        let mut chain = Vec::new();
        let mut source = Some(error);
        while let Some(inner) = source {
            chain.push(inner.to_string());
            source = inner.source();
        }
        self.respond(&error_chain_message(error), chain, query, context)
    }

    /// Handles an error known only by its message.
    pub fn handle_error_message(
        &self,
        message: &str,
        query: &CubeQuery,
        context: &SecurityContext,
    ) -> ErrorResponse {
        self.respond(message, vec![message.to_string()], query, context)
    }

    fn respond(
        &self,
        message: &str,
        chain: Vec<String>,
        query: &CubeQuery,
        context: &SecurityContext,
    ) -> ErrorResponse {
        let correlation_id = Uuid::new_v4().to_string();
        let category = classify_error(message, context);
        let status_code = category.status_code(message);
        let template = templates::select_template(category, &message.to_lowercase(), query, context);
        let suggestions = templates::contextual_suggestions(category, template, query, context);

        self.log_structured_error(StructuredError {
            timestamp: Utc::now(),
            level: if status_code >= 500 {
                ErrorLevel::Error
            } else {
                ErrorLevel::Warn
            },
            category,
            message: message.to_string(),
            details: StructuredErrorDetails {
                query: Some(redact_query(query)),
                security_context: Some(redact_context(context)),
                suggestions: suggestions.clone(),
            },
            correlation_id: correlation_id.clone(),
        });

        ErrorResponse {
            status_code,
            category,
            title: template.title.to_string(),
            message: template.message.to_string(),
            details: error_details(category, message, query, context),
            suggestions,
            guidance: templates::step_by_step_guidance(category, query, context),
            documentation: template.documentation.to_string(),
            severity: template.severity,
            debug_info: DebugInfo {
                correlation_id,
                original_error: self.dev_mode.then(|| message.to_string()),
                error_chain: self.dev_mode.then_some(chain),
            },
        }
    }

    /// Records an error in history and logs it. The oldest entry is evicted
    /// once the history is full.
    pub fn log_structured_error(&self, structured: StructuredError) {
        let tenant_id = structured
            .details
            .security_context
            .as_ref()
            .and_then(|c| c.tenant_id.clone())
            .unwrap_or_default();
        let measures = structured
            .details
            .query
            .as_ref()
            .map(|q| q.measures.join(","))
            .unwrap_or_default();
        let dimensions = structured
            .details
            .query
            .as_ref()
            .and_then(|q| q.dimensions.as_ref())
            .map(|d| d.join(","))
            .unwrap_or_default();
        let suggestions = structured.details.suggestions.join(" | ");

        match structured.level {
            ErrorLevel::Error => error!(
                category = %structured.category,
                correlation_id = %structured.correlation_id,
                tenant_id = %tenant_id,
                query_measures = %measures,
                query_dimensions = %dimensions,
                suggestions = %suggestions,
                error = %structured.message,
                "CubeJS query error"
            ),
            ErrorLevel::Warn => warn!(
                category = %structured.category,
                correlation_id = %structured.correlation_id,
                tenant_id = %tenant_id,
                query_measures = %measures,
                query_dimensions = %dimensions,
                suggestions = %suggestions,
                error = %structured.message,
                "CubeJS query warning"
            ),
        }

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(structured);
    }

    fn errors_since(&self, cutoff: DateTime<Utc>) -> Vec<StructuredError> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Summarizes the last 24 hours of handled errors.
    pub fn generate_error_report(&self) -> ErrorReport {
        let now = Utc::now();
        let recent = self.errors_since(now - Duration::hours(24));
        let by_category = count_by_category(recent.iter());
        let recommendations = report_recommendations(&recent, &by_category, now);

        ErrorReport {
            generated_at: now,
            total_errors: recent.len(),
            errors_by_category: by_category,
            recent_errors: recent[recent.len().saturating_sub(RECENT_ERROR_LIMIT)..].to_vec(),
            recommendations,
        }
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        let recent = self.errors_since(Utc::now() - Duration::hours(24));
        ErrorStatistics {
            total: self.history_len(),
            by_category: count_by_category(recent.iter()),
            last_24_hours: recent.len(),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn error_details(
    category: ErrorCategory,
    message: &str,
    query: &CubeQuery,
    context: &SecurityContext,
) -> String {
    let mut details = vec![format!("Error Category: {}", category)];
    match category {
        ErrorCategory::Security => {
            details.push(format!(
                "Tenant ID: {}",
                if context.tenant().is_some() { "provided" } else { "missing" }
            ));
            details.push(format!(
                "User ID: {}",
                if context.user_id.is_some() { "provided" } else { "missing" }
            ));
            details.push(format!(
                "Segments: {} provided",
                context.segments.as_ref().map_or(0, Vec::len)
            ));
        }
        ErrorCategory::Query => {
            details.push(format!("Measures: {} requested", query.measures.len()));
            details.push(format!("Dimensions: {} requested", query.dimension_count()));
            details.push(format!("Filters: {} applied", query.filter_count()));
        }
        ErrorCategory::Schema | ErrorCategory::Database => {}
    }
    details.push(format!("Original Error: {}", message));
    details.join(" | ")
}

fn report_recommendations(
    recent: &[StructuredError],
    by_category: &BTreeMap<ErrorCategory, usize>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let total = recent.len();
    if total == 0 {
        return vec!["System is operating normally with no recent errors".to_string()];
    }

    let share = |category| by_category.get(&category).copied().unwrap_or(0) as f64 / total as f64;
    let mut recommendations = Vec::new();

    if total > 50 {
        recommendations.push("High error volume detected - investigate system health".to_string());
    }
    if share(ErrorCategory::Schema) > 0.3 {
        recommendations.push(
            "High schema error rate - review cube definitions and database schema".to_string(),
        );
    }
    if share(ErrorCategory::Database) > 0.2 {
        recommendations.push(
            "Database connectivity issues detected - check database health and network".to_string(),
        );
    }
    if share(ErrorCategory::Security) > 0.2 {
        recommendations
            .push("Authentication/authorization issues - review security configuration".to_string());
    }
    if share(ErrorCategory::Query) > 0.4 {
        recommendations
            .push("Query validation issues - review client query generation logic".to_string());
    }

    let last_hour = recent
        .iter()
        .filter(|e| e.timestamp >= now - Duration::hours(1))
        .count();
    if last_hour as f64 > total as f64 * 0.5 {
        recommendations
            .push("Error rate increasing - immediate investigation recommended".to_string());
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DiagnosticError;
    use crate::query::Filter;

    fn tenant() -> SecurityContext {
        SecurityContext {
            user_id: Some("user-42".to_string()),
            segments: Some(vec!["s1".to_string()]),
            ..SecurityContext::for_tenant("t1")
        }
    }

    fn structured(category: ErrorCategory, age: Duration) -> StructuredError {
        StructuredError {
            timestamp: Utc::now() - age,
            level: ErrorLevel::Warn,
            category,
            message: "x".to_string(),
            details: StructuredErrorDetails {
                query: None,
                security_context: None,
                suggestions: Vec::new(),
            },
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    #[test]
    fn test_connection_refused_is_database_error() {
        let handler = ErrorHandler::default();
        let error = DiagnosticError::connection_failed(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connect ECONNREFUSED 127.0.0.1:5432",
        ));

        for context in [tenant(), SecurityContext::default()] {
            let response =
                handler.handle_query_error(&error, &CubeQuery::default(), &context);
            assert_eq!(response.category, ErrorCategory::Database);
            assert_eq!(response.status_code, 500);
            assert_eq!(response.title, "Database Connection Error");
        }
        assert_eq!(handler.history_len(), 2);
    }

    #[test]
    fn test_response_shape() {
        let handler = ErrorHandler::default();
        let query = CubeQuery::with_measures(["Members.count"]);
        let response = handler.handle_error_message("Unexpected token in filter", &query, &tenant());

        assert_eq!(response.status_code, 400);
        assert_eq!(response.category, ErrorCategory::Query);
        assert_eq!(response.title, "Filter Configuration Error");
        assert!((2..=5).contains(&response.suggestions.len()));
        assert_eq!(
            response.details,
            "Error Category: query | Measures: 1 requested | Dimensions: 0 requested | Filters: 0 applied | Original Error: Unexpected token in filter"
        );
        assert!(Uuid::parse_str(&response.debug_info.correlation_id).is_ok());
        assert!(response.debug_info.original_error.is_none());
    }

    #[test]
    fn test_dev_mode_includes_chain() {
        let handler = ErrorHandler::new(true);
        let error = DiagnosticError::query_failed(
            "Failed to count rows",
            std::io::Error::other("relation \"mv_members\" does not exist"),
        );
        let response = handler.handle_query_error(
            &error,
            &CubeQuery::with_measures(["Members.count"]),
            &tenant(),
        );
        assert_eq!(response.category, ErrorCategory::Schema);
        assert_eq!(response.debug_info.error_chain.as_ref().map(Vec::len), Some(2));
        assert!(
            response
                .debug_info
                .original_error
                .as_deref()
                .is_some_and(|m| m.contains("mv_members"))
        );
    }

    #[test]
    fn test_security_status_codes() {
        let handler = ErrorHandler::default();
        let query = CubeQuery::with_measures(["Members.count"]);
        assert_eq!(
            handler.handle_error_message("Unauthorized", &query, &tenant()).status_code,
            401
        );
        let response = handler.handle_error_message("boom", &query, &SecurityContext::default());
        assert_eq!(response.status_code, 403);
        assert_eq!(response.title, "Missing Tenant ID");
        assert!(response.details.contains("Tenant ID: missing"));
    }

    #[test]
    fn test_logged_error_is_redacted() {
        let handler = ErrorHandler::default();
        let query = CubeQuery {
            filters: Some(vec![Filter {
                member: "Members.email".to_string(),
                operator: "equals".to_string(),
                values: vec!["alice@example.com".to_string()],
            }]),
            ..CubeQuery::with_measures(["Members.count"])
        };
        handler.handle_error_message("syntax error", &query, &tenant());

        let report = handler.generate_error_report();
        let details = &report.recent_errors[0].details;
        let logged_query = details.query.as_ref().unwrap();
        assert_eq!(logged_query.filters.as_ref().unwrap()[0].values, vec![REDACTED]);
        let logged_context = details.security_context.as_ref().unwrap();
        assert_eq!(logged_context.user_id.as_deref(), Some(REDACTED));
        assert_eq!(logged_context.tenant_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_history_is_bounded() {
        let handler = ErrorHandler::with_capacity(false, 3);
        for _ in 0..5 {
            handler.log_structured_error(structured(ErrorCategory::Query, Duration::zero()));
        }
        assert_eq!(handler.history_len(), 3);
        handler.clear_history();
        assert_eq!(handler.history_len(), 0);
    }

    #[test]
    fn test_report_recommendations() {
        let handler = ErrorHandler::default();
        assert_eq!(
            handler.generate_error_report().recommendations,
            vec!["System is operating normally with no recent errors"]
        );

        for _ in 0..3 {
            handler.log_structured_error(structured(ErrorCategory::Schema, Duration::hours(3)));
        }
        handler.log_structured_error(structured(ErrorCategory::Database, Duration::minutes(5)));
        handler.log_structured_error(structured(ErrorCategory::Query, Duration::hours(30)));

        let report = handler.generate_error_report();
        assert_eq!(report.total_errors, 4);
        assert_eq!(report.errors_by_category[&ErrorCategory::Schema], 3);
        assert_eq!(
            report.recommendations,
            vec![
                "High schema error rate - review cube definitions and database schema",
                "Database connectivity issues detected - check database health and network",
            ]
        );

        let stats = handler.error_statistics();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.last_24_hours, 4);
    }
}
