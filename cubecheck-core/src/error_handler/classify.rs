use crate::query::SecurityContext;
use serde::{Deserialize, Serialize};

/// Mutually exclusive error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Security,
    Schema,
    Database,
    Query,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 4] = [
        ErrorCategory::Security,
        ErrorCategory::Schema,
        ErrorCategory::Database,
        ErrorCategory::Query,
    ];

    /// HTTP status for a response in this category
    pub fn status_code(self, message: &str) -> u16 {
        match self {
            ErrorCategory::Security if message.to_lowercase().contains("unauthorized") => 401,
            ErrorCategory::Security => 403,
            ErrorCategory::Query | ErrorCategory::Schema => 400,
            ErrorCategory::Database => 500,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Security => write!(f, "security"),
            ErrorCategory::Schema => write!(f, "schema"),
            ErrorCategory::Database => write!(f, "database"),
            ErrorCategory::Query => write!(f, "query"),
        }
    }
}

/// One step of the classification table.
///
/// `Keywords` matches when every word of any one group occurs in the
/// lower-cased message.
#[derive(Debug, Clone, Copy)]
enum Rule {
    Keywords(ErrorCategory, &'static [&'static [&'static str]]),
    MissingTenant,
}

const CLASSIFICATION_RULES: &[Rule] = &[
    Rule::Keywords(ErrorCategory::Security, &[&["unauthorized"], &["forbidden"]]),
    Rule::Keywords(
        ErrorCategory::Database,
        &[&["connection"], &["econnrefused"], &["timeout"], &["pool"]],
    ),
    Rule::MissingTenant,
    Rule::Keywords(
        ErrorCategory::Schema,
        &[
            &["relation", "does not exist"],
            &["column", "does not exist"],
            &["table"],
            &["materialized view"],
            &["schema"],
            &["cube", "not found"],
        ],
    ),
];

impl Rule {
    fn matches(self, message: &str, context: &SecurityContext) -> Option<ErrorCategory> {
        match self {
            Rule::Keywords(category, groups) => groups
                .iter()
                .any(|group| group.iter().all(|word| message.contains(word)))
                .then_some(category),
            Rule::MissingTenant => context.tenant().is_none().then_some(ErrorCategory::Security),
        }
    }
}

/// Assigns an error message to a category. First match wins:
///
/// 1. authorization vocabulary → security
/// 2. connection vocabulary → database
/// 3. missing tenant id → security
/// 4. relation, column or schema vocabulary → schema
/// 5. anything else → query
///
/// The missing-tenant rule runs after the database rule, not first. A message
/// naming a refused or timed-out connection is therefore always a database
/// error with status 500, whatever the caller's context holds.
///
/// # Example
/// ```rust
/// use cubecheck_core::error_handler::{ErrorCategory, classify_error};
/// use cubecheck_core::query::SecurityContext;
///
/// let context = SecurityContext::default();
/// assert_eq!(classify_error("connect ECONNREFUSED 127.0.0.1:5432", &context), ErrorCategory::Database);
/// assert_eq!(classify_error("column \"isBot\" does not exist", &context), ErrorCategory::Security);
/// ```
pub fn classify_error(message: &str, context: &SecurityContext) -> ErrorCategory {
    let message = message.to_lowercase();
    CLASSIFICATION_RULES
        .iter()
        .find_map(|rule| rule.matches(&message, context))
        .unwrap_or(ErrorCategory::Query)
}
