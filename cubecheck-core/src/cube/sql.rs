//! Static inspection of the SQL fragments in cube definitions.
//!
//! Nothing here parses SQL in general. Two narrow questions are answered:
//! which relation backs a cube, and which of the cube's own columns an
//! expression references.

use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Pre-compiled patterns for SQL fragment inspection.
struct SqlPatterns {
    /// `FROM [schema.]relation`, optionally quoted
    from_clause: regex::Regex,
    /// A lone, optionally schema-qualified and quoted, identifier
    identifier: regex::Regex,
    /// `${CUBE}.column` or `${Name}.column`, column optionally quoted
    member_reference: regex::Regex,
}

impl SqlPatterns {
    fn instance() -> &'static Self {
        static PATTERNS: OnceLock<SqlPatterns> = OnceLock::new();
        PATTERNS.get_or_init(Self::compile)
    }

    fn compile() -> Self {
        Self {
            from_clause: regex::Regex::new(
                r#"(?i)\bFROM\s+(?:["`]?\w+["`]?\.)?["`]?(\w+)["`]?"#,
            )
            .expect("Invalid FROM clause pattern"),
            identifier: regex::Regex::new(r#"^(?:["`]?\w+["`]?\.)?["'`]?(\w+)["'`]?$"#)
                .expect("Invalid identifier pattern"),
            member_reference: regex::Regex::new(r#"\$\{(\w+)\}\.["'`]?(\w+)["'`]?"#)
                .expect("Invalid member reference pattern"),
        }
    }
}

/// Resolves the relation a cube reads from.
///
/// Accepts a bare (optionally schema-qualified, optionally quoted) relation
/// name, or a `SELECT ... FROM relation` query. Returns `None` for anything
/// else.
///
/// # Example
/// ```rust
/// use cubecheck_core::cube::sql::table_name;
///
/// assert_eq!(table_name("mv_members").as_deref(), Some("mv_members"));
/// assert_eq!(table_name("SELECT * FROM public.\"mv_members\"").as_deref(), Some("mv_members"));
/// assert_eq!(table_name("SELECT 1"), None);
/// ```
pub fn table_name(expression: &str) -> Option<String> {
    let patterns = SqlPatterns::instance();
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(captures) = patterns.from_clause.captures(trimmed) {
        return captures.get(1).map(|m| m.as_str().to_string());
    }

    patterns
        .identifier
        .captures(trimmed)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

/// Columns of `cube` referenced by an expression, in order of first use.
///
/// `${CUBE}.col` and `${<cube>}.col` count as references; references to other
/// cubes are ignored. An expression that is a single identifier is itself
/// the column. Any other expression (literals, `COUNT(*)`, function calls
/// over other cubes) references nothing.
pub fn column_references(expression: &str, cube: &str) -> Vec<String> {
    let patterns = SqlPatterns::instance();
    let mut seen = BTreeSet::new();
    let mut columns = Vec::new();

    for captures in patterns.member_reference.captures_iter(expression) {
        let (Some(owner), Some(column)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        if (owner.as_str() == "CUBE" || owner.as_str() == cube)
            && seen.insert(column.as_str().to_string())
        {
            columns.push(column.as_str().to_string());
        }
    }

    if columns.is_empty() && !expression.contains("${") {
        let trimmed = expression.trim();
        let bare = patterns
            .identifier
            .captures(trimmed)
            .filter(|_| !trimmed.contains('.'))
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string());
        if let Some(column) = bare
            && !column.chars().all(|c| c.is_ascii_digit())
        {
            columns.push(column);
        }
    }

    columns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_forms() {
        assert_eq!(table_name("mv_members").as_deref(), Some("mv_members"));
        assert_eq!(table_name("  \"mv_members\" ").as_deref(), Some("mv_members"));
        assert_eq!(table_name("public.mv_members").as_deref(), Some("mv_members"));
        assert_eq!(
            table_name("select id, name from mv_organizations where tenant = 1").as_deref(),
            Some("mv_organizations")
        );
        assert_eq!(table_name(""), None);
        assert_eq!(table_name("SELECT 1"), None);
    }

    #[test]
    fn test_member_references() {
        assert_eq!(column_references("${CUBE}.\"isBot\"", "Members"), vec!["isBot"]);
        assert_eq!(
            column_references("${Members}.id = ${CUBE}.\"memberId\"", "Activities"),
            vec!["memberId"]
        );
        assert_eq!(
            column_references("${CUBE}.a + ${CUBE}.b + ${CUBE}.a", "X"),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_bare_identifier_is_a_reference() {
        assert_eq!(column_references("\"tenantId\"", "Members"), vec!["tenantId"]);
        assert_eq!(column_references("score", "Members"), vec!["score"]);
    }

    #[test]
    fn test_expressions_without_own_columns() {
        assert!(column_references("COUNT(*)", "Members").is_empty());
        assert!(column_references("1", "Members").is_empty());
        assert!(column_references("${Members}.id", "Activities").is_empty());
        assert!(column_references("CASE WHEN x THEN 1 END", "Members").is_empty());
    }
}
