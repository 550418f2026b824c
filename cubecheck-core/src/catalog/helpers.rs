//! Row decoding helpers for the PostgreSQL catalog.

use crate::{DiagnosticError, Result};
use sqlx::{Row, postgres::PgRow};

/// Extension trait for extracting typed values from catalog rows with
/// consistent error context.
///
/// # Example
/// ```rust,ignore
/// let name: String = row.get_field("column_name", Some("mv_members"))?;
/// ```
pub(crate) trait RowExt {
    /// Extracts a typed field, naming the relation in the error.
    fn get_field<'r, T>(&'r self, field_name: &str, relation: Option<&str>) -> Result<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>;
}

impl RowExt for PgRow {
    fn get_field<'r, T>(&'r self, field_name: &str, relation: Option<&str>) -> Result<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        self.try_get(field_name)
            .map_err(|e| DiagnosticError::parse_field(field_name, relation, e))
    }
}

/// Quotes an identifier for interpolation into SQL.
///
/// Only used where a bind parameter is impossible (relation names in
/// `FROM`). Embedded double quotes are doubled.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
