//! Declarative cube definitions.
//!
//! A definition is plain data. It is deserialized from JSON and inspected,
//! never executed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One cube as declared in `<Name>.json`.
///
/// ```json
/// {
///   "sql_table": "mv_members",
///   "measures": { "count": { "type": "count" } },
///   "dimensions": { "isBot": { "sql": "${CUBE}.\"isBot\"", "type": "boolean" } },
///   "joins": { "Activities": { "sql": "${CUBE}.id = ${Activities}.\"memberId\"", "relationship": "hasMany" } }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CubeDefinition {
    /// Backing relation name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_table: Option<String>,
    /// Backing query, used when `sql_table` is absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub measures: BTreeMap<String, MeasureDefinition>,
    pub dimensions: BTreeMap<String, DimensionDefinition>,
    pub joins: BTreeMap<String, JoinDefinition>,
}

/// An aggregatable expression
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// A column-backed attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DimensionDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    pub primary_key: bool,
}

/// A join to another cube.
///
/// The relationship is kept as written so an unknown value can be reported
/// rather than rejected at parse time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    /// Target cube; the join's own name when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cube: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
}

/// The three join cardinalities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Relationship {
    HasMany,
    BelongsTo,
    HasOne,
}

impl Relationship {
    /// Spellings accepted in definitions, in the order they are suggested.
    pub const NAMES: [&'static str; 3] = ["hasMany", "belongsTo", "hasOne"];

    /// Parses a relationship, accepting the snake_case cardinality aliases.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hasMany" | "one_to_many" => Some(Self::HasMany),
            "belongsTo" | "many_to_one" => Some(Self::BelongsTo),
            "hasOne" | "one_to_one" => Some(Self::HasOne),
            _ => None,
        }
    }
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Relationship::HasMany => write!(f, "hasMany"),
            Relationship::BelongsTo => write!(f, "belongsTo"),
            Relationship::HasOne => write!(f, "hasOne"),
        }
    }
}

impl JoinDefinition {
    /// Name of the joined cube
    pub fn target<'a>(&'a self, join_name: &'a str) -> &'a str {
        self.cube.as_deref().unwrap_or(join_name)
    }
}

impl CubeDefinition {
    /// `sql_table`, falling back to `sql`
    pub fn table_expression(&self) -> Option<&str> {
        self.sql_table
            .as_deref()
            .or(self.sql.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    /// Relation backing this cube, if it can be resolved statically
    pub fn table_name(&self) -> Option<String> {
        self.table_expression().and_then(super::sql::table_name)
    }

    /// Every measure and dimension with an SQL expression, as
    /// `(field path, member name, expression)`.
    ///
    /// Field paths look like `dimensions.isBot`. Dimensions come first.
    pub fn member_expressions(&self) -> Vec<(String, &str, &str)> {
        let dimensions = self.dimensions.iter().filter_map(|(name, d)| {
            d.sql
                .as_deref()
                .map(|sql| (format!("dimensions.{}", name), name.as_str(), sql))
        });
        let measures = self.measures.iter().filter_map(|(name, m)| {
            m.sql
                .as_deref()
                .map(|sql| (format!("measures.{}", name), name.as_str(), sql))
        });
        dimensions.chain(measures).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_definition() {
        let json = r#"{
            "sql": "SELECT * FROM mv_members",
            "title": "ignored",
            "measures": { "count": { "type": "count" } },
            "dimensions": { "isBot": { "sql": "${CUBE}.\"isBot\"", "type": "boolean" } },
            "joins": { "Activities": { "sql": "x", "relationship": "one_to_many" } }
        }"#;
        let definition: CubeDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(definition.table_name().as_deref(), Some("mv_members"));
        assert_eq!(definition.measures["count"].kind.as_deref(), Some("count"));

        let join = &definition.joins["Activities"];
        assert_eq!(join.target("Activities"), "Activities");
        assert_eq!(
            join.relationship.as_deref().and_then(Relationship::parse),
            Some(Relationship::HasMany)
        );
    }

    #[test]
    fn test_sql_table_wins_over_sql() {
        let definition = CubeDefinition {
            sql_table: Some("mv_a".to_string()),
            sql: Some("SELECT * FROM mv_b".to_string()),
            ..Default::default()
        };
        assert_eq!(definition.table_name().as_deref(), Some("mv_a"));
        assert_eq!(CubeDefinition::default().table_name(), None);
    }

    #[test]
    fn test_member_expressions_order() {
        let mut definition = CubeDefinition::default();
        definition.measures.insert(
            "total".to_string(),
            MeasureDefinition {
                sql: Some("${CUBE}.amount".to_string()),
                kind: Some("sum".to_string()),
            },
        );
        definition.measures.insert("count".to_string(), MeasureDefinition::default());
        definition.dimensions.insert(
            "id".to_string(),
            DimensionDefinition {
                sql: Some("id".to_string()),
                ..Default::default()
            },
        );

        let members = definition.member_expressions();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].0, "dimensions.id");
        assert_eq!(members[1].1, "total");
    }

    #[test]
    fn test_relationship_parse() {
        assert_eq!(Relationship::parse("belongsTo"), Some(Relationship::BelongsTo));
        assert_eq!(Relationship::parse("one_to_one"), Some(Relationship::HasOne));
        assert_eq!(Relationship::parse("manyToMany"), None);
    }
}
