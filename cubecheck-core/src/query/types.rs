use serde::{Deserialize, Serialize};

/// Tenant scoping attached to every query.
///
/// Only the tenant id is mandatory; the validator enforces that, not the type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

impl SecurityContext {
    /// A context scoped to one tenant
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Default::default()
        }
    }

    /// The tenant id, if present and not blank
    pub fn tenant(&self) -> Option<&str> {
        self.tenant_id.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Either a relative range such as `"last 7 days"` or an explicit
/// `[from, to]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateRange {
    Relative(String),
    Bounds(Vec<String>),
}

impl DateRange {
    /// Explicit bounds, if this is a two-element range
    pub fn bounds(&self) -> Option<(&str, &str)> {
        match self {
            DateRange::Bounds(values) if values.len() == 2 => {
                Some((values[0].as_str(), values[1].as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeDimension {
    pub dimension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub member: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// A CubeJS load query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CubeQuery {
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_dimensions: Option<Vec<TimeDimension>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<Filter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl CubeQuery {
    /// A query selecting only the given measures
    pub fn with_measures<I, S>(measures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            measures: measures.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn dimension_count(&self) -> usize {
        self.dimensions.as_ref().map_or(0, Vec::len)
    }

    pub fn filter_count(&self) -> usize {
        self.filters.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_wire_format() {
        let json = r#"{
            "measures": ["Activities.count"],
            "timeDimensions": [
                {"dimension": "Activities.date", "granularity": "day", "dateRange": ["2024-01-01", "2024-02-01"]},
                {"dimension": "Activities.date", "dateRange": "last 7 days"}
            ],
            "limit": 10
        }"#;
        let query: CubeQuery = serde_json::from_str(json).unwrap();
        let time = query.time_dimensions.as_ref().unwrap();
        assert_eq!(
            time[0].date_range.as_ref().and_then(DateRange::bounds),
            Some(("2024-01-01", "2024-02-01"))
        );
        assert_eq!(
            time[1].date_range,
            Some(DateRange::Relative("last 7 days".to_string()))
        );
        assert_eq!(query.limit, Some(10));

        let out = serde_json::to_value(&query).unwrap();
        assert!(out.get("timeDimensions").is_some());
        assert!(out.get("dimensions").is_none());
    }

    #[test]
    fn test_security_context_tenant() {
        let context: SecurityContext =
            serde_json::from_str(r#"{"tenantId": "  ", "segments": ["s1"]}"#).unwrap();
        assert_eq!(context.tenant(), None);
        assert_eq!(SecurityContext::for_tenant("t1").tenant(), Some("t1"));
    }
}
