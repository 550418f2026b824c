use super::types::{CubeQuery, DateRange, Filter, SecurityContext, TimeDimension};
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of validating a security context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContextResult {
    pub is_valid: bool,
    pub has_tenant_id: bool,
    pub has_segments: bool,
    pub errors: Vec<String>,
}

/// Outcome of validating one query.
///
/// `sanitized_query` is an independent copy of the input, present only when
/// the query is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitized_query: Option<CubeQuery>,
}

impl QueryValidationResult {
    fn rejected(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
            warnings,
            sanitized_query: None,
        }
    }
}

/// Smoke-test outcome for one dashboard query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardQueryResult {
    pub query_name: String,
    pub success: bool,
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CubeQuery>,
}

#[derive(Debug, Default)]
struct Findings {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Findings {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Validates query structure and security context against the registry.
///
/// Unknown cubes, measures, operators and granularities are warnings. Only
/// structural problems and a missing tenant make a query invalid.
#[derive(Debug, Clone)]
pub struct QueryValidator {
    registry: Arc<Registry>,
    correlation_id: Uuid,
}

impl QueryValidator {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Checks a typed security context.
    ///
    /// The tenant id must be present and not blank. A user id, if given, must
    /// not be blank.
    pub fn validate_security_context(&self, context: &SecurityContext) -> SecurityContextResult {
        let mut errors = Vec::new();

        let has_tenant_id = context.tenant().is_some();
        if !has_tenant_id {
            errors.push("tenantId is required and must be a non-empty string".to_string());
        }
        if context.user_id.as_deref().is_some_and(|u| u.trim().is_empty()) {
            errors.push("userId must be a non-empty string if provided".to_string());
        }

        SecurityContextResult {
            is_valid: errors.is_empty(),
            has_tenant_id,
            has_segments: context.segments.is_some(),
            errors,
        }
    }

    /// Checks a security context given as raw JSON, including field types.
    pub fn validate_security_context_value(&self, context: &Value) -> SecurityContextResult {
        let Some(object) = context.as_object() else {
            return SecurityContextResult {
                is_valid: false,
                has_tenant_id: false,
                has_segments: false,
                errors: vec!["Security context is required".to_string()],
            };
        };

        let mut errors = Vec::new();
        let has_tenant_id = object
            .get("tenantId")
            .and_then(Value::as_str)
            .is_some_and(|t| !t.trim().is_empty());
        if !has_tenant_id {
            errors.push("tenantId is required and must be a non-empty string".to_string());
        }

        let segments = object.get("segments");
        if segments.is_some_and(|s| !s.is_array()) {
            errors.push("segments must be an array if provided".to_string());
        }
        if object
            .get("userId")
            .is_some_and(|u| u.as_str().is_none_or(|u| u.trim().is_empty()))
        {
            errors.push("userId must be a non-empty string if provided".to_string());
        }
        if object.get("permissions").is_some_and(|p| !p.is_array()) {
            errors.push("permissions must be an array if provided".to_string());
        }

        SecurityContextResult {
            is_valid: errors.is_empty(),
            has_tenant_id,
            has_segments: segments.is_some_and(Value::is_array),
            errors,
        }
    }

    /// Validates a typed query.
    ///
    /// An invalid security context short-circuits: its errors are returned
    /// alone and the query itself is not inspected.
    pub fn validate_query(&self, query: &CubeQuery, context: &SecurityContext) -> QueryValidationResult {
        let context_result = self.validate_security_context(context);
        if !context_result.is_valid {
            return QueryValidationResult::rejected(context_result.errors, Vec::new());
        }

        let mut findings = Findings::default();
        if query.measures.is_empty() {
            findings.error("At least one measure is required");
        }
        self.check_measures(&query.measures, &mut findings);
        if let Some(dimensions) = &query.dimensions {
            self.check_dimensions(dimensions, &mut findings);
        }
        if let Some(filters) = &query.filters {
            self.check_filters(filters, &mut findings);
        }
        if let Some(time_dimensions) = &query.time_dimensions {
            self.check_time_dimensions(time_dimensions, &mut findings);
        }

        let is_valid = findings.errors.is_empty();
        debug!(
            measures = query.measures.len(),
            errors = findings.errors.len(),
            warnings = findings.warnings.len(),
            "Validated query"
        );
        QueryValidationResult {
            is_valid,
            errors: findings.errors,
            warnings: findings.warnings,
            sanitized_query: is_valid.then(|| query.clone()),
        }
    }

    /// Validates a query and context given as raw JSON.
    ///
    /// Type errors that cannot be represented by [`CubeQuery`] (a string
    /// where an array belongs, a negative limit) are reported first; a
    /// well-shaped query then goes through [`Self::validate_query`].
    pub fn validate_query_value(&self, query: &Value, context: &Value) -> QueryValidationResult {
        let context_result = self.validate_security_context_value(context);
        if !context_result.is_valid {
            return QueryValidationResult::rejected(context_result.errors, Vec::new());
        }

        let shape = query_shape_errors(query);
        if !shape.is_empty() {
            return QueryValidationResult::rejected(shape, Vec::new());
        }

        let parsed = serde_json::from_value::<CubeQuery>(whole_paging(query)).and_then(|q| {
            serde_json::from_value::<SecurityContext>(context.clone()).map(|c| (q, c))
        });
        match parsed {
            Ok((query, context)) => self.validate_query(&query, &context),
            Err(e) => {
                warn!(
                    error = %e,
                    correlation_id = %self.correlation_id,
                    "Query validation failed"
                );
                QueryValidationResult::rejected(
                    vec![format!("Query validation failed: {}", e)],
                    Vec::new(),
                )
            }
        }
    }

    /// Validates every dashboard query in the registry under the smoke-test
    /// context.
    pub fn test_dashboard_queries(&self) -> Vec<DashboardQueryResult> {
        let context = &self.registry.smoke_test_context;
        let results: Vec<DashboardQueryResult> = self
            .registry
            .dashboard_queries
            .iter()
            .map(|dashboard| {
                let started = Instant::now();
                let validation = self.validate_query(&dashboard.query, context);
                DashboardQueryResult {
                    query_name: dashboard.name.clone(),
                    success: validation.is_valid,
                    response_time_ms: started.elapsed().as_millis() as u64,
                    error: (!validation.errors.is_empty()).then(|| validation.errors.join("; ")),
                    result: validation.sanitized_query,
                }
            })
            .collect();

        info!(
            total = results.len(),
            passed = results.iter().filter(|r| r.success).count(),
            "Dashboard query smoke test completed"
        );
        results
    }

    fn check_measures(&self, measures: &[String], findings: &mut Findings) {
        for measure in measures {
            if measure.trim().is_empty() {
                findings.error("Each measure must be a non-empty string");
                continue;
            }
            let Some((cube, name)) = split_member(measure) else {
                findings.error(format!(
                    "Invalid measure format: {}. Expected format: Cube.measure",
                    measure
                ));
                continue;
            };
            if !self.registry.is_known_cube(cube) {
                findings.warning(self.unknown_cube(cube));
            }
            if !self.registry.is_known_measure(name) {
                findings.warning(format!(
                    "Unknown measure: {}. Known measures: {}",
                    name,
                    self.registry.known_measures.join(", ")
                ));
            }
        }
    }

    fn check_dimensions(&self, dimensions: &[String], findings: &mut Findings) {
        for dimension in dimensions {
            if dimension.trim().is_empty() {
                findings.error("Each dimension must be a non-empty string");
                continue;
            }
            match split_member(dimension) {
                Some((cube, _)) if !self.registry.is_known_cube(cube) => {
                    findings.warning(self.unknown_cube(cube));
                }
                Some(_) => {}
                None => findings.error(format!(
                    "Invalid dimension format: {}. Expected format: Cube.dimension",
                    dimension
                )),
            }
        }
    }

    fn check_filters(&self, filters: &[Filter], findings: &mut Findings) {
        for filter in filters {
            if filter.member.is_empty() {
                findings.error("Filter member is required and must be a string");
                continue;
            }
            if filter.operator.is_empty() {
                findings.error("Filter operator is required and must be a string");
                continue;
            }
            if !self.registry.filter_operators.contains(&filter.operator) {
                findings.warning(format!(
                    "Unknown operator: {}. Known operators: {}",
                    filter.operator,
                    self.registry.filter_operators.join(", ")
                ));
            }
            if filter.values.is_empty() {
                findings.warning(format!("Filter for {} has empty values array", filter.member));
            }
        }
    }

    fn check_time_dimensions(&self, time_dimensions: &[TimeDimension], findings: &mut Findings) {
        for time_dimension in time_dimensions {
            if time_dimension.dimension.is_empty() {
                findings.error("Time dimension must have a dimension field as string");
                continue;
            }
            if let Some(granularity) = &time_dimension.granularity
                && !self.registry.granularities.contains(granularity)
            {
                findings.warning(format!(
                    "Unknown granularity: {}. Known granularities: {}",
                    granularity,
                    self.registry.granularities.join(", ")
                ));
            }
            if let Some(DateRange::Bounds(bounds)) = &time_dimension.date_range
                && bounds.len() != 2
            {
                findings.error("Date range array must have exactly 2 elements");
            }
        }
    }

    fn unknown_cube(&self, cube: &str) -> String {
        format!(
            "Unknown cube: {}. Known cubes: {}",
            cube,
            self.registry.known_cubes.join(", ")
        )
    }
}

/// `Cube.member` split in two; anything with other than exactly one dot is
/// malformed.
fn split_member(member: &str) -> Option<(&str, &str)> {
    let (cube, name) = member.split_once('.')?;
    (!name.contains('.')).then_some((cube, name))
}

/// Copy of `query` with fractional `limit`/`offset` values truncated to
/// whole numbers. Callers have already rejected negative values.
fn whole_paging(query: &Value) -> Value {
    let mut query = query.clone();
    if let Some(object) = query.as_object_mut() {
        for field in ["limit", "offset"] {
            if let Some(value) = object.get_mut(field)
                && value.as_u64().is_none()
                && let Some(n) = value.as_f64()
            {
                *value = Value::from(n.trunc() as u64);
            }
        }
    }
    query
}

/// Type errors in a raw query that would prevent deserialization.
fn query_shape_errors(query: &Value) -> Vec<String> {
    let Some(object) = query.as_object() else {
        return vec!["Query is required".to_string()];
    };
    let mut errors = Vec::new();

    match object.get("measures").and_then(Value::as_array) {
        Some(measures) if !measures.is_empty() => {
            if measures.iter().any(|m| !m.is_string()) {
                errors.push("Each measure must be a non-empty string".to_string());
            }
        }
        _ => errors.push("At least one measure is required".to_string()),
    }

    for field in ["dimensions", "timeDimensions", "filters", "segments"] {
        if object.get(field).is_some_and(|v| !v.is_array()) {
            errors.push(format!("{} must be an array if provided", field));
        }
    }
    for field in ["limit", "offset"] {
        if object
            .get(field)
            .is_some_and(|v| v.as_f64().is_none_or(|n| n < 0.0))
        {
            errors.push(format!("{} must be a non-negative number if provided", field));
        }
    }

    if let Some(dimensions) = object.get("dimensions").and_then(Value::as_array)
        && dimensions.iter().any(|d| !d.is_string())
    {
        errors.push("Each dimension must be a non-empty string".to_string());
    }

    for filter in object
        .get("filters")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if !filter.get("member").is_some_and(Value::is_string) {
            errors.push("Filter member is required and must be a string".to_string());
        } else if !filter.get("operator").is_some_and(Value::is_string) {
            errors.push("Filter operator is required and must be a string".to_string());
        } else if !filter.get("values").is_some_and(Value::is_array) {
            errors.push("Filter values must be an array".to_string());
        }
    }

    for time_dimension in object
        .get("timeDimensions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if !time_dimension.get("dimension").is_some_and(Value::is_string) {
            errors.push("Time dimension must have a dimension field as string".to_string());
            continue;
        }
        match time_dimension.get("dateRange") {
            None | Some(Value::Null) | Some(Value::String(_)) | Some(Value::Array(_)) => {}
            Some(_) => errors.push(
                "Date range must be either an array of 2 strings or a single string".to_string(),
            ),
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> QueryValidator {
        QueryValidator::new(Arc::new(Registry::default()))
    }

    #[test]
    fn test_healthy_query() {
        let query = CubeQuery::with_measures(["Organizations.count"]);
        let result = validator().validate_query(&query, &SecurityContext::for_tenant("t1"));
        assert!(result.is_valid);
        assert!(result.errors.is_empty());
        assert!(result.warnings.is_empty());
        assert_eq!(result.sanitized_query.as_ref(), Some(&query));
    }

    #[test]
    fn test_missing_tenant_short_circuits() {
        let query = CubeQuery::default();
        let context = SecurityContext {
            user_id: Some(" ".to_string()),
            ..Default::default()
        };
        let result = validator().validate_query(&query, &context);
        assert!(!result.is_valid);
        assert_eq!(
            result.errors,
            vec![
                "tenantId is required and must be a non-empty string",
                "userId must be a non-empty string if provided",
            ]
        );
        assert!(result.sanitized_query.is_none());
    }

    #[test]
    fn test_measure_and_dimension_checks() {
        let query = CubeQuery {
            measures: vec![
                "Members.count".to_string(),
                "Widgets.total".to_string(),
                "count".to_string(),
                "".to_string(),
            ],
            dimensions: Some(vec!["Members.a.b".to_string(), "Gadgets.name".to_string()]),
            ..Default::default()
        };
        let result = validator().validate_query(&query, &SecurityContext::for_tenant("t1"));
        assert!(!result.is_valid);
        assert_eq!(
            result.errors,
            vec![
                "Invalid measure format: count. Expected format: Cube.measure",
                "Each measure must be a non-empty string",
                "Invalid dimension format: Members.a.b. Expected format: Cube.dimension",
            ]
        );
        assert_eq!(result.warnings.len(), 3);
        assert!(result.warnings[0].starts_with("Unknown cube: Widgets. Known cubes: Organizations"));
        assert!(result.warnings[1].starts_with("Unknown measure: total."));
        assert!(result.warnings[2].starts_with("Unknown cube: Gadgets."));
    }

    #[test]
    fn test_filter_and_time_dimension_checks() {
        let query = CubeQuery {
            filters: Some(vec![
                Filter {
                    member: "Members.isBot".to_string(),
                    operator: "startsWith".to_string(),
                    values: Vec::new(),
                },
                Filter {
                    member: String::new(),
                    operator: "equals".to_string(),
                    values: vec!["x".to_string()],
                },
            ]),
            time_dimensions: Some(vec![TimeDimension {
                dimension: "Activities.date".to_string(),
                granularity: Some("fortnight".to_string()),
                date_range: Some(DateRange::Bounds(vec!["2024-01-01".to_string()])),
            }]),
            ..CubeQuery::with_measures(["Activities.count"])
        };
        let result = validator().validate_query(&query, &SecurityContext::for_tenant("t1"));
        assert_eq!(
            result.errors,
            vec![
                "Filter member is required and must be a string",
                "Date range array must have exactly 2 elements",
            ]
        );
        assert_eq!(
            result.warnings,
            vec![
                "Unknown operator: startsWith. Known operators: equals, notEquals, contains, notContains, gt, gte, lt, lte, inDateRange",
                "Filter for Members.isBot has empty values array",
                "Unknown granularity: fortnight. Known granularities: second, minute, hour, day, week, month, quarter, year",
            ]
        );
    }

    #[test]
    fn test_raw_security_context() {
        let v = validator();
        let result = v.validate_security_context_value(&Value::Null);
        assert_eq!(result.errors, vec!["Security context is required"]);

        let result = v.validate_security_context_value(&json!({
            "tenantId": "t1",
            "segments": "s1",
            "permissions": {"read": true},
            "userId": 42
        }));
        assert!(result.has_tenant_id);
        assert!(!result.has_segments);
        assert_eq!(
            result.errors,
            vec![
                "segments must be an array if provided",
                "userId must be a non-empty string if provided",
                "permissions must be an array if provided",
            ]
        );
    }

    #[test]
    fn test_raw_query_shape() {
        let v = validator();
        let context = json!({"tenantId": "t1"});

        let result = v.validate_query_value(&Value::Null, &context);
        assert_eq!(result.errors, vec!["Query is required"]);

        let result = v.validate_query_value(
            &json!({
                "measures": ["Members.count"],
                "dimensions": "Members.isBot",
                "limit": -1,
                "filters": [{"member": "Members.isBot", "operator": "equals", "values": "false"}],
                "timeDimensions": [{"dimension": "Activities.date", "dateRange": 7}]
            }),
            &context,
        );
        assert_eq!(
            result.errors,
            vec![
                "dimensions must be an array if provided",
                "limit must be a non-negative number if provided",
                "Filter values must be an array",
                "Date range must be either an array of 2 strings or a single string",
            ]
        );

        let result = v.validate_query_value(
            &json!({"measures": ["Members.count"], "filters": [{"member": "Members.score", "operator": "gt", "values": [5]}]}),
            &context,
        );
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Query validation failed:"));

        let result = v.validate_query_value(
            &json!({"measures": ["Members.count"], "limit": 100}),
            &context,
        );
        assert!(result.is_valid);
        assert_eq!(result.sanitized_query.and_then(|q| q.limit), Some(100));

        let result = v.validate_query_value(
            &json!({"measures": ["Members.count"], "limit": 10.0, "offset": 0.0}),
            &context,
        );
        assert!(result.is_valid, "{:?}", result.errors);
        let sanitized = result.sanitized_query.unwrap();
        assert_eq!((sanitized.limit, sanitized.offset), (Some(10), Some(0)));

        let result = v.validate_query_value(
            &json!({"measures": ["Members.count"], "offset": -0.5}),
            &context,
        );
        assert_eq!(result.errors, vec!["offset must be a non-negative number if provided"]);
    }

    #[test]
    fn test_dashboard_queries_pass_with_defaults() {
        let results = validator().test_dashboard_queries();
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| r.success && r.error.is_none()));
        assert_eq!(results[0].query_name, "Organizations.count");
        assert!(results[0].result.is_some());
    }

    #[test]
    fn test_dashboard_query_failure_is_reported() {
        let mut registry = Registry::default();
        registry.smoke_test_context.tenant_id = None;
        let results = QueryValidator::new(Arc::new(registry)).test_dashboard_queries();
        assert!(results.iter().all(|r| !r.success));
        assert_eq!(
            results[0].error.as_deref(),
            Some("tenantId is required and must be a non-empty string")
        );
    }
}
