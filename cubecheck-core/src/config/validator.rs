//! Deployment configuration checks.
//!
//! Covers the `CUBEJS_*` environment table, the API secret's ability to sign
//! and verify tokens, the database parameters (optionally probing the
//! server), and the cube definition directory.

use super::Environment;
use crate::catalog::Connector;
use crate::cube::CubeRepository;
use crate::models::{ConfigValidationResult, HealthStatus};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Minimum accepted length of `CUBEJS_API_SECRET`
pub const MIN_API_SECRET_LENGTH: usize = 32;

/// Lifetime of the test token signed during JWT validation
const TEST_TOKEN_LIFETIME_SECS: i64 = 2 * 60 * 60;

struct EnvironmentVariableSpec {
    name: &'static str,
    required: bool,
    description: &'static str,
    check: Option<fn(&str) -> bool>,
}

fn valid_port(value: &str) -> bool {
    value.trim().parse::<u32>().is_ok_and(|p| (1..=65535).contains(&p))
}

fn valid_database_type(value: &str) -> bool {
    value == "postgres"
}

fn valid_api_secret(value: &str) -> bool {
    value.chars().count() >= MIN_API_SECRET_LENGTH
}

fn valid_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "false")
}

const ENVIRONMENT_VARIABLES: [EnvironmentVariableSpec; 10] = [
    EnvironmentVariableSpec {
        name: "CUBEJS_DB_HOST",
        required: true,
        description: "Database host for CubeJS connection",
        check: None,
    },
    EnvironmentVariableSpec {
        name: "CUBEJS_DB_PORT",
        required: true,
        description: "Database port for CubeJS connection",
        check: Some(valid_port),
    },
    EnvironmentVariableSpec {
        name: "CUBEJS_DB_NAME",
        required: true,
        description: "Database name for CubeJS connection",
        check: None,
    },
    EnvironmentVariableSpec {
        name: "CUBEJS_DB_USER",
        required: true,
        description: "Database user for CubeJS connection",
        check: None,
    },
    EnvironmentVariableSpec {
        name: "CUBEJS_DB_PASS",
        required: true,
        description: "Database password for CubeJS connection",
        check: None,
    },
    EnvironmentVariableSpec {
        name: "CUBEJS_DB_TYPE",
        required: true,
        description: "Database type (should be postgres)",
        check: Some(valid_database_type),
    },
    EnvironmentVariableSpec {
        name: "CUBEJS_API_SECRET",
        required: true,
        description: "API secret for CubeJS authentication",
        check: Some(valid_api_secret),
    },
    EnvironmentVariableSpec {
        name: "CUBEJS_DEV_MODE",
        required: false,
        description: "Development mode flag",
        check: Some(valid_flag),
    },
    EnvironmentVariableSpec {
        name: "CUBEJS_EXTERNAL_DEFAULT",
        required: false,
        description: "External default flag",
        check: Some(valid_flag),
    },
    EnvironmentVariableSpec {
        name: "CUBEJS_SCHEDULED_REFRESH_DEFAULT",
        required: false,
        description: "Scheduled refresh default flag",
        check: Some(valid_flag),
    },
];

const DATABASE_PARAMETERS: [&str; 5] = [
    "CUBEJS_DB_HOST",
    "CUBEJS_DB_PORT",
    "CUBEJS_DB_NAME",
    "CUBEJS_DB_USER",
    "CUBEJS_DB_PASS",
];

/// Which checks [`ConfigurationValidator::validate_configuration`] runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigurationValidationOptions {
    pub validate_environment: bool,
    pub validate_jwt: bool,
    pub validate_database: bool,
    pub validate_schema_directory: bool,
}

impl Default for ConfigurationValidationOptions {
    fn default() -> Self {
        Self {
            validate_environment: true,
            validate_jwt: true,
            validate_database: true,
            validate_schema_directory: true,
        }
    }
}

/// Outcome of the environment table check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentValidationResult {
    pub is_valid: bool,
    pub missing_required: Vec<String>,
    pub invalid_values: Vec<String>,
    pub errors: Vec<String>,
}

/// Outcome of the sign-and-verify round trip
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtValidationResult {
    pub is_valid: bool,
    pub can_generate: bool,
    pub can_verify: bool,
    pub errors: Vec<String>,
}

/// Outcome of the database parameter check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseParameterValidationResult {
    pub is_valid: bool,
    /// Whether a connection probe was attempted
    pub probed: bool,
    pub can_connect: bool,
    pub parameters_valid: bool,
    pub errors: Vec<String>,
}

/// Outcome of the definition directory check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDirectoryValidationResult {
    pub is_valid: bool,
    pub accessible: bool,
    pub path: String,
    pub definition_count: usize,
    pub errors: Vec<String>,
}

/// All configuration checks with an overall verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationReport {
    pub timestamp: DateTime<Utc>,
    pub overall_status: HealthStatus,
    pub environment: EnvironmentValidationResult,
    pub jwt: JwtValidationResult,
    pub database: DatabaseParameterValidationResult,
    pub schema_directory: SchemaDirectoryValidationResult,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TestClaims {
    #[serde(rename = "tenantId")]
    tenant_id: String,
    segments: Vec<String>,
    iat: i64,
    exp: i64,
}

/// Validates the deployment configuration of a CubeJS instance.
///
/// # Example
/// ```rust
/// use cubecheck_core::config::{ConfigurationValidator, Environment};
///
/// let env = Environment::from_pairs([("CUBEJS_API_SECRET", "too-short")]);
/// let validator = ConfigurationValidator::new(env, "/nonexistent");
/// let jwt = validator.validate_jwt_functionality();
/// assert!(!jwt.is_valid);
/// assert!(jwt.errors[0].contains("at least 32 characters"));
/// ```
pub struct ConfigurationValidator {
    env: Environment,
    repository: CubeRepository,
    connector: Option<Arc<dyn Connector>>,
}

impl std::fmt::Debug for ConfigurationValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationValidator")
            .field("env", &self.env)
            .field("repository", &self.repository)
            .field("probes_database", &self.connector.is_some())
            .finish()
    }
}

impl ConfigurationValidator {
    /// Creates a validator over an environment snapshot and a definition
    /// directory. The database is not probed unless a connector is added.
    pub fn new(env: Environment, schema_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            env,
            repository: CubeRepository::new(schema_dir),
            connector: None,
        }
    }

    /// Builder method to probe the database through `connector`.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Runs the selected checks and merges their errors.
    pub async fn validate_configuration(
        &self,
        options: &ConfigurationValidationOptions,
    ) -> ConfigValidationResult {
        let mut errors = Vec::new();
        let mut checked_items = Vec::new();

        if options.validate_environment {
            let result = self.validate_environment_variables();
            checked_items.push("Environment Variables".to_string());
            errors.extend(result.errors);
        }

        if options.validate_jwt {
            let result = self.validate_jwt_functionality();
            checked_items.push("JWT Token Functionality".to_string());
            errors.extend(result.errors);
        }

        if options.validate_database {
            let result = self.validate_database_parameters().await;
            checked_items.push("Database Connection Parameters".to_string());
            errors.extend(result.errors);
        }

        if options.validate_schema_directory {
            let result = self.validate_schema_directory();
            checked_items.push("Schema Directory".to_string());
            errors.extend(result.errors);
        }

        let result = ConfigValidationResult::from_parts(errors, Vec::new(), checked_items);
        info!(
            is_valid = result.is_valid,
            error_count = result.errors.len(),
            "Configuration validation completed"
        );
        result
    }

    /// Checks every known `CUBEJS_*` variable.
    ///
    /// Values are never echoed in error messages.
    pub fn validate_environment_variables(&self) -> EnvironmentValidationResult {
        let mut result = EnvironmentValidationResult::default();

        for spec in &ENVIRONMENT_VARIABLES {
            let value = self.env.non_empty(spec.name);

            let Some(value) = value else {
                if spec.required {
                    result.missing_required.push(spec.name.to_string());
                    result.errors.push(format!(
                        "Required environment variable {} is missing or empty. {}",
                        spec.name, spec.description
                    ));
                }
                continue;
            };

            if let Some(check) = spec.check
                && !check(value)
            {
                result.invalid_values.push(spec.name.to_string());
                result.errors.push(format!(
                    "Environment variable {} has invalid value. {}",
                    spec.name, spec.description
                ));
            }
        }

        result.is_valid = result.errors.is_empty();
        result
    }

    /// Signs an HS256 test token with `CUBEJS_API_SECRET` and verifies it.
    pub fn validate_jwt_functionality(&self) -> JwtValidationResult {
        let mut result = JwtValidationResult::default();

        let Some(secret) = self.env.get("CUBEJS_API_SECRET").filter(|s| !s.is_empty()) else {
            result
                .errors
                .push("CUBEJS_API_SECRET environment variable is required for JWT functionality".to_string());
            return result;
        };

        if !valid_api_secret(secret) {
            result.errors.push(format!(
                "CUBEJS_API_SECRET should be at least {} characters long for security",
                MIN_API_SECRET_LENGTH
            ));
        }

        let issued_at = Utc::now().timestamp();
        let claims = TestClaims {
            tenant_id: "test-tenant".to_string(),
            segments: vec!["test-segment".to_string()],
            iat: issued_at,
            exp: issued_at.saturating_add(TEST_TOKEN_LIFETIME_SECS),
        };

        let token = match jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        ) {
            Ok(token) => {
                result.can_generate = true;
                token
            }
            Err(e) => {
                result
                    .errors
                    .push(format!("JWT token generation failed: {}", e));
                return result;
            }
        };

        match jsonwebtoken::decode::<TestClaims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        ) {
            Ok(decoded) if decoded.claims.tenant_id == claims.tenant_id => {
                result.can_verify = true;
            }
            Ok(_) => result.errors.push(
                "JWT token verification succeeded but payload structure is invalid".to_string(),
            ),
            Err(e) => result
                .errors
                .push(format!("JWT token verification failed: {}", e)),
        }

        result.is_valid = result.errors.is_empty() && result.can_generate && result.can_verify;
        debug!(
            can_generate = result.can_generate,
            can_verify = result.can_verify,
            "JWT validation completed"
        );
        result
    }

    /// Checks the `CUBEJS_DB_*` parameters and, when a connector is
    /// configured and the parameters are valid, opens one connection and
    /// reads the server version.
    pub async fn validate_database_parameters(&self) -> DatabaseParameterValidationResult {
        let mut result = DatabaseParameterValidationResult {
            parameters_valid: true,
            ..Default::default()
        };

        let missing: Vec<&str> = DATABASE_PARAMETERS
            .iter()
            .copied()
            .filter(|name| !self.env.is_set(name))
            .collect();
        if !missing.is_empty() {
            result.parameters_valid = false;
            result.errors.push(format!(
                "Missing required database parameters: {}",
                missing.join(", ")
            ));
            return result;
        }

        if !self.env.non_empty("CUBEJS_DB_PORT").is_some_and(valid_port) {
            result.parameters_valid = false;
            result
                .errors
                .push("Invalid database port. Must be a number between 1 and 65535".to_string());
        }

        let database_type = self.env.non_empty("CUBEJS_DB_TYPE").unwrap_or_default();
        if !valid_database_type(database_type) {
            result.parameters_valid = false;
            result.errors.push(format!(
                "Invalid database type: {}. Must be 'postgres'",
                if database_type.is_empty() { "<unset>" } else { database_type }
            ));
        }

        if result.parameters_valid
            && let Some(connector) = &self.connector
        {
            result.probed = true;
            match connector.connect(1).await {
                Ok(catalog) => {
                    match catalog.server_version().await {
                        Ok(version) => {
                            debug!(version = %version, "Database probe succeeded");
                            result.can_connect = true;
                        }
                        Err(e) => result.errors.push(format!(
                            "Database connection test failed: {}",
                            e.detailed_message()
                        )),
                    }
                    catalog.close().await;
                }
                Err(e) => {
                    warn!(error = %e, "Database probe failed");
                    result.errors.push(format!(
                        "Database connection test failed: {}",
                        e.detailed_message()
                    ));
                }
            }
        }

        result.is_valid = result.errors.is_empty()
            && result.parameters_valid
            && (result.can_connect || !result.probed);
        result
    }

    /// Checks that the definition directory exists and holds definitions.
    pub fn validate_schema_directory(&self) -> SchemaDirectoryValidationResult {
        let root = self.repository.root();
        let mut result = SchemaDirectoryValidationResult {
            path: root.display().to_string(),
            ..Default::default()
        };

        match std::fs::metadata(root) {
            Ok(metadata) if metadata.is_dir() => {
                result.accessible = true;
                match self.repository.list_cubes() {
                    Ok(cubes) if cubes.is_empty() => result.errors.push(format!(
                        "No cube definition files (.json) found in {}",
                        result.path
                    )),
                    Ok(cubes) => result.definition_count = cubes.len(),
                    Err(e) => result
                        .errors
                        .push(format!("Cannot read schema directory: {}", e.detailed_message())),
                }
            }
            Ok(_) => result.errors.push(format!(
                "Schema directory {} exists but is not a directory",
                result.path
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => result
                .errors
                .push(format!("Schema directory {} does not exist", result.path)),
            Err(e) => result.errors.push(format!(
                "Cannot access schema directory {}: {}",
                result.path, e
            )),
        }

        result.is_valid = result.errors.is_empty() && result.accessible;
        result
    }

    /// Runs every check and derives an overall status.
    ///
    /// Missing required variables, a failed database probe or an
    /// inaccessible definition directory are critical. A broken JWT setup,
    /// invalid database parameters or invalid variable values are degraded.
    pub async fn generate_configuration_report(&self) -> ConfigurationReport {
        let environment = self.validate_environment_variables();
        let jwt = self.validate_jwt_functionality();
        let database = self.validate_database_parameters().await;
        let schema_directory = self.validate_schema_directory();

        let mut recommendations = Vec::new();
        if !environment.is_valid {
            recommendations
                .push("Fix missing or invalid environment variables before starting CubeJS".to_string());
        }
        if !jwt.is_valid {
            recommendations
                .push("Ensure CUBEJS_API_SECRET is properly configured for JWT functionality".to_string());
        }
        if !database.is_valid {
            recommendations.push(
                "Verify database connection parameters and PostgreSQL service availability"
                    .to_string(),
            );
        }
        if !schema_directory.is_valid {
            recommendations.push(
                "Check that the cube definition directory exists and contains definition files"
                    .to_string(),
            );
        }

        let critical = !environment.missing_required.is_empty()
            || (database.probed && !database.can_connect)
            || !schema_directory.accessible;
        let degraded =
            !jwt.is_valid || !database.parameters_valid || !environment.invalid_values.is_empty();

        let overall_status = if critical {
            HealthStatus::Critical
        } else if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ConfigurationReport {
            timestamp: Utc::now(),
            overall_status,
            environment,
            jwt,
            database,
            schema_directory,
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, MemoryConnector};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn complete_env() -> Environment {
        Environment::from_pairs([
            ("CUBEJS_DB_HOST", "localhost"),
            ("CUBEJS_DB_PORT", "5432"),
            ("CUBEJS_DB_NAME", "devspace"),
            ("CUBEJS_DB_USER", "devspace"),
            ("CUBEJS_DB_PASS", "devspace"),
            ("CUBEJS_DB_TYPE", "postgres"),
            ("CUBEJS_API_SECRET", SECRET),
            ("CUBEJS_DEV_MODE", "true"),
        ])
    }

    fn schema_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Members.json"), "{}").unwrap();
        dir
    }

    #[test]
    fn test_environment_complete() {
        let validator = ConfigurationValidator::new(complete_env(), "/unused");
        let result = validator.validate_environment_variables();
        assert!(result.is_valid, "{:?}", result.errors);
    }

    #[test]
    fn test_environment_missing_and_invalid() {
        let env = Environment::from_pairs([
            ("CUBEJS_DB_HOST", "localhost"),
            ("CUBEJS_DB_PORT", "99999"),
            ("CUBEJS_DB_TYPE", "mysql"),
            ("CUBEJS_API_SECRET", "short-secret-value"),
            ("CUBEJS_DEV_MODE", "yes"),
        ]);
        let result = ConfigurationValidator::new(env, "/unused").validate_environment_variables();

        assert!(!result.is_valid);
        assert_eq!(
            result.missing_required,
            vec!["CUBEJS_DB_NAME", "CUBEJS_DB_USER", "CUBEJS_DB_PASS"]
        );
        assert_eq!(
            result.invalid_values,
            vec![
                "CUBEJS_DB_PORT",
                "CUBEJS_DB_TYPE",
                "CUBEJS_API_SECRET",
                "CUBEJS_DEV_MODE"
            ]
        );
        assert!(result.errors.iter().all(|e| !e.contains("short-secret-value")));
        assert!(result.errors.contains(
            &"Required environment variable CUBEJS_DB_NAME is missing or empty. Database name for CubeJS connection"
                .to_string()
        ));
    }

    #[test]
    fn test_jwt_round_trip() {
        let validator = ConfigurationValidator::new(complete_env(), "/unused");
        let result = validator.validate_jwt_functionality();
        assert!(result.is_valid, "{:?}", result.errors);
        assert!(result.can_generate);
        assert!(result.can_verify);
    }

    #[test]
    fn test_jwt_short_secret_still_round_trips() {
        let env = Environment::from_pairs([("CUBEJS_API_SECRET", "abc")]);
        let result = ConfigurationValidator::new(env, "/unused").validate_jwt_functionality();
        assert!(!result.is_valid);
        assert!(result.can_generate);
        assert!(result.can_verify);
        assert_eq!(
            result.errors,
            vec!["CUBEJS_API_SECRET should be at least 32 characters long for security"]
        );
    }

    #[test]
    fn test_jwt_missing_secret() {
        let result = ConfigurationValidator::new(Environment::default(), "/unused")
            .validate_jwt_functionality();
        assert!(!result.is_valid);
        assert!(!result.can_generate);
        assert!(result.errors[0].contains("required for JWT functionality"));
    }

    #[tokio::test]
    async fn test_database_parameters_missing() {
        let env = Environment::from_pairs([("CUBEJS_DB_HOST", "localhost")]);
        let result = ConfigurationValidator::new(env, "/unused")
            .validate_database_parameters()
            .await;
        assert!(!result.is_valid);
        assert!(!result.parameters_valid);
        assert_eq!(
            result.errors,
            vec!["Missing required database parameters: CUBEJS_DB_PORT, CUBEJS_DB_NAME, CUBEJS_DB_USER, CUBEJS_DB_PASS"]
        );
    }

    #[tokio::test]
    async fn test_database_probe() {
        let catalog = Arc::new(MemoryCatalog::new());
        let connector = Arc::new(MemoryConnector::new(Arc::clone(&catalog)));
        let validator = ConfigurationValidator::new(complete_env(), "/unused")
            .with_connector(connector.clone());

        let result = validator.validate_database_parameters().await;
        assert!(result.is_valid);
        assert!(result.probed);
        assert!(result.can_connect);

        catalog.set_unreachable(true);
        let result = validator.validate_database_parameters().await;
        assert!(!result.is_valid);
        assert!(!result.can_connect);
        assert!(result.errors[0].starts_with("Database connection test failed"));
        assert!(result.errors[0].contains("ECONNREFUSED"));
    }

    #[test]
    fn test_schema_directory_checks() {
        let dir = schema_dir();
        let ok = ConfigurationValidator::new(Environment::default(), dir.path())
            .validate_schema_directory();
        assert!(ok.is_valid);
        assert_eq!(ok.definition_count, 1);

        let empty = tempfile::tempdir().unwrap();
        let result = ConfigurationValidator::new(Environment::default(), empty.path())
            .validate_schema_directory();
        assert!(result.accessible);
        assert!(!result.is_valid);
        assert!(result.errors[0].starts_with("No cube definition files"));

        let missing = ConfigurationValidator::new(Environment::default(), "/nonexistent/cubes")
            .validate_schema_directory();
        assert!(!missing.accessible);
        assert!(missing.errors[0].ends_with("does not exist"));
    }

    #[tokio::test]
    async fn test_validate_configuration_merges_checks() {
        let dir = schema_dir();
        let validator = ConfigurationValidator::new(complete_env(), dir.path());
        let result = validator
            .validate_configuration(&ConfigurationValidationOptions::default())
            .await;
        assert!(result.is_valid, "{:?}", result.errors);
        assert_eq!(result.checked_items.len(), 4);

        let options = ConfigurationValidationOptions {
            validate_jwt: false,
            validate_database: false,
            ..Default::default()
        };
        let result = ConfigurationValidator::new(Environment::default(), dir.path())
            .validate_configuration(&options)
            .await;
        assert!(!result.is_valid);
        assert_eq!(
            result.checked_items,
            vec!["Environment Variables", "Schema Directory"]
        );
    }

    #[tokio::test]
    async fn test_configuration_report_status() {
        let dir = schema_dir();
        let report = ConfigurationValidator::new(complete_env(), dir.path())
            .generate_configuration_report()
            .await;
        assert_eq!(report.overall_status, HealthStatus::Healthy);
        assert!(report.recommendations.is_empty());

        let mut pairs: Vec<(String, String)> = vec![];
        for name in DATABASE_PARAMETERS {
            pairs.push((name.to_string(), "5432".to_string()));
        }
        pairs.push(("CUBEJS_DB_TYPE".to_string(), "postgres".to_string()));
        pairs.push(("CUBEJS_API_SECRET".to_string(), "short".to_string()));
        let report = ConfigurationValidator::new(Environment::from_pairs(pairs), dir.path())
            .generate_configuration_report()
            .await;
        assert_eq!(report.overall_status, HealthStatus::Degraded);

        let report = ConfigurationValidator::new(Environment::default(), dir.path())
            .generate_configuration_report()
            .await;
        assert_eq!(report.overall_status, HealthStatus::Critical);
        assert!(!report.recommendations.is_empty());
    }
}
