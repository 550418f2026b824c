//! Database connection settings for the diagnostic probes.

use super::Environment;
use crate::models::ConfigValidationResult;
use std::time::Duration;
use zeroize::Zeroizing;

/// Variables checked by the soft environment check in
/// [`DatabaseConfig::validate_parameters`].
pub(crate) const DATABASE_ENV_VARS: [&str; 5] = [
    "CUBEJS_DB_HOST",
    "CUBEJS_DB_PORT",
    "CUBEJS_DB_NAME",
    "CUBEJS_DB_USER",
    "CUBEJS_DB_PASS",
];

/// Connection settings for the target PostgreSQL database.
///
/// # Security
/// The password is zeroized on drop and excluded from `Debug` and `Display`.
///
/// # Example
/// ```rust
/// use cubecheck_core::config::DatabaseConfig;
///
/// let config = DatabaseConfig::new("db.internal")
///     .with_port(6432)
///     .with_database("analytics")
///     .with_user("cube")
///     .with_password("secret");
///
/// assert!(config.validate_parameters().is_valid);
/// assert!(!config.to_string().contains("secret"));
/// ```
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Database host address
    pub host: String,
    /// Port; kept wide so out-of-range input is reported rather than truncated
    pub port: u32,
    /// Database name
    pub database: String,
    /// Login role
    pub user: String,
    /// Login password
    pub password: Zeroizing<String>,
    /// Require TLS
    pub ssl: bool,
    /// Shared pool size
    pub pool_size: Option<u32>,
    /// Time allowed to acquire a connection
    pub connect_timeout: Duration,
    /// Idle connections are closed after this long
    pub idle_timeout: Duration,
    /// Server-side statement timeout applied to every session
    pub statement_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "devspace".to_string(),
            user: "devspace".to_string(),
            password: Zeroizing::new("devspace".to_string()),
            ssl: false,
            pool_size: Some(10),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            statement_timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("ssl", &self.ssl)
            .field("pool_size", &self.pool_size)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.database)
        // Intentionally omit user and never include credentials
    }
}

impl DatabaseConfig {
    /// Creates a config for `host` with the remaining defaults.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Reads `CUBEJS_DB_*` variables from a snapshot.
    ///
    /// Unset variables fall back to the local development defaults. A port
    /// or pool size that does not parse is kept as `0` so validation flags it.
    pub fn from_environment(env: &Environment) -> Self {
        let defaults = Self::default();
        Self {
            host: env.non_empty("CUBEJS_DB_HOST").map_or(defaults.host, str::to_string),
            port: env
                .non_empty("CUBEJS_DB_PORT")
                .map_or(defaults.port, |v| v.parse().unwrap_or(0)),
            database: env
                .non_empty("CUBEJS_DB_NAME")
                .map_or(defaults.database, str::to_string),
            user: env.non_empty("CUBEJS_DB_USER").map_or(defaults.user, str::to_string),
            password: env
                .get("CUBEJS_DB_PASS")
                .map_or(defaults.password, |v| Zeroizing::new(v.to_string())),
            ssl: env.flag("CUBEJS_DB_SSL").unwrap_or(false),
            pool_size: env
                .non_empty("CUBEJS_DB_POOL_SIZE")
                .map_or(defaults.pool_size, |v| Some(v.parse().unwrap_or(0))),
            ..defaults
        }
    }

    /// Builder method to set port.
    pub fn with_port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    /// Builder method to set database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Builder method to set user.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Builder method to set password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Zeroizing::new(password.into());
        self
    }

    /// Builder method to set the shared pool size.
    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = Some(pool_size);
        self
    }

    /// Pool size to use, clamped to the supported range.
    pub fn effective_pool_size(&self) -> u32 {
        self.pool_size.unwrap_or(10).clamp(1, 100)
    }

    /// Port as a socket port, if in range.
    pub fn socket_port(&self) -> Option<u16> {
        u16::try_from(self.port).ok().filter(|p| *p > 0)
    }

    /// Connection URL with the password masked, for logs and reports.
    pub fn redacted_url(&self) -> String {
        let mut url = match url::Url::parse("postgres://localhost") {
            Ok(url) => url,
            Err(_) => return "<redacted>".to_string(),
        };
        if url.set_host(Some(&self.host)).is_err() {
            return "<redacted>".to_string();
        }
        let _ = url.set_port(self.socket_port());
        let _ = url.set_username(&self.user);
        if !self.password.is_empty() {
            let _ = url.set_password(Some(self.password.as_str()));
        }
        url.set_path(&format!("/{}", self.database));
        crate::error::redact_database_url(url.as_str())
    }

    /// Presence and range checks on the connection parameters.
    ///
    /// Missing parameters are errors. An out-of-range pool size and unset
    /// `CUBEJS_DB_*` variables are warnings. Use
    /// [`validate_parameters_with`](Self::validate_parameters_with) to check
    /// a specific environment snapshot.
    pub fn validate_parameters(&self) -> ConfigValidationResult {
        self.validate_parameters_with(None)
    }

    /// Same as [`validate_parameters`](Self::validate_parameters), adding the
    /// soft environment check against `env` when given.
    pub fn validate_parameters_with(&self, env: Option<&Environment>) -> ConfigValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut checked_items = Vec::new();

        let mut required = |present: bool, item: &str, error: &str| {
            if present {
                checked_items.push(item.to_string());
            } else {
                errors.push(error.to_string());
            }
        };

        required(!self.host.trim().is_empty(), "Database host", "Database host is required");
        required(
            (1..=65535).contains(&self.port),
            "Database port",
            "Valid database port is required (1-65535)",
        );
        required(
            !self.database.trim().is_empty(),
            "Database name",
            "Database name is required",
        );
        required(!self.user.trim().is_empty(), "Database user", "Database user is required");
        required(
            !self.password.is_empty(),
            "Database password",
            "Database password is required",
        );

        match self.pool_size {
            Some(size) if !(1..=100).contains(&size) => {
                warnings.push("Pool size should be between 1 and 100".to_string());
            }
            Some(_) => checked_items.push("Connection pool size".to_string()),
            None => {}
        }

        if let Some(env) = env {
            for var in DATABASE_ENV_VARS {
                if env.is_set(var) {
                    checked_items.push(format!("Environment variable {}", var));
                } else {
                    warnings.push(format!("Environment variable {} is not set", var));
                }
            }
        }

        ConfigValidationResult::from_parts(errors, warnings, checked_items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_env() -> Environment {
        Environment::from_pairs([
            ("CUBEJS_DB_HOST", "db"),
            ("CUBEJS_DB_PORT", "6543"),
            ("CUBEJS_DB_NAME", "crowd"),
            ("CUBEJS_DB_USER", "cube"),
            ("CUBEJS_DB_PASS", "pw"),
            ("CUBEJS_DB_SSL", "true"),
            ("CUBEJS_DB_POOL_SIZE", "20"),
        ])
    }

    #[test]
    fn test_defaults_from_empty_environment() {
        let config = DatabaseConfig::from_environment(&Environment::default());
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.database, "devspace");
        assert_eq!(config.user, "devspace");
        assert_eq!(config.pool_size, Some(10));
        assert!(!config.ssl);
    }

    #[test]
    fn test_values_from_environment() {
        let config = DatabaseConfig::from_environment(&full_env());
        assert_eq!(config.host, "db");
        assert_eq!(config.port, 6543);
        assert_eq!(config.password.as_str(), "pw");
        assert!(config.ssl);
        assert_eq!(config.pool_size, Some(20));
    }

    #[test]
    fn test_unparseable_port_is_reported() {
        let env = Environment::from_pairs([("CUBEJS_DB_PORT", "abc")]);
        let result = DatabaseConfig::from_environment(&env).validate_parameters();
        assert!(!result.is_valid);
        assert!(
            result
                .errors
                .contains(&"Valid database port is required (1-65535)".to_string())
        );
    }

    #[test]
    fn test_missing_parameters_are_errors() {
        let config = DatabaseConfig {
            host: String::new(),
            database: String::new(),
            user: String::new(),
            password: Zeroizing::new(String::new()),
            port: 70000,
            ..Default::default()
        };
        let result = config.validate_parameters();
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 5);
        assert!(result.checked_items.contains(&"Connection pool size".to_string()));
    }

    #[test]
    fn test_pool_size_out_of_range_is_warning() {
        let result = DatabaseConfig::default()
            .with_pool_size(500)
            .validate_parameters();
        assert!(result.is_valid);
        assert_eq!(result.warnings, vec!["Pool size should be between 1 and 100"]);
    }

    #[test]
    fn test_unset_environment_variables_are_warnings() {
        let env = Environment::from_pairs([("CUBEJS_DB_HOST", "db")]);
        let result = DatabaseConfig::default().validate_parameters_with(Some(&env));
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 4);
        assert!(
            result
                .checked_items
                .contains(&"Environment variable CUBEJS_DB_HOST".to_string())
        );
        assert!(
            result
                .warnings
                .contains(&"Environment variable CUBEJS_DB_PASS is not set".to_string())
        );
    }

    #[test]
    fn test_display_and_url_hide_password() {
        let config = DatabaseConfig::from_environment(&full_env()).with_password("s3cr3t");
        assert_eq!(config.to_string(), "db:6543/crowd");
        assert!(!format!("{:?}", config).contains("s3cr3t"));

        let url = config.redacted_url();
        assert!(!url.contains("s3cr3t"));
        assert!(url.contains("cube:****@db:6543/crowd"));
    }

    #[test]
    fn test_effective_pool_size_clamped() {
        assert_eq!(DatabaseConfig::default().with_pool_size(0).effective_pool_size(), 1);
        assert_eq!(DatabaseConfig::default().with_pool_size(250).effective_pool_size(), 100);
    }
}
