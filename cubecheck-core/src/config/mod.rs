//! Configuration inputs for the diagnostic engine.
//!
//! Components never read process environment directly. An [`Environment`]
//! snapshot is captured once and handed to every consumer.

mod database;
mod validator;

pub use database::DatabaseConfig;
pub use validator::{
    ConfigurationReport, ConfigurationValidationOptions, ConfigurationValidator,
    DatabaseParameterValidationResult, EnvironmentValidationResult, JwtValidationResult,
    SchemaDirectoryValidationResult,
};

use std::collections::BTreeMap;

/// Immutable snapshot of environment variables.
///
/// # Security
/// `Debug` lists variable names only. Values such as `CUBEJS_DB_PASS` and
/// `CUBEJS_API_SECRET` are never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Environment {
    /// Captures the current process environment.
    ///
    /// Variables whose name or value is not valid Unicode are skipped.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        }
    }

    /// Builds a snapshot from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Raw value, possibly empty
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Value with surrounding whitespace trimmed, `None` when blank
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).map(str::trim).filter(|v| !v.is_empty())
    }

    /// Whether the variable is present with a non-blank value
    pub fn is_set(&self, name: &str) -> bool {
        self.non_empty(name).is_some()
    }

    /// Parses a `true`/`false` flag, case-insensitively
    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.non_empty(name)?.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_debug_hides_values() {
        let env = Environment::from_pairs([("CUBEJS_DB_PASS", "hunter2")]);
        let debug = format!("{:?}", env);
        assert!(debug.contains("CUBEJS_DB_PASS"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_environment_blank_values() {
        let env = Environment::from_pairs([("A", "  "), ("B", " x ")]);
        assert!(!env.is_set("A"));
        assert_eq!(env.non_empty("B"), Some("x"));
        assert_eq!(env.get("A"), Some("  "));
        assert!(!env.is_set("MISSING"));
    }

    #[test]
    fn test_environment_flag() {
        let env = Environment::from_pairs([("ON", "TRUE"), ("OFF", "false"), ("BAD", "yes")]);
        assert_eq!(env.flag("ON"), Some(true));
        assert_eq!(env.flag("OFF"), Some(false));
        assert_eq!(env.flag("BAD"), None);
    }

    #[test]
    fn test_environment_from_process() {
        temp_env::with_var("CUBECHECK_TEST_MARKER", Some("present"), || {
            let env = Environment::from_process();
            assert_eq!(env.get("CUBECHECK_TEST_MARKER"), Some("present"));
        });
    }
}
