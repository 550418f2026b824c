//! Diagnostic engine for CubeJS semantic layers backed by PostgreSQL.
//!
//! This crate checks a CubeJS deployment end to end: configuration,
//! database reachability, cube definitions against the live catalog, schema
//! drift, connection pool health and dashboard query shapes. It also turns
//! runtime query errors into classified, user-facing responses.
//!
//! # Security Guarantees
//! - All database access is read-only catalog introspection
//! - Cube definitions are parsed as JSON data, never evaluated
//! - No credentials stored or logged in any report or error
//! - Filter values and user ids are redacted before errors are logged
//!
//! # Architecture
//! - `Catalog` and `Connector` traits abstract the database, with a
//!   PostgreSQL implementation and an in-memory one
//! - One shared `Registry` of known cubes, views and smoke-test queries
//! - Every probe runs through retry with backoff and a circuit breaker
//! - `DiagnosticEngine` composes the checkers into one report

pub mod catalog;
pub mod config;
pub mod connection_tester;
pub mod context;
pub mod corrector;
pub mod cube;
pub mod drift;
pub mod engine;
pub mod error;
pub mod error_handler;
pub mod logging;
pub mod models;
pub mod pool_monitor;
pub mod query;
pub mod registry;
pub mod retry;
pub mod schema_validator;

// Re-export commonly used types
pub use catalog::{Catalog, Connector, MemoryCatalog, MemoryConnector, MemoryRelation};
#[cfg(feature = "postgresql")]
pub use catalog::{PostgresCatalog, PostgresConnector};
pub use config::{ConfigurationValidator, DatabaseConfig, Environment};
pub use connection_tester::{ConnectionTestResult, ConnectionTester};
pub use context::DiagnosticContext;
pub use cube::{CubeDefinition, CubeRepository};
pub use drift::{SchemaDriftDetector, SchemaDriftReport};
pub use engine::{CatalogHandles, DiagnosticEngine, DiagnosticReport, EngineSettings};
pub use error::{DiagnosticError, Result};
pub use error_handler::{ErrorHandler, ErrorResponse};
pub use models::{HealthStatus, Severity};
pub use pool_monitor::ConnectionPoolMonitor;
pub use query::{CubeQuery, QueryValidator, SecurityContext};
pub use registry::Registry;
pub use retry::{CircuitBreaker, RetryOptions, retry_with_backoff};
pub use schema_validator::{CubeValidationResult, SchemaValidator};
