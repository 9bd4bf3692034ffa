//! Run configuration types.
//!
//! A [`RunConfig`] is the validated product of the external interface
//! layer: connection parameters, seed selection, traversal mode, scoping
//! filters, output sink, and the various behavior flags. Environment
//! variables provide defaults; command-line flags override them.

use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::schema::TableRef;

/// Source database connection parameters.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password. Never serialized, never printed.
    #[serde(skip_serializing, default)]
    pub password: String,

    /// Default schema for unqualified table names (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// TLS mode: disable, require, or verify-full (default: disable).
    #[serde(default = "default_disable")]
    pub ssl_mode: String,

    /// Per-session statement timeout in seconds (default: 300). A timed-out
    /// query is fatal to the run.
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

impl ConnectionConfig {
    /// Build connection defaults from the environment (`DB_HOST`, `DB_PORT`,
    /// `DB_NAME`, `DB_USER`, `DB_SCHEMA`, `DB_SSL_MODE`, `PGPASSWORD`).
    pub fn from_env() -> Self {
        Self {
            host: env_or("DB_HOST", "localhost"),
            port: std::env::var("DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_pg_port),
            database: env_or("DB_NAME", ""),
            user: env_or("DB_USER", ""),
            password: env_or("PGPASSWORD", ""),
            schema: env_or("DB_SCHEMA", "public"),
            ssl_mode: env_or("DB_SSL_MODE", "disable"),
            statement_timeout_secs: std::env::var("DB_STATEMENT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_statement_timeout),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("statement_timeout_secs", &self.statement_timeout_secs)
            .finish()
    }
}

/// How the traversal crosses self-referencing foreign keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalMode {
    /// Self-referencing edges are only followed out of the seeds: the user
    /// gets "this record and its dependencies", not its whole hierarchy.
    #[default]
    Strict,

    /// All edges are followed uniformly.
    Wide,
}

/// Seed selection: explicit primary keys, or every row of a table inside a
/// time window.
#[derive(Debug, Clone)]
pub enum SeedSpec {
    Pks { table: String, pks: Vec<String> },
    Timeframe { table: String, filter: TimeframeFilter },
}

impl SeedSpec {
    pub fn table(&self) -> &str {
        match self {
            SeedSpec::Pks { table, .. } => table,
            SeedSpec::Timeframe { table, .. } => table,
        }
    }
}

/// A scoping predicate: rows of `table` are only admitted when `column`
/// falls inside `[start, end]` (inclusive).
#[derive(Debug, Clone, PartialEq)]
pub struct TimeframeFilter {
    pub table: TableRef,
    pub column: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl fmt::Display for TimeframeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}: {} to {}",
            self.table, self.column, self.start, self.end
        )
    }
}

/// Read-only session posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadOnlyPosture {
    /// Warn and proceed when the session cannot be made read-only.
    #[default]
    Advisory,

    /// Fail the run when the session cannot be made read-only.
    Require,

    /// Proceed silently on a writable connection.
    AllowWrite,
}

/// Schema cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_hours: i64,
    /// Explicit cache file path; defaults to the user cache directory.
    pub path: Option<PathBuf>,
}

impl CacheConfig {
    /// Build cache defaults from `CACHE_ENABLED` and `CACHE_TTL_HOURS`.
    pub fn from_env() -> Self {
        let enabled = std::env::var("CACHE_ENABLED")
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(true);
        let ttl_hours = std::env::var("CACHE_TTL_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(24);
        Self {
            enabled,
            ttl_hours,
            path: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_hours: 24,
            path: None,
        }
    }
}

/// Where the replay stream goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
}

/// The validated configuration for one dump run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub connection: ConnectionConfig,
    pub seed: SeedSpec,
    pub mode: TraversalMode,
    /// Scoping filters for related tables.
    pub filters: Vec<TimeframeFilter>,
    /// Keep original primary keys instead of remapping auto-generated ones.
    pub keep_pks: bool,
    /// Emit a DDL prelude before the data section.
    pub create_schema: bool,
    /// Optional traversal depth bound.
    pub max_depth: Option<u32>,
    /// Promote dangling references from warnings to fatal errors.
    pub strict_references: bool,
    pub read_only: ReadOnlyPosture,
    pub cache: CacheConfig,
    pub output: OutputTarget,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_disable() -> String {
    "disable".to_string()
}

fn default_statement_timeout() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionConfig {
        ConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            database: "app".to_string(),
            user: "reader".to_string(),
            password: "secret_password".to_string(),
            schema: "public".to_string(),
            ssl_mode: "disable".to_string(),
            statement_timeout_secs: 300,
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let debug = format!("{:?}", conn());
        assert!(!debug.contains("secret_password"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_password_not_serialized() {
        let json = serde_json::to_string(&conn()).unwrap();
        assert!(!json.contains("secret_password"), "serialized: {}", json);
    }

    #[test]
    fn test_traversal_mode_default_is_strict() {
        assert_eq!(TraversalMode::default(), TraversalMode::Strict);
    }

    #[test]
    fn test_seed_spec_table() {
        let seed = SeedSpec::Pks {
            table: "users".to_string(),
            pks: vec!["3".to_string()],
        };
        assert_eq!(seed.table(), "users");
    }
}
