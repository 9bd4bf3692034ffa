//! Error types for the subset extraction library.

use thiserror::Error;

/// Main error type for dump operations.
#[derive(Error, Debug)]
pub enum DumpError {
    /// Invalid flag combination, unknown table in a seed, malformed value.
    #[error("Usage error: {0}")]
    Usage(String),

    /// Cannot reach or authenticate with the source database.
    #[error("Connection error: {message}\n  Context: {context}")]
    Connection { message: String, context: String },

    /// A read-only session was required but could not be established.
    #[error("Read-only session required but the connection is writable")]
    ReadOnlyEnforcement,

    /// Catalog query failed; the schema graph could not be built.
    #[error("Introspection failed: {0}")]
    Introspection(String),

    /// A referenced table does not exist in the source catalog.
    #[error("Table not found: {0}")]
    SchemaNotFound(String),

    /// A timeframe filter names an unknown column or a non-temporal one.
    #[error("Invalid timeframe filter: {0}")]
    InvalidFilter(String),

    /// Data query failed mid-traversal.
    #[error("Fetch failed for {table}: {message}")]
    Fetch { table: String, message: String },

    /// A non-null foreign key points at a row the source no longer has.
    #[error("Dangling reference to {target} (referenced by {referenced_by})")]
    DanglingReference { referenced_by: String, target: String },

    /// Primary-key remapping was requested for a record inside a dependency
    /// cycle; remapping requires an acyclic record graph.
    #[error("Cannot remap primary keys: {0} participates in a dependency cycle")]
    CycleDetected(String),

    /// Output sink write failure.
    #[error("Output error: {0}")]
    Output(String),

    /// User-initiated abort.
    #[error("Cancelled")]
    Cancelled,

    /// Underlying PostgreSQL driver error.
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Schema cache store error.
    #[error("Schema cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    /// IO error (file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DumpError {
    /// Create a Connection error with context about where it occurred.
    pub fn connection(message: impl Into<String>, context: impl Into<String>) -> Self {
        DumpError::Connection {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Fetch error for a specific table.
    pub fn fetch(table: impl Into<String>, message: impl Into<String>) -> Self {
        DumpError::Fetch {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Map this error to a process exit code.
    ///
    /// 0 is success, 1 a runtime failure, 2 a usage error, 3 an
    /// integrity/constraint failure, 4 a cancelled run.
    pub fn exit_code(&self) -> u8 {
        match self {
            DumpError::Usage(_) | DumpError::InvalidFilter(_) => 2,
            DumpError::DanglingReference { .. }
            | DumpError::CycleDetected(_)
            | DumpError::ReadOnlyEnforcement => 3,
            DumpError::Cancelled => 4,
            _ => 1,
        }
    }

    /// Format error with full details including the error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for dump operations.
pub type Result<T> = std::result::Result<T, DumpError>;
