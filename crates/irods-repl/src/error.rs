//! Error types for the replication engine.

use thiserror::Error;

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for catalog connectivity or authorization errors.
pub const EXIT_CATALOG_ERROR: u8 = 2;
/// Exit code for connection pool errors.
pub const EXIT_POOL_ERROR: u8 = 3;
/// Exit code when the deadline had already passed before the run started.
pub const EXIT_DEADLINE_PASSED: u8 = 4;
/// Exit code when the circuit breaker halted dispatch.
pub const EXIT_CIRCUIT_OPEN: u8 = 5;
/// Exit code for transfer executor errors that abort the run.
pub const EXIT_EXECUTOR_ERROR: u8 = 6;
/// Exit code for IO errors (missing config file, etc.).
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code for a run interrupted by SIGINT/SIGTERM.
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for replication runs.
#[derive(Error, Debug)]
pub enum ReplError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog connection, query or authorization error
    #[error("Catalog error: {0}")]
    Catalog(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// The configured stop time was already in the past when the run started
    #[error("Deadline {0} has already passed - nothing to do")]
    DeadlinePassed(String),

    /// Dispatch halted after repeated connection-level failures
    #[error("Circuit breaker open after {failures} consecutive connection failures ({completed}/{attempted} objects completed)")]
    CircuitOpen {
        failures: u32,
        attempted: u64,
        completed: u64,
    },

    /// The transfer executor could not be started or produced an unusable result
    #[error("Executor error: {0}")]
    Executor(String),

    /// IO error (file operations, process spawning)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Run cancelled")]
    Cancelled,
}

impl ReplError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        ReplError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ReplError::Config(_) | ReplError::Yaml(_) | ReplError::Json(_) => EXIT_CONFIG_ERROR,
            ReplError::Catalog(_) => EXIT_CATALOG_ERROR,
            ReplError::Pool { .. } => EXIT_POOL_ERROR,
            ReplError::DeadlinePassed(_) => EXIT_DEADLINE_PASSED,
            ReplError::CircuitOpen { .. } => EXIT_CIRCUIT_OPEN,
            ReplError::Executor(_) => EXIT_EXECUTOR_ERROR,
            ReplError::Io(_) => EXIT_IO_ERROR,
            ReplError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

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

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplError>;
