//! Error types for the job pool.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Enqueue error: {0}")]
    Enqueue(#[from] EnqueueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors, raised while setting up a pool (never at runtime).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Task {name} registered twice")]
    DuplicateTask { name: String },

    #[error("Task name must not be empty")]
    EmptyTaskName,

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid periodic blueprint for task {name}: {reason}")]
    InvalidBlueprint { name: String, reason: String },

    #[error("Pool has no tasks")]
    NoTasks,
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Payload encoding and decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors returned by `Queue` when inserting a job.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Job name must not be empty")]
    EmptyName,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Delay {0:?} is out of range")]
    InvalidDelay(Duration),
}

/// Error reported by a job handler.
///
/// The variant decides what happens to the job: `Retry` consumes one attempt
/// and reschedules with backoff, `Cancel` ends the job immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Retry(String),

    #[error("{0}")]
    Cancel(String),
}

impl HandlerError {
    /// A failure that should be retried.
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry(reason.into())
    }

    /// A failure that should cancel the job without further attempts.
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::Cancel(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retry(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Retry(r) | Self::Cancel(r) => r,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        Self::Retry(format!("{e:#}"))
    }
}

impl From<CodecError> for HandlerError {
    fn from(e: CodecError) -> Self {
        Self::Cancel(e.to_string())
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
