//! Error types for the change tailer and reactive query runner.
//! Provides structured error handling using thiserror.

use thiserror::Error;

/// Main error type for this crate.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Configuration rejected at construction time.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The wal2json decoder plugin is not installed (catalog error 58P01).
    #[error("decoder plugin not installed: {message}")]
    DecoderMissing { message: String },

    /// A database call against the pool/session failed.
    #[error("database error: {message}")]
    Database {
        message: String,
        /// Postgres SQLSTATE, when the originating error carried one.
        code: Option<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The decoded payload did not match the expected wal2json shape.
    #[error("decode error: {message}")]
    Decode { message: String, context: Option<String> },

    /// The user-supplied `query()` thunk rejected.
    #[error("query rejected: {message}")]
    QueryFailed {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A handler predicate rejected (treated identically to a query rejection
    /// for the owning runner).
    #[error("handler rejected: {message}")]
    HandlerFailed {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// JSON (de)serialization failure.
    #[error("json error")]
    Json(#[from] serde_json::Error),

    /// Task execution errors for async operations.
    #[error("task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    /// Generic error for compatibility with caller-defined failures.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for convenience.
pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn decoder_missing<S: Into<String>>(message: S) -> Self {
        Self::DecoderMissing { message: message.into() }
    }

    pub fn database<S: Into<String>>(message: S) -> Self {
        Self::Database { message: message.into(), code: None, source: None }
    }

    pub fn database_with_code<S: Into<String>, C: Into<String>>(message: S, code: C) -> Self {
        Self::Database { message: message.into(), code: Some(code.into()), source: None }
    }

    /// The SQLSTATE carried by this error, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            Self::DecoderMissing { .. } => Some(crate::db::SQLSTATE_DECODER_MISSING),
            _ => None,
        }
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode { message: message.into(), context: None }
    }

    pub fn decode_with_context<S: Into<String>, C: Into<String>>(message: S, context: C) -> Self {
        Self::Decode { message: message.into(), context: Some(context.into()) }
    }

    pub fn query_failed<S: Into<String>>(message: S) -> Self {
        Self::QueryFailed { message: message.into(), source: None }
    }

    pub fn handler_failed<S: Into<String>>(message: S) -> Self {
        Self::HandlerFailed { message: message.into(), source: None }
    }
}
