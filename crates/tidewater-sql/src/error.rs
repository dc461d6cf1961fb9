//! Query error types

use thiserror::Error;
use tidewater_catalog::CatalogError;

/// Errors raised while compiling or running continuous queries
#[derive(Debug, Error)]
pub enum SqlError {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Evaluation error: {0}")]
    EvaluationError(String),

    #[error("Arity error: {function} expects {expected} argument(s), got {actual}")]
    ArityError {
        function: String,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Timestamp parse error: cannot parse '{value}' with pattern '{pattern}'")]
    TimestampParseError { value: String, pattern: String },

    #[error("Conflicting schema for target stream {target}: {reason}")]
    DuplicateQueryTarget { target: String, reason: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Query not found: {0}")]
    QueryNotFound(String),

    #[error("Stream {stream} is used by query {query_id}")]
    StreamInUse { stream: String, query_id: String },

    #[error("Maximum concurrent queries ({0}) reached")]
    MaxQueriesReached(usize),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Log error: {0}")]
    Log(#[from] tidewater_core::Error),
}

impl SqlError {
    /// Failures scoped to a single record; the query drops the record and moves on
    pub fn is_record_error(&self) -> bool {
        match self {
            SqlError::EvaluationError(_) | SqlError::TimestampParseError { .. } => true,
            SqlError::Catalog(e) => e.is_record_error(),
            _ => false,
        }
    }

    /// Every label [`SqlError::reason`] returns
    pub const REASONS: &[&str] = &[
        "evaluation",
        "timestamp",
        "malformed",
        "schema_mismatch",
        "log",
        "other",
    ];

    /// Short label used for the failure-reason metric
    pub fn reason(&self) -> &'static str {
        match self {
            SqlError::EvaluationError(_) => "evaluation",
            SqlError::TimestampParseError { .. } => "timestamp",
            SqlError::Catalog(CatalogError::MalformedRecord(_)) => "malformed",
            SqlError::Catalog(CatalogError::SchemaMismatch { .. }) => "schema_mismatch",
            SqlError::Log(_) => "log",
            _ => "other",
        }
    }
}
