//! Catalog and Codec Error Types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Stream already exists: {0}")]
    DuplicateStream(String),

    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Schema mismatch at {path}: expected {expected}, found {found}")]
    SchemaMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CatalogError {
    pub(crate) fn mismatch(path: &str, expected: impl ToString, found: impl ToString) -> Self {
        CatalogError::SchemaMismatch {
            path: if path.is_empty() {
                "<root>".to_string()
            } else {
                path.to_string()
            },
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Errors caused by one payload rather than by the catalog itself
    pub fn is_record_error(&self) -> bool {
        matches!(
            self,
            CatalogError::SchemaMismatch { .. } | CatalogError::MalformedRecord(_)
        )
    }
}
