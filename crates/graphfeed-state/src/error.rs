//! Error types for graphfeed-state

use thiserror::Error;

/// Errors raised by a document-store driver.
///
/// Payloads are rendered strings so the error stays `Clone` and can be
/// fanned out to every consumer of a changefeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query or write error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Insert of a document whose id already exists
    #[error("Duplicate primary key `{id}` in table `{table}`")]
    Conflict { table: String, id: String },

    /// Changefeed failed or fell behind
    #[error("Changefeed failed: {0}")]
    Changefeed(String),

    /// Table or field identifier that cannot be used in a native query
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
