//! Error taxonomy for the sync engine.
//!
//! Configuration errors (bad query shapes, unknown paths) and data errors
//! (missing schema entries, malformed documents) are raised synchronously;
//! driver errors are carried through unchanged as `SyncError::Storage`.

use graphfeed_state::StorageError;

/// Errors produced by the sync engine.
///
/// `Clone` so a single failure can be delivered to every consumer of a live
/// query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("unsupported query operator: {0}")]
    UnsupportedQueryOperator(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("unrecognized field path: {0}")]
    UnrecognizedFieldPath(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown relationship `{relationship}` on model `{model}`")]
    UnknownRelationship { model: String, relationship: String },

    #[error("malformed document for model `{model}`: {reason}")]
    MalformedDocument { model: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("unhandled change: {0}")]
    UnhandledChange(String),

    #[error("live query cancelled before it became ready")]
    Cancelled,

    #[error("live query closed")]
    Closed,
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(StorageError::from(err))
    }
}

/// Result type for sync engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::UnsupportedQuery("only oql and reql queries are supported".into());
        assert_eq!(
            err.to_string(),
            "unsupported query: only oql and reql queries are supported"
        );

        let err = SyncError::UnknownRelationship {
            model: "message".into(),
            relationship: "sender".into(),
        };
        assert!(err.to_string().contains("`sender` on model `message`"));
    }

    #[test]
    fn test_storage_error_converts() {
        let err: SyncError = StorageError::Changefeed("gone".into()).into();
        assert!(matches!(err, SyncError::Storage(StorageError::Changefeed(_))));
    }
}
