//! Error types for the target
//!
//! Every variant except [`StoreError::Transient`] (while retry budget remains)
//! aborts the run. The driver still finalizes open uploaders before the error
//! leaves [`crate::session::Session::run`].

use thiserror::Error;

/// Result type alias for target operations
pub type Result<T> = std::result::Result<T, TargetError>;

/// Result type alias for object store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum TargetError {
    /// Malformed input line
    #[error(transparent)]
    Protocol(#[from] s3csv_common::CommonError),

    #[error("A record for stream '{0}' was encountered before a corresponding schema")]
    UnknownStream(String),

    #[error("Record of stream '{stream}' failed validation: {message}")]
    SchemaValidation { stream: String, message: String },

    #[error("Schema of stream '{stream}' cannot be compiled: {message}")]
    InvalidSchema { stream: String, message: String },

    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid configuration:\n   * {}", .0.join("\n   * "))]
    Config(Vec<String>),

    #[error("Failed to encode rows of stream '{stream}': {source}")]
    Encode {
        stream: String,
        #[source]
        source: csv::Error,
    },

    #[error("Uploader for stream '{0}' is closed")]
    UploaderClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize checkpoint: {0}")]
    Checkpoint(#[from] serde_json::Error),
}

impl TargetError {
    /// Create a schema validation error
    pub fn validation(stream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaValidation {
            stream: stream.into(),
            message: message.into(),
        }
    }
}

/// Errors reported by an [`crate::store::ObjectStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection reset, timeout, throttling, 5xx. Safe to retry.
    #[error("transient failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("{operation} failed: {message}")]
    Permanent { operation: String, message: String },

    #[error("upload session '{0}' does not exist")]
    NoSuchUpload(String),

    #[error("{operation} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<StoreError>,
    },
}

impl StoreError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_lists_every_problem() {
        let err = TargetError::Config(vec![
            "s3_bucket is required".to_string(),
            "delimiter must be a single character".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("* s3_bucket is required"));
        assert!(msg.contains("* delimiter must be a single character"));
    }

    #[test]
    fn test_only_transient_errors_are_transient() {
        assert!(StoreError::transient("upload_part", "timeout").is_transient());
        assert!(!StoreError::permanent("upload_part", "AccessDenied").is_transient());
        assert!(!StoreError::NoSuchUpload("abc".to_string()).is_transient());

        let exhausted = StoreError::RetriesExhausted {
            operation: "upload_part".to_string(),
            attempts: 3,
            last: Box::new(StoreError::transient("upload_part", "timeout")),
        };
        assert!(!exhausted.is_transient());
    }
}
