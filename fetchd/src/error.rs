//! Error types for the download engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the download engine.
///
/// Validation and state-conflict errors are returned synchronously and never
/// touch durable state. Remote and I/O errors that occur after a record was
/// persisted are recorded as [`crate::model::DownloadStatus::Error`] before
/// being surfaced, so the failure stays observable after a restart.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input: destination outside the download directory, duplicate
    /// destination file, unsupported URL scheme.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The remote server answered with a non-success status, or the
    /// transfer broke mid-stream.
    #[error("failed to download '{url}': {reason}")]
    Remote { url: String, reason: String },

    /// Local disk failure.
    #[error("i/o failure on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No record exists for the given download id.
    #[error("download '{0}' is not found")]
    NotFound(String),

    /// The operation is not valid for the record's current status.
    #[error("invalid state: {0}")]
    StateConflict(String),
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn remote(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Remote {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = EngineError::Validation("destination escapes the download directory".to_string());
        assert!(err.to_string().contains("validation failed"));
    }

    #[test]
    fn test_remote_display() {
        let err = EngineError::remote("http://example.com/f", "server responded with status 503");
        assert!(err.to_string().contains("http://example.com/f"));
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_io_preserves_source() {
        let err = EngineError::io(
            PathBuf::from("/tmp/f"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
