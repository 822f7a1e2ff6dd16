//! Error types for nb-core
//!
//! Every provider maps its backend failures into [`Error`] so that the
//! executor can decide on retries from the variant alone.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for nb-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared by providers, the planner and the job engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Job cannot be paused: {0}")]
    NotPausable(String),

    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Network error: {0}")]
    Network(String),

    /// The backend acknowledged the request but the body reports a failure
    #[error("Copy failed after acceptance: {message}")]
    EmbeddedCopy { message: String, retryable: bool },

    #[error("Operation canceled")]
    Canceled,

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid job state: {0}")]
    InvalidJobState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    General(String),
}

impl Error {
    /// Whether the executor may retry the failed call with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TransientNetwork(_) => true,
            Error::EmbeddedCopy { retryable, .. } => *retryable,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Serializable category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
            Error::InvalidPageToken(_) => ErrorKind::InvalidPageToken,
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::NotPausable(_) => ErrorKind::NotPausable,
            Error::IntegrityMismatch(_) => ErrorKind::IntegrityMismatch,
            Error::TransientNetwork(_) => ErrorKind::TransientNetworkError,
            Error::Network(_) => ErrorKind::Network,
            Error::EmbeddedCopy { .. } => ErrorKind::EmbeddedCopyError,
            Error::Canceled => ErrorKind::Canceled,
            Error::InvalidUri(_) => ErrorKind::InvalidUri,
            Error::JobNotFound(_) => ErrorKind::JobNotFound,
            Error::InvalidJobState(_) => ErrorKind::InvalidJobState,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) | Error::General(_) => ErrorKind::General,
        }
    }

    /// Rebuild an error from a persisted kind and message
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::PermissionDenied => Error::PermissionDenied(message),
            ErrorKind::DirectoryNotEmpty => Error::DirectoryNotEmpty(message),
            ErrorKind::InvalidPageToken => Error::InvalidPageToken(message),
            ErrorKind::NotSupported => Error::NotSupported(message),
            ErrorKind::NotPausable => Error::NotPausable(message),
            ErrorKind::IntegrityMismatch => Error::IntegrityMismatch(message),
            ErrorKind::TransientNetworkError => Error::TransientNetwork(message),
            ErrorKind::Network => Error::Network(message),
            ErrorKind::EmbeddedCopyError => Error::EmbeddedCopy {
                message,
                retryable: false,
            },
            ErrorKind::Canceled => Error::Canceled,
            ErrorKind::InvalidUri => Error::InvalidUri(message),
            ErrorKind::JobNotFound => Error::JobNotFound(message),
            ErrorKind::InvalidJobState => Error::InvalidJobState(message),
            ErrorKind::Config => Error::Config(message),
            ErrorKind::Io => Error::Io(std::io::Error::other(message)),
            ErrorKind::General => Error::General(message),
        }
    }
}

/// Error category recorded on failed jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    DirectoryNotEmpty,
    InvalidPageToken,
    NotSupported,
    NotPausable,
    IntegrityMismatch,
    TransientNetworkError,
    Network,
    EmbeddedCopyError,
    Canceled,
    InvalidUri,
    JobNotFound,
    InvalidJobState,
    Config,
    Io,
    General,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::DirectoryNotEmpty => "directory_not_empty",
            ErrorKind::InvalidPageToken => "invalid_page_token",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::NotPausable => "not_pausable",
            ErrorKind::IntegrityMismatch => "integrity_mismatch",
            ErrorKind::TransientNetworkError => "transient_network_error",
            ErrorKind::Network => "network",
            ErrorKind::EmbeddedCopyError => "embedded_copy_error",
            ErrorKind::Canceled => "canceled",
            ErrorKind::InvalidUri => "invalid_uri",
            ErrorKind::JobNotFound => "job_not_found",
            ErrorKind::InvalidJobState => "invalid_job_state",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::General => "general",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TransientNetwork("reset".into()).is_retryable());
        assert!(
            Error::EmbeddedCopy {
                message: "InternalError".into(),
                retryable: true
            }
            .is_retryable()
        );
        assert!(
            !Error::EmbeddedCopy {
                message: "AccessDenied".into(),
                retryable: false
            }
            .is_retryable()
        );
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::PermissionDenied("x".into()).is_retryable());
        assert!(!Error::DirectoryNotEmpty("x".into()).is_retryable());
        assert!(!Error::NotSupported("x".into()).is_retryable());
        assert!(!Error::IntegrityMismatch("x".into()).is_retryable());
    }

    #[test]
    fn test_io_retryable() {
        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(err.is_retryable());

        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_kind_round_trip() {
        let err = Error::from_kind(ErrorKind::IntegrityMismatch, "md5 differs");
        assert_eq!(err.kind(), ErrorKind::IntegrityMismatch);
        assert_eq!(err.to_string(), "Integrity mismatch: md5 differs");
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::TransientNetworkError).unwrap();
        assert_eq!(json, "\"transient_network_error\"");
    }
}
