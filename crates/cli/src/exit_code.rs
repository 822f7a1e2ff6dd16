//! Process exit codes
//!
//! Scripts can branch on these without parsing error text.

use nb_core::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    /// Bad arguments or configuration
    UsageError = 2,
    NetworkError = 3,
    AuthError = 4,
    NotFound = 5,
    /// Destination state prevents the operation (non-empty directory, checksum mismatch)
    Conflict = 6,
    UnsupportedFeature = 7,
    /// Stopped by Ctrl-C; paused jobs can be resumed
    Interrupted = 130,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<ErrorKind> for ExitCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound | ErrorKind::JobNotFound => ExitCode::NotFound,
            ErrorKind::PermissionDenied => ExitCode::AuthError,
            ErrorKind::DirectoryNotEmpty | ErrorKind::IntegrityMismatch => ExitCode::Conflict,
            ErrorKind::NotSupported | ErrorKind::NotPausable => ExitCode::UnsupportedFeature,
            ErrorKind::TransientNetworkError | ErrorKind::Network => ExitCode::NetworkError,
            ErrorKind::InvalidUri | ErrorKind::Config | ErrorKind::InvalidJobState => {
                ExitCode::UsageError
            }
            ErrorKind::Canceled => ExitCode::Interrupted,
            ErrorKind::InvalidPageToken
            | ErrorKind::EmbeddedCopyError
            | ErrorKind::Io
            | ErrorKind::General => ExitCode::GeneralError,
        }
    }
}

impl From<&nb_core::Error> for ExitCode {
    fn from(error: &nb_core::Error) -> Self {
        error.kind().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            ExitCode::from(&nb_core::Error::NotFound("s3://b/k".into())),
            ExitCode::NotFound
        );
        assert_eq!(
            ExitCode::from(&nb_core::Error::DirectoryNotEmpty("gs://b/d/".into())),
            ExitCode::Conflict
        );
        assert_eq!(
            ExitCode::from(&nb_core::Error::TransientNetwork("timeout".into())),
            ExitCode::NetworkError
        );
        assert_eq!(ExitCode::Interrupted.code(), 130);
    }
}
