use thiserror::Error;

/// How the retry policy treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient connectivity or timeout failure, worth another attempt.
    Retryable,
    /// Authentication or configuration failure, abort immediately.
    Critical,
    /// Anything else, surfaced as-is.
    Ordinary,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("File not found: {path}")]
    NotFound { path: String },

    #[error("Backend {name} is disabled")]
    BackendDisabled { name: String },

    #[error("Unknown backend type: {kind}")]
    UnknownBackendType { kind: String },

    #[error("Backend {backend}: missing required option: {option}")]
    MissingOption { backend: String, option: String },

    #[error("Invalid backup filename {filename}: {reason}")]
    InvalidFilename { filename: String, reason: String },

    #[error("Dump failed: {0}")]
    Dump(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ConnectionFailed(_) | Error::Timeout(_) => ErrorClass::Retryable,
            Error::AuthFailed(_)
            | Error::InvalidConfig(_)
            | Error::MissingOption { .. }
            | Error::UnknownBackendType { .. } => ErrorClass::Critical,
            _ => ErrorClass::Ordinary,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Error::NotFound { path: path.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(Error::ConnectionFailed("x".into()).class(), ErrorClass::Retryable);
        assert_eq!(Error::Timeout("x".into()).class(), ErrorClass::Retryable);
        assert_eq!(Error::AuthFailed("x".into()).class(), ErrorClass::Critical);
        assert_eq!(Error::InvalidConfig("x".into()).class(), ErrorClass::Critical);
        assert_eq!(Error::PermissionDenied("x".into()).class(), ErrorClass::Ordinary);
        assert_eq!(Error::not_found("a.backup").class(), ErrorClass::Ordinary);
    }

    #[test]
    fn test_io_not_found_is_not_found() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(err.is_not_found());
        assert!(!Error::Backend("boom".into()).is_not_found());
    }
}
