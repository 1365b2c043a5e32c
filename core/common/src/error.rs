//! Common error types for Storekeep.

use thiserror::Error;

/// Top-level error type for Storekeep operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No authenticated session could be established.
    ///
    /// Callers treat this as "skip this pass", never as a fatal failure.
    #[error("Credential unavailable: {0}")]
    CredentialUnavailable(String),

    /// A bounded remote call exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote service answered with an error status.
    #[error("Remote rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// Transport-level failure talking to a remote service.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote authentication failed (expired or revoked token).
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Local persistence read or write failed.
    #[error("Local I/O failure: {0}")]
    LocalIo(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A full resync was refused because local writes are still queued.
    #[error("{pending} pending change(s) have not been uploaded yet")]
    GuardViolation { pending: usize },

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the failure is transient and worth retrying on the next pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Network(_) => true,
            Error::RemoteRejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the failure originated in local persistence.
    pub fn is_local(&self) -> bool {
        matches!(self, Error::LocalIo(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("drive".into()).is_retryable());
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::RemoteRejected {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!Error::RemoteRejected {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!Error::GuardViolation { pending: 3 }.is_retryable());
    }

    #[test]
    fn test_guard_violation_message_carries_count() {
        let msg = Error::GuardViolation { pending: 3 }.to_string();
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_io_is_local() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(err.is_local());
        assert!(Error::LocalIo("disk".into()).is_local());
        assert!(!Error::Timeout("x".into()).is_local());
    }
}
