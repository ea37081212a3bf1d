//! Common error types for Siberian backup storage.

use thiserror::Error;

/// Top-level error type for storage and backup operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid stored credentials. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Expired, revoked or rejected credentials.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Network failure or timeout.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote answered with an unexpected shape (missing upload id,
    /// missing session URL, unparsable body).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Caller-supplied configuration failed schema rules.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The remote answered with a non-success status.
    #[error("Remote error (HTTP {status}): {message}")]
    Remote { status: u16, message: String },

    /// Transferred byte count does not match the source.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// No provider is registered under the identifier.
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// The provider exists but has no usable configuration.
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether this error means the bearer credential was rejected and a
    /// refresh might help.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_)) || matches!(self, Error::Remote { status: 401, .. })
    }

    /// Whether this error is a 404 reported by a remote API.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_)) || matches!(self, Error::Remote { status: 404, .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_classification() {
        assert!(Error::Auth("expired".into()).is_auth());
        assert!(Error::Remote {
            status: 401,
            message: "Invalid Credentials".into()
        }
        .is_auth());
        assert!(!Error::Transport("timeout".into()).is_auth());
    }

    #[test]
    fn test_remote_error_display() {
        let err = Error::Remote {
            status: 403,
            message: "SignatureDoesNotMatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "Remote error (HTTP 403): SignatureDoesNotMatch"
        );
        assert!(!err.is_not_found());
    }
}
