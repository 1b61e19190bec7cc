//! Common error types for fieldsync.

use thiserror::Error;

/// Top-level error type for fieldsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No network path to the backend. Aborts a whole sync run.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The backend rejected a record (e.g. server-side validation).
    #[error("Remote rejected: {0}")]
    Remote(String),

    /// Persistence operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Binary transfer of a queued upload failed.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error means the backend is unreachable as a whole,
    /// as opposed to a failure scoped to a single item.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connectivity(_))
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
    fn test_connectivity_classification() {
        assert!(Error::Connectivity("offline".to_string()).is_connectivity());
        assert!(!Error::Remote("validation failed".to_string()).is_connectivity());
        assert!(!Error::Transfer("timeout".to_string()).is_connectivity());
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let err: Error = serde_json::from_str::<u32>("not a number").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
