//! Error types for TokenRelay.
//!
//! All errors in TokenRelay are strongly typed using thiserror.
//! Session-facing failures are never fatal: they are rendered as
//! protocol `ERROR` frames for the affected token only.

use thiserror::Error;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ValidationError {
    #[error("Token cannot be empty")]
    EmptyToken,

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while resolving or streaming a token.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ExecutionError {
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Upstream feed error: {message}")]
    Feed {
        message: String,
    },

    #[error("Worker channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Queue '{path}' is full (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },
}

/// Transport errors for client-server communication.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    #[error("Failed to serialize frame: {message}")]
    SerializationFailed {
        message: String,
    },

    #[error("Failed to deserialize frame: {message}")]
    DeserializationFailed {
        message: String,
    },
}

/// Top-level error type for TokenRelay.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum RelayError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl RelayError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a configuration validation error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::Validation(ValidationError::InvalidConfig {
            reason: reason.into(),
        })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this error is retryable.
    ///
    /// A session that saw a retryable error may reconnect with the same token
    /// and re-read its offset.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. }
                    | ExecutionError::Storage { .. }
                    | ExecutionError::QueueFull { .. }
            ),
            Self::Transport(e) => matches!(e, TransportError::ConnectionFailed { .. }),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for TokenRelay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::FieldTooLong {
            field: "token".to_string(),
            max_length: 512,
        };
        let msg = format!("{err}");
        assert!(msg.contains("token"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout { duration_ms: 5000 };
        assert!(format!("{err}").contains("5000ms"));
    }

    #[test]
    fn test_relay_error_from_validation() {
        let err: RelayError = ValidationError::EmptyToken.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_relay_error_retryable() {
        let timeout: RelayError = ExecutionError::Timeout { duration_ms: 100 }.into();
        assert!(timeout.is_execution());
        assert!(timeout.is_retryable());

        let storage: RelayError = ExecutionError::Storage {
            message: "down".to_string(),
        }
        .into();
        assert!(storage.is_retryable());

        let feed: RelayError = ExecutionError::Feed {
            message: "partition gone".to_string(),
        }
        .into();
        assert!(!feed.is_retryable());

        let transport: RelayError = TransportError::ConnectionFailed {
            message: "refused".to_string(),
        }
        .into();
        assert!(transport.is_transport());
        assert!(transport.is_retryable());
    }

    #[test]
    fn test_relay_error_internal() {
        let err = RelayError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("unexpected state"));
    }

    #[test]
    fn test_invalid_config_is_validation() {
        let err = RelayError::invalid_config("max wait must be non-zero");
        assert!(err.is_validation());
        assert!(err.to_string().contains("max wait"));
    }
}
