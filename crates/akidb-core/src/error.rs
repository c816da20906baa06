use thiserror::Error;

/// Canonical error type for storage and tiering operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity was not found.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"collection"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Entity already exists and cannot be created again.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Entity type name (e.g. `"collection"`).
        entity: &'static str,
        /// Identifier that conflicts.
        id: String,
    },

    /// Operation violates current state machine rules.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Human-readable explanation of the invalid state.
        message: String,
    },

    /// Unexpected internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },

    /// A remote call did not complete before its deadline.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        /// Operation that timed out (e.g. `"put s3://bucket/key"`).
        operation: String,
        /// Deadline in milliseconds.
        after_ms: u64,
    },

    /// A remote object store call failed.
    ///
    /// `status` is the HTTP status of the response, or `None` when no
    /// response arrived (dispatch failure, connection reset).
    #[error("object store {operation} failed: {message}")]
    ObjectStore {
        /// Operation that failed (e.g. `"put"`).
        operation: String,
        /// HTTP status of the response, if any.
        status: Option<u16>,
        /// Details reported by the store.
        message: String,
    },

    /// I/O error occurred during file or network operations.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error occurred.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Storage backend error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Validation error for input data or configuration.
    #[error("validation error: {0}")]
    ValidationError(String),
}

impl CoreError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `AlreadyExists` variant.
    #[must_use]
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `InvalidState` variant.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` variant.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates an `ObjectStore` variant.
    #[must_use]
    pub fn object_store(
        operation: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::ObjectStore {
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }

    /// HTTP status carried by an object store error.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::ObjectStore { status, .. } => *status,
            _ => None,
        }
    }

    /// Returns `true` for errors that describe a missing entity.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_eof() || err.is_syntax() {
            Self::DeserializationError(err.to_string())
        } else {
            Self::SerializationError(err.to_string())
        }
    }
}

/// Convenient result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_includes_operation() {
        let err = CoreError::timeout("put c/documents/d", std::time::Duration::from_millis(250));
        assert_eq!(err.to_string(), "put c/documents/d timed out after 250ms");
    }

    #[test]
    fn object_store_errors_expose_their_status() {
        let err = CoreError::object_store("put", Some(503), "status 503: SlowDown");
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(err.to_string(), "object store put failed: status 503: SlowDown");
        assert_eq!(CoreError::object_store("get", None, "reset").http_status(), None);
        assert_eq!(CoreError::internal("x").http_status(), None);
    }

    #[test]
    fn json_syntax_errors_are_deserialization_errors() {
        let err: CoreError = serde_json::from_str::<u32>("{not json").unwrap_err().into();
        assert!(matches!(err, CoreError::DeserializationError(_)));
    }
}
