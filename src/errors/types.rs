//! # Error Types
//!
//! Comprehensive error types for the keepsake storage layer using `thiserror`.

/// Custom result type for keepsake operations
pub type Result<T> = std::result::Result<T, KeepsakeError>;

/// Main error type for the keepsake storage layer
#[derive(thiserror::Error, Debug)]
pub enum KeepsakeError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database and storage errors
    #[error("Database error: {context}")]
    Database {
        #[source]
        source: sqlx::Error,
        context: String,
    },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Validation errors (malformed tokens, missing key fields, unsupported
    /// explicit resource versions)
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Missing caller identity on an operation that requires one
    #[error("Unauthenticated: {message}")]
    Unauthenticated { message: String },

    /// Resource not found errors
    #[error("Resource not found: {resource_type} '{id}'")]
    NotFound { resource_type: String, id: String },

    /// Resource conflict errors (e.g. already exists)
    #[error("Resource conflict: {message}")]
    Conflict {
        message: String,
        resource_type: String,
    },

    /// A row scan rejected more malformed rows than the iterator tolerates
    #[error("Too many rejected rows: {rejected} exceeded the iterator cap")]
    TooManyRejectedRows { rejected: usize },

    /// Internal errors (encoding/decoding, crypto)
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl KeepsakeError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create an unauthenticated error
    pub fn unauthenticated<S: Into<String>>(message: S) -> Self {
        Self::Unauthenticated { message: message.into() }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a conflict error
    pub fn conflict<M: Into<String>, R: Into<String>>(message: M, resource_type: R) -> Self {
        Self::Conflict { message: message.into(), resource_type: resource_type.into() }
    }

    /// Create a rejected-row cap error
    pub fn too_many_rejected_rows(rejected: usize) -> Self {
        Self::TooManyRejectedRows { rejected }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Get the HTTP status code that should be returned for this error
    pub fn status_code(&self) -> u16 {
        match self {
            KeepsakeError::Config { .. } => 500,
            KeepsakeError::Database { .. } => 500,
            KeepsakeError::Io { .. } => 500,
            KeepsakeError::Serialization { .. } => 500,
            KeepsakeError::Validation { .. } => 400,
            KeepsakeError::Unauthenticated { .. } => 401,
            KeepsakeError::NotFound { .. } => 404,
            KeepsakeError::Conflict { .. } => 409,
            KeepsakeError::TooManyRejectedRows { .. } => 500,
            KeepsakeError::Internal { .. } => 500,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeepsakeError::Database { .. } | KeepsakeError::Io { .. })
    }

    /// Check whether this error is a not-found outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, KeepsakeError::NotFound { .. })
    }
}

// Error conversions for common external error types
impl From<sqlx::Error> for KeepsakeError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database { source: error, context: "Database operation failed".to_string() }
    }
}

impl From<std::io::Error> for KeepsakeError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for KeepsakeError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = KeepsakeError::config("bad database url");
        assert!(matches!(error, KeepsakeError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: bad database url");
    }

    #[test]
    fn test_validation_error_with_field() {
        let error = KeepsakeError::validation_field("namespace is required", "namespace");
        if let KeepsakeError::Validation { field, .. } = error {
            assert_eq!(field, Some("namespace".to_string()));
        } else {
            panic!("expected validation error");
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(KeepsakeError::validation("test").status_code(), 400);
        assert_eq!(KeepsakeError::unauthenticated("test").status_code(), 401);
        assert_eq!(KeepsakeError::not_found("secure_value", "ns/name").status_code(), 404);
        assert_eq!(KeepsakeError::conflict("test", "secure_value").status_code(), 409);
        assert_eq!(KeepsakeError::too_many_rejected_rows(1001).status_code(), 500);
        assert_eq!(KeepsakeError::internal("test").status_code(), 500);
    }

    #[test]
    fn test_retryable_errors() {
        let db_error: KeepsakeError = sqlx::Error::PoolTimedOut.into();
        assert!(db_error.is_retryable());
        assert!(!KeepsakeError::validation("test").is_retryable());
        assert!(!KeepsakeError::not_found("keeper", "kp").is_retryable());
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: KeepsakeError = io_error.into();
        assert!(matches!(error, KeepsakeError::Io { .. }));

        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: KeepsakeError = json_error.into();
        assert!(matches!(error, KeepsakeError::Serialization { .. }));
    }

    #[test]
    fn test_is_not_found() {
        assert!(KeepsakeError::not_found("keeper", "kp-1").is_not_found());
        assert!(!KeepsakeError::validation("nope").is_not_found());
    }
}
