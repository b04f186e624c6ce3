//! # Error Types
//!
//! Error taxonomy for connection management, credential backends and the
//! rotation engine, built with `thiserror`.

/// Custom result type for dbsecrets operations
pub type Result<T> = std::result::Result<T, DbSecretsError>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for dbsecrets
#[derive(thiserror::Error, Debug)]
pub enum DbSecretsError {
    /// Malformed or missing configuration; never retried
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String, field: Option<String> },

    /// Unknown database technology name
    #[error("Unsupported database technology '{technology}'")]
    UnsupportedTechnology { technology: String },

    /// Network or authentication failure while reaching a database
    #[error("Connection to {target} failed: {message}")]
    ConnectFailed {
        target: String,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// A principal-management statement failed
    #[error("Backend {operation} failed: {message}")]
    BackendExecFailed {
        operation: String,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// The target principal does not exist in the database
    #[error("Principal '{username}' not found")]
    PrincipalNotFound { username: String },

    /// Any failure encountered while rotating a static account
    #[error("Rotation failed for '{account}': {source}")]
    RotationFailed {
        account: String,
        #[source]
        source: Box<DbSecretsError>,
    },

    /// Storage collaborator errors
    #[error("Storage error: {context}")]
    Storage {
        #[source]
        source: sqlx::Error,
        context: String,
    },

    /// Serialization/deserialization of persisted records
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Request validation errors
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// Persisted record not found
    #[error("{resource_type} '{id}' not found")]
    NotFound { resource_type: String, id: String },

    /// Deadline exceeded on a blocking call
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbSecretsError {
    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig { message: message.into(), field: None }
    }

    /// Create an invalid configuration error naming the offending option
    pub fn invalid_config_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::InvalidConfig { message: message.into(), field: Some(field.into()) }
    }

    pub fn unsupported_technology<S: Into<String>>(technology: S) -> Self {
        Self::UnsupportedTechnology { technology: technology.into() }
    }

    /// Create a connection failure error
    pub fn connect_failed<T: Into<String>, M: Into<String>>(target: T, message: M) -> Self {
        Self::ConnectFailed { target: target.into(), message: message.into(), source: None }
    }

    /// Create a connection failure error with source
    pub fn connect_failed_with_source<T: Into<String>>(target: T, source: BoxedSource) -> Self {
        Self::ConnectFailed { target: target.into(), message: source.to_string(), source: Some(source) }
    }

    /// Create a backend statement failure
    pub fn backend_exec<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::BackendExecFailed { operation: operation.into(), message: message.into(), source: None }
    }

    /// Create a backend statement failure with source
    pub fn backend_exec_with_source<O: Into<String>>(operation: O, source: BoxedSource) -> Self {
        Self::BackendExecFailed {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub fn principal_not_found<S: Into<String>>(username: S) -> Self {
        Self::PrincipalNotFound { username: username.into() }
    }

    /// Wrap an error encountered during a rotation attempt
    pub fn rotation_failed<S: Into<String>>(account: S, source: DbSecretsError) -> Self {
        match source {
            // Avoid nesting when a rotation error bubbles through twice
            already @ Self::RotationFailed { .. } => already,
            other => Self::RotationFailed { account: account.into(), source: Box::new(other) },
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), duration_ms }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether the cached backend for the failing connection should be evicted
    pub fn is_connect_failure(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } | Self::Timeout { .. } => true,
            Self::RotationFailed { source, .. } => source.is_connect_failure(),
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } => true,
            Self::Timeout { .. } => true,
            Self::Storage { .. } => true,
            Self::RotationFailed { .. } => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for DbSecretsError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage { source: error, context: "Storage operation failed".to_string() }
    }
}

impl From<serde_json::Error> for DbSecretsError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<config::ConfigError> for DbSecretsError {
    fn from(error: config::ConfigError) -> Self {
        Self::invalid_config(format!("Configuration loading failed: {}", error))
    }
}

impl From<validator::ValidationErrors> for DbSecretsError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::validation(format!("Validation failed: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = DbSecretsError::invalid_config("connection_url is required");
        assert!(matches!(error, DbSecretsError::InvalidConfig { .. }));
        assert_eq!(error.to_string(), "Invalid configuration: connection_url is required");
    }

    #[test]
    fn test_unsupported_technology_display() {
        let error = DbSecretsError::unsupported_technology("oracle");
        assert_eq!(error.to_string(), "Unsupported database technology 'oracle'");
    }

    #[test]
    fn test_rotation_failed_wraps_once() {
        let inner = DbSecretsError::connect_failed("mysql://db:3306", "refused");
        let wrapped = DbSecretsError::rotation_failed("mysql/svc1", inner);
        let rewrapped = DbSecretsError::rotation_failed("mysql/svc1", wrapped);

        match rewrapped {
            DbSecretsError::RotationFailed { source, .. } => {
                assert!(matches!(*source, DbSecretsError::ConnectFailed { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_connect_failure_classification() {
        assert!(DbSecretsError::connect_failed("db", "refused").is_connect_failure());
        assert!(DbSecretsError::timeout("connect", 1000).is_connect_failure());
        assert!(DbSecretsError::rotation_failed(
            "mysql/svc1",
            DbSecretsError::connect_failed("db", "refused")
        )
        .is_connect_failure());
        assert!(!DbSecretsError::backend_exec("update", "syntax error").is_connect_failure());
        assert!(!DbSecretsError::principal_not_found("svc1").is_connect_failure());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(DbSecretsError::timeout("connect", 1000).is_retryable());
        assert!(!DbSecretsError::invalid_config("bad").is_retryable());
        assert!(!DbSecretsError::unsupported_technology("oracle").is_retryable());
    }

    #[test]
    fn test_error_conversions() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let converted: DbSecretsError = json_error.into();
        assert!(matches!(converted, DbSecretsError::Serialization { .. }));

        let sqlx_error = sqlx::Error::RowNotFound;
        let converted: DbSecretsError = sqlx_error.into();
        assert!(matches!(converted, DbSecretsError::Storage { .. }));
    }
}
