//! # Configuration Settings
//!
//! Defines the configuration structure for the dbsecrets service.

use crate::errors::{DbSecretsError, Result};
use crate::secrets::PasswordPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Storage collaborator configuration
    #[validate(nested)]
    pub storage: StorageConfig,

    /// Rotation scheduler configuration
    #[validate(nested)]
    pub rotation: RotationConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,

    /// Named password policies available to roles and connections
    pub password_policies: HashMap<String, PasswordPolicy>,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(DbSecretsError::from)?;

        self.validate_custom()?;

        Ok(())
    }

    /// Checks the validator derive cannot express
    fn validate_custom(&self) -> Result<()> {
        if !self.storage.is_memory() && !self.storage.is_sqlite() {
            return Err(DbSecretsError::validation_field(
                "Storage URL must start with 'memory://' or 'sqlite://'",
                "storage.url",
            ));
        }

        for (name, policy) in &self.password_policies {
            if name.trim().is_empty() {
                return Err(DbSecretsError::validation("Password policy names cannot be empty"));
            }
            policy.validate().map_err(|e| {
                DbSecretsError::validation_field(
                    format!("Password policy '{}' is invalid: {}", name, e),
                    format!("password_policies.{}", name),
                )
            })?;
        }

        if self.observability.enable_metrics && self.observability.metrics_port == 0 {
            return Err(DbSecretsError::validation_field(
                "Metrics port must be set when metrics are enabled",
                "observability.metrics_port",
            ));
        }

        Ok(())
    }
}

/// Key/value storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage URL, `memory://` or `sqlite://path`
    #[validate(length(min = 1, message = "Storage URL cannot be empty"))]
    pub url: String,

    /// Maximum number of connections in the SQLite pool
    #[validate(range(min = 1, max = 100, message = "Max connections must be between 1 and 100"))]
    pub max_connections: u32,

    /// Connection timeout in seconds
    #[validate(range(
        min = 1,
        max = 60,
        message = "Connect timeout must be between 1 and 60 seconds"
    ))]
    pub connect_timeout_seconds: u64,

    /// Create the key/value table on open
    pub auto_migrate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/dbsecrets.db".to_string(),
            max_connections: 5,
            connect_timeout_seconds: 10,
            auto_migrate: true,
        }
    }
}

impl StorageConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Check if this is the in-process memory store
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }

    /// Check if this is a SQLite configuration
    pub fn is_sqlite(&self) -> bool {
        self.url.starts_with("sqlite://")
    }
}

/// Static-account rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RotationConfig {
    /// Run the periodic rotation scheduler
    pub enabled: bool,

    /// Seconds between evaluation passes
    #[validate(range(
        min = 1,
        max = 86400,
        message = "Rotation interval must be between 1 second and 24 hours"
    ))]
    pub interval_seconds: u64,

    /// Upper bound on rotations running at once within a pass
    #[validate(range(
        min = 1,
        max = 256,
        message = "Max concurrent rotations must be between 1 and 256"
    ))]
    pub max_concurrent_rotations: usize,

    /// Deadline applied to each backend call made by a rotation
    #[validate(range(
        min = 1,
        max = 600,
        message = "Backend timeout must be between 1 and 600 seconds"
    ))]
    pub backend_timeout_seconds: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 10,
            max_concurrent_rotations: 4,
            backend_timeout_seconds: 30,
        }
    }
}

impl RotationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_seconds)
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable metrics collection
    pub enable_metrics: bool,

    /// Prometheus exporter port
    pub metrics_port: u16,

    /// Service name attached to logs
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_port: 9090,
            service_name: "dbsecrets".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if !self.enable_metrics || self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_config_type_detection() {
        let memory = StorageConfig { url: "memory://".to_string(), ..Default::default() };
        assert!(memory.is_memory());
        assert!(!memory.is_sqlite());

        let sqlite = StorageConfig { url: "sqlite://./test.db".to_string(), ..Default::default() };
        assert!(sqlite.is_sqlite());
        assert_eq!(sqlite.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_rotation_config_durations() {
        let config = RotationConfig {
            interval_seconds: 30,
            backend_timeout_seconds: 5,
            ..Default::default()
        };
        assert_eq!(config.interval(), Duration::from_secs(30));
        assert_eq!(config.backend_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_observability_config_metrics_address() {
        let config = ObservabilityConfig { enable_metrics: true, ..Default::default() };
        assert_eq!(config.metrics_bind_address(), Some("0.0.0.0:9090".to_string()));

        let disabled = ObservabilityConfig::default();
        assert_eq!(disabled.metrics_bind_address(), None);
    }

    #[test]
    fn test_config_validation_errors() {
        let mut config = AppConfig::default();
        config.storage.url = "postgresql://localhost/secrets".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rotation.max_concurrent_rotations = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rotation.interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.password_policies.insert(
            "short".to_string(),
            PasswordPolicy { length: 2, ..Default::default() },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_named_policy_accepted() {
        let mut config = AppConfig::default();
        config.password_policies.insert(
            "long".to_string(),
            PasswordPolicy { length: 48, ..Default::default() },
        );
        assert!(config.validate().is_ok());
    }
}
