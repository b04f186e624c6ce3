//! # Structured Logging
//!
//! Subscriber initialisation plus span macros for backend calls and
//! rotation attempts.

use crate::config::{AppConfig, ObservabilityConfig};
use crate::errors::{DbSecretsError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Create a tracing span for a credential backend call.
///
/// ```rust,ignore
/// let span = engine_span!("update_principal_secret", "prod-db");
/// ```
#[macro_export]
macro_rules! engine_span {
    ($operation:expr, $connection:expr) => {
        tracing::debug_span!(
            "engine_operation",
            operation = %$operation,
            connection = %$connection,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $connection:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "engine_operation",
            operation = %$operation,
            connection = %$connection,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for one rotation attempt of a static account
#[macro_export]
macro_rules! rotation_span {
    ($account:expr) => {
        tracing::info_span!(
            "rotation",
            account = %$account,
            attempt_id = %uuid::Uuid::new_v4(),
            outcome = tracing::field::Empty
        )
    };
    ($account:expr, $($field:tt)*) => {
        tracing::info_span!(
            "rotation",
            account = %$account,
            attempt_id = %uuid::Uuid::new_v4(),
            outcome = tracing::field::Empty,
            $($field)*
        )
    };
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is harmless; later calls leave the first subscriber in place.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            DbSecretsError::invalid_config_field(
                format!("Invalid log level '{}': {}", config.log_level, e),
                "observability.log_level",
            )
        })?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if config.json_logging {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(true)).try_init()
    };

    if result.is_err() {
        // Subscriber already set elsewhere (e.g. integration tests); ignore.
        tracing::debug!("Global subscriber already installed");
    }

    Ok(())
}

/// Log configuration at startup
pub fn log_config_info(config: &AppConfig) {
    tracing::info!(
        storage = if config.storage.is_memory() { "memory" } else { "sqlite" },
        rotation_enabled = %config.rotation.enabled,
        rotation_interval_seconds = config.rotation.interval_seconds,
        max_concurrent_rotations = config.rotation.max_concurrent_rotations,
        password_policies = config.password_policies.len(),
        metrics_enabled = %config.observability.enable_metrics,
        "dbsecrets configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = engine_span!("connect", "prod-db");
        let _span = engine_span!("create_principal", "prod-db", username = "v-app-1");
        let _span = rotation_span!("mysql/svc1");
        let _span = rotation_span!("mysql/svc1", forced = true);
    }

    #[test]
    fn test_init_logging_twice() {
        let config = ObservabilityConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_log_config_info() {
        let config = AppConfig::default();

        // This should not panic
        log_config_info(&config);
    }
}
