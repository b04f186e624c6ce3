//! # Configuration Management
//!
//! Layered application configuration: built-in defaults, an optional file,
//! then `DBSECRETS_*` environment variables (nested keys separated by `__`,
//! e.g. `DBSECRETS_ROTATION__INTERVAL_SECONDS=30`).
//!
//! Per-connection database settings are not part of this configuration;
//! they are persisted connection records decoded by each backend.

pub mod settings;

pub use settings::{AppConfig, ObservabilityConfig, RotationConfig, StorageConfig};

use crate::errors::Result;
use std::path::Path;

pub const ENV_PREFIX: &str = "DBSECRETS";

impl AppConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let loaded: AppConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Load configuration from the environment only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }
}
