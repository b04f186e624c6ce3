//! # dbsecrets
//!
//! Issues, caches and rotates database credentials so callers never hold
//! long-lived database passwords.
//!
//! ## Architecture
//!
//! ```text
//! ConnectionService / RoleService
//!      ↓                    ↓
//! BackendResolver → ConnectionManager → CredentialBackend (MySQL, PostgreSQL)
//!      ↑                    ↑
//! RotationEngine    invalidation feed (Storage)
//! ```
//!
//! - **Credential backends**: one [`engines::CredentialBackend`] per database
//!   technology, built by the [`engines::BackendRegistry`]
//! - **Connection manager**: at most one live backend per connection name,
//!   evicted when its stored configuration changes
//! - **Rotation engine**: rotates static accounts on their period with
//!   per-account single-flight
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use dbsecrets::{AppConfig, DbSecrets, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = AppConfig::from_env()?;
//!     let app = DbSecrets::open(config, Default::default()).await?;
//!     let shutdown = CancellationToken::new();
//!     let tasks = app.start_background(shutdown.clone());
//!     // ... serve requests through app.connections / app.roles ...
//!     shutdown.cancel();
//!     app.shutdown(tasks).await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod connections;
pub mod engines;
pub mod errors;
pub mod observability;
pub mod roles;
pub mod rotation;
pub mod secrets;
pub mod services;
pub mod storage;

pub use config::AppConfig;
pub use errors::{DbSecretsError, Result};

use connections::{BackendResolver, ConnectionManager};
use engines::BackendRegistry;
use observability::MetricsRecorder;
use roles::RoleStore;
use rotation::RotationEngine;
use secrets::{PasswordGenerator, PolicyPasswordGenerator};
use services::{ConnectionService, RoleService};
use std::sync::Arc;
use storage::Storage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Fully wired set of components sharing one storage and one backend cache
#[derive(Debug, Clone)]
pub struct DbSecrets {
    pub config: AppConfig,
    pub storage: Arc<dyn Storage>,
    pub manager: Arc<ConnectionManager>,
    pub resolver: BackendResolver,
    pub engine: Arc<RotationEngine>,
    pub connections: ConnectionService,
    pub roles: RoleService,
}

impl DbSecrets {
    /// Open the configured storage and wire the built-in backends
    pub async fn open(config: AppConfig, metrics: MetricsRecorder) -> Result<Self> {
        let storage = storage::open(&config.storage).await?;
        let passwords = Arc::new(PolicyPasswordGenerator::new(config.password_policies.clone()));
        Ok(Self::assemble(config, storage, Arc::new(BackendRegistry::builtin()), passwords, metrics))
    }

    /// Wire components over explicit collaborators
    pub fn assemble(
        config: AppConfig,
        storage: Arc<dyn Storage>,
        registry: Arc<BackendRegistry>,
        passwords: Arc<dyn PasswordGenerator>,
        metrics: MetricsRecorder,
    ) -> Self {
        let manager = Arc::new(ConnectionManager::new(metrics.clone()));
        let resolver = BackendResolver::new(
            storage.clone(),
            registry,
            manager.clone(),
            config.rotation.backend_timeout(),
        );
        let role_store = RoleStore::new(storage.clone());
        let engine = Arc::new(RotationEngine::new(
            role_store.clone(),
            resolver.clone(),
            passwords.clone(),
            config.rotation.max_concurrent_rotations,
            metrics.clone(),
        ));
        let connections = ConnectionService::new(resolver.clone(), passwords.clone());
        let roles = RoleService::new(role_store, resolver.clone(), passwords, engine.clone(), metrics);

        Self { config, storage, manager, resolver, engine, connections, roles }
    }

    /// Start the invalidation listener and, when enabled, the rotation scheduler
    pub fn start_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks =
            vec![self.manager.spawn_invalidation_listener(self.storage.subscribe(), shutdown.clone())];

        if self.config.rotation.enabled {
            tasks.push(rotation::spawn_scheduler(
                self.engine.clone(),
                self.config.rotation.interval(),
                shutdown,
            ));
        } else {
            info!("Static account rotation disabled by configuration");
        }
        tasks
    }

    /// Wait for background tasks to stop, then close every cached backend
    pub async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.manager.evict_all().await;
        info!("All credential backends closed");
    }
}
