//! Backend resolution
//!
//! Glue between persisted connection records, the backend registry and the
//! connection manager. Every backend call made by the role services and the
//! rotation engine goes through [`BackendResolver::call`].

use super::{ConnectionConfig, ConnectionManager};
use crate::engine_span;
use crate::engines::sql::with_timeout;
use crate::engines::{BackendRegistry, CredentialBackend};
use crate::errors::{DbSecretsError, Result};
use crate::storage::{self, keys, Storage};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{warn, Instrument};

#[derive(Debug, Clone)]
pub struct BackendResolver {
    storage: Arc<dyn Storage>,
    registry: Arc<BackendRegistry>,
    manager: Arc<ConnectionManager>,
    call_timeout: Duration,
}

impl BackendResolver {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<BackendRegistry>,
        manager: Arc<ConnectionManager>,
        call_timeout: Duration,
    ) -> Self {
        Self { storage, registry, manager, call_timeout }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Load the connection record for `name`
    pub async fn load_config(&self, name: &str) -> Result<ConnectionConfig> {
        storage::get_json(self.storage.as_ref(), &keys::connection_config_key(name))
            .await?
            .ok_or_else(|| DbSecretsError::not_found("Connection", name))
    }

    /// Cached backend for `name`, built from the current record when absent
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn CredentialBackend>> {
        self.manager
            .get_or_build(name, move || async move {
                let config = self.load_config(name).await?;
                self.registry.build(&config.plugin_name, &config.connection_details)
            })
            .await
    }

    /// Run one backend operation against connection `name`.
    ///
    /// The call is bounded by the resolver's deadline. A connect failure
    /// evicts the backend it came from, if still cached, so the next call
    /// rebuilds it.
    pub async fn call<T, F, Fut>(&self, name: &str, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn CredentialBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = engine_span!(operation, name);
        async {
            let backend = self.resolve(name).await?;
            let result = with_timeout(operation, self.call_timeout, f(backend.clone())).await;

            if let Err(e) = &result {
                if e.is_connect_failure()
                    && self.manager.evict_if_current(name, &backend, "connect_failure").await
                {
                    warn!(connection = %name, error = %e, "Backend unreachable; evicted cached backend");
                }
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use serde_json::json;

    fn resolver(storage: Arc<InMemoryStorage>) -> BackendResolver {
        BackendResolver::new(
            storage,
            Arc::new(BackendRegistry::builtin()),
            Arc::new(ConnectionManager::default()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_resolve_missing_connection() {
        let resolver = resolver(Arc::new(InMemoryStorage::new()));
        let err = resolver.resolve("nope").await.unwrap_err();
        assert!(matches!(err, DbSecretsError::NotFound { .. }));
        assert!(resolver.manager().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_builds_and_caches() {
        let storage = Arc::new(InMemoryStorage::new());
        let config = ConnectionConfig::new(
            "mysql-database-plugin",
            json!({"connection_url": "mysql://root@127.0.0.1:1/"}).as_object().cloned().unwrap(),
        );
        storage::put_json(storage.as_ref(), "config/prod-db", &config).await.unwrap();

        let resolver = resolver(storage);
        let first = resolver.resolve("prod-db").await.unwrap();
        let second = resolver.resolve("prod-db").await.unwrap();
        assert_eq!(first.technology(), "mysql");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_connect_failure_evicts() {
        let storage = Arc::new(InMemoryStorage::new());
        let config = ConnectionConfig::new(
            "postgres",
            json!({"connection_url": "postgres://admin@127.0.0.1:1/app", "connect_timeout": 2})
                .as_object()
                .cloned()
                .unwrap(),
        );
        storage::put_json(storage.as_ref(), "config/pg", &config).await.unwrap();

        let resolver = resolver(storage);
        let err = resolver
            .call("pg", "connect", |backend| async move { backend.connect().await.map(|_| ()) })
            .await
            .unwrap_err();
        assert!(err.is_connect_failure());
        assert!(!resolver.manager().contains("pg"));
    }
}
