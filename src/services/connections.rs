//! Connection configuration business logic
//!
//! Writes build and optionally verify the new backend before anything is
//! persisted, so a rejected write leaves both storage and the cache as they
//! were. Writes and deletes of one connection are serialised so the cached
//! backend always matches the stored record.

use crate::connections::{BackendResolver, ConnectionConfig};
use crate::engines::sql::{self, with_timeout};
use crate::engines::{ConnectionDetails, CredentialBackend};
use crate::errors::{DbSecretsError, Result};
use crate::roles::validate_name;
use crate::secrets::PasswordGenerator;
use crate::storage::{self, keys};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

/// Option keys removed from connection details before they are returned
const REDACTED_DETAILS: &[&str] = &["password", "private_key", "tls_private_key", "tls_client_key"];

/// Write request for `config/<name>`; absent fields keep their stored value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionWriteRequest {
    pub plugin_name: Option<String>,
    pub plugin_version: Option<String>,
    /// Merged key by key over the stored option bag
    #[serde(default)]
    pub connection_details: ConnectionDetails,
    pub allowed_roles: Option<Vec<String>>,
    pub password_policy: Option<String>,
    pub verify_connection: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ConnectionService {
    resolver: BackendResolver,
    passwords: Arc<dyn PasswordGenerator>,
    write_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionService {
    pub fn new(resolver: BackendResolver, passwords: Arc<dyn PasswordGenerator>) -> Self {
        Self { resolver, passwords, write_locks: Arc::new(DashMap::new()) }
    }

    /// Held from reading the stored record until the cache is updated
    async fn lock_name(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self.write_locks.entry(name.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    async fn stored(&self, name: &str) -> Result<Option<ConnectionConfig>> {
        storage::get_json(self.resolver.storage().as_ref(), &keys::connection_config_key(name)).await
    }

    fn merge(existing: Option<ConnectionConfig>, request: ConnectionWriteRequest) -> Result<ConnectionConfig> {
        let mut config = match (existing, request.plugin_name) {
            (Some(mut existing), Some(plugin_name)) => {
                existing.plugin_name = plugin_name;
                existing
            }
            (Some(existing), None) => existing,
            (None, Some(plugin_name)) => ConnectionConfig::new(plugin_name, ConnectionDetails::new()),
            (None, None) => {
                return Err(DbSecretsError::validation_field(
                    "plugin_name is required",
                    "plugin_name",
                ))
            }
        };

        config.connection_details.extend(request.connection_details);
        if request.plugin_version.is_some() {
            config.plugin_version = request.plugin_version;
        }
        if let Some(allowed_roles) = request.allowed_roles {
            config.allowed_roles = allowed_roles;
        }
        if let Some(policy) = request.password_policy {
            config.password_policy = Some(policy).filter(|p| !p.is_empty());
        }
        if let Some(verify) = request.verify_connection {
            config.verify_connection = verify;
        }
        Ok(config)
    }

    /// Create or update connection `name`.
    ///
    /// Returns warnings for the caller to surface.
    pub async fn write(&self, name: &str, request: ConnectionWriteRequest) -> Result<Vec<String>> {
        validate_name(name, "connection name")?;
        let _guard = self.lock_name(name).await;

        let config = Self::merge(self.stored(name).await?, request)?;
        if let Some(policy) = &config.password_policy {
            if !self.passwords.has_policy(policy) {
                return Err(DbSecretsError::validation_field(
                    format!("Unknown password policy '{}'", policy),
                    "password_policy",
                ));
            }
        }

        let backend = self.resolver.registry().build(&config.plugin_name, &config.connection_details)?;

        if config.verify_connection {
            if let Err(e) = self.verify(backend.as_ref()).await {
                backend.close().await;
                return Err(e);
            }
        }

        if let Err(e) = storage::put_json(
            self.resolver.storage().as_ref(),
            &keys::connection_config_key(name),
            &config,
        )
        .await
        {
            backend.close().await;
            return Err(e);
        }
        self.resolver.manager().replace(name, backend).await;

        info!(connection = %name, plugin = %config.plugin_name, "Connection configured");

        let mut warnings = Vec::new();
        if url_embeds_password(&config.connection_details) {
            warnings.push(
                "connection_url contains a password; use the {{password}} template instead".to_string(),
            );
        }
        if config.allowed_roles.is_empty() {
            warnings.push("allowed_roles is empty; no role can use this connection".to_string());
        }
        for warning in &warnings {
            warn!(connection = %name, "{}", warning);
        }
        Ok(warnings)
    }

    async fn verify(&self, backend: &dyn CredentialBackend) -> Result<()> {
        let handle = with_timeout("verify connection", self.resolver.call_timeout(), backend.connect()).await?;
        info!(technology = handle.technology(), "Verified database connection");
        Ok(())
    }

    /// Stored record with secret options removed
    pub async fn read(&self, name: &str) -> Result<ConnectionConfig> {
        let mut config = self.resolver.load_config(name).await?;
        for key in REDACTED_DETAILS {
            config.connection_details.remove(*key);
        }
        Ok(config)
    }

    /// Remove the record and close its cached backend
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.lock_name(name).await;
        self.resolver.storage().delete(&keys::connection_config_key(name)).await?;
        self.resolver.manager().evict(name).await;
        info!(connection = %name, "Connection deleted");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        self.resolver.storage().list(keys::CONNECTION_CONFIG_PREFIX).await
    }

    /// Drop the cached backend so the next use rebuilds it from storage
    pub async fn reset(&self, name: &str) -> Result<()> {
        self.resolver.load_config(name).await?;
        self.resolver.manager().evict_with_reason(name, "reset").await;
        info!(connection = %name, "Connection reset");
        Ok(())
    }

    /// Live backend for `name`
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn CredentialBackend>> {
        self.resolver.resolve(name).await
    }
}

fn url_embeds_password(details: &ConnectionDetails) -> bool {
    details
        .get("connection_url")
        .and_then(|v| v.as_str())
        .is_some_and(sql::url_embeds_password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn details(value: serde_json::Value) -> ConnectionDetails {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_url_embeds_password() {
        assert!(url_embeds_password(&details(json!({"connection_url": "mysql://root:pw@db/"}))));
        assert!(!url_embeds_password(&details(
            json!({"connection_url": "mysql://{{username}}:{{password}}@db/"})
        )));
        assert!(!url_embeds_password(&details(json!({"connection_url": "mysql://root@db/"}))));
        assert!(!url_embeds_password(&details(json!({}))));
    }

    #[test]
    fn test_merge_requires_plugin_name() {
        let err = ConnectionService::merge(None, ConnectionWriteRequest::default()).unwrap_err();
        assert!(matches!(err, DbSecretsError::Validation { .. }));
    }

    #[test]
    fn test_merge_overlays_details() {
        let mut existing = ConnectionConfig::new(
            "mysql",
            details(json!({"connection_url": "mysql://db/", "max_open_connections": 4})),
        );
        existing.allowed_roles = vec!["app".to_string()];

        let merged = ConnectionService::merge(
            Some(existing),
            ConnectionWriteRequest {
                connection_details: details(json!({"max_open_connections": 8})),
                password_policy: Some("strong".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(merged.plugin_name, "mysql");
        assert_eq!(merged.connection_details["connection_url"], "mysql://db/");
        assert_eq!(merged.connection_details["max_open_connections"], 8);
        assert_eq!(merged.allowed_roles, vec!["app"]);
        assert_eq!(merged.password_policy.as_deref(), Some("strong"));
    }
}
