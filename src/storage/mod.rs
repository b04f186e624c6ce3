//! # Storage and Persistence
//!
//! Ordered key/value storage for connection, role and static-account
//! records, plus the change-notification feed the connection cache
//! subscribes to.

pub mod keys;
pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStorage;
pub use sqlite::{create_pool, DbPool, SqliteStorage};

use crate::config::StorageConfig;
use crate::errors::{DbSecretsError, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Buffered notifications per subscriber before it starts lagging
const CHANGE_FEED_CAPACITY: usize = 256;

/// A stored value was modified, possibly by another process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub key: String,
}

/// Key/value storage collaborator.
///
/// `list` follows folder semantics: it returns the immediate children of
/// `prefix`, with nested folders reported once and suffixed by `/`.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`; deleting an absent key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Subscribe to externally-originated key changes
    fn subscribe(&self) -> broadcast::Receiver<KeyChange>;
}

/// Fan-out of key change notifications shared by the storage implementations
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<KeyChange>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { sender }
    }
}

impl ChangeFeed {
    pub fn subscribe(&self) -> broadcast::Receiver<KeyChange> {
        self.sender.subscribe()
    }

    /// Publish a change; dropped silently when nobody is subscribed
    pub fn publish(&self, key: &str) {
        let _ = self.sender.send(KeyChange { key: key.to_string() });
    }
}

/// Reduce full keys under `prefix` to their immediate children
pub(crate) fn list_children<'a, I>(prefix: &str, keys: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut children = BTreeSet::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        match rest.find('/') {
            Some(idx) => children.insert(rest[..=idx].to_string()),
            None => children.insert(rest.to_string()),
        };
    }
    children.into_iter().collect()
}

/// Read and decode a JSON record
pub async fn get_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>> {
    match storage.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| DbSecretsError::Serialization {
                source: e,
                context: format!("Failed to decode record at '{}'", key),
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Encode and write a JSON record
pub async fn put_json<T: Serialize + ?Sized>(storage: &dyn Storage, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| DbSecretsError::Serialization {
        source: e,
        context: format!("Failed to encode record for '{}'", key),
    })?;
    storage.put(key, bytes).await
}

/// Open the storage backend selected by the configuration URL
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    if config.is_memory() {
        tracing::info!("Using in-memory storage; records will not survive restart");
        return Ok(Arc::new(InMemoryStorage::new()));
    }

    if config.is_sqlite() {
        let pool = create_pool(config).await?;
        return Ok(Arc::new(SqliteStorage::new(pool)));
    }

    Err(DbSecretsError::invalid_config_field(
        "Storage URL must start with 'memory://' or 'sqlite://'",
        "storage.url",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_children_folder_semantics() {
        let keys = [
            "roles/mysql/app",
            "roles/mysql/reporting",
            "roles/postgres/app",
            "static-roles/mysql/svc1",
            "config/prod-db",
        ];

        assert_eq!(list_children("roles/", keys), vec!["mysql/", "postgres/"]);
        assert_eq!(list_children("roles/mysql/", keys), vec!["app", "reporting"]);
        assert_eq!(list_children("config/", keys), vec!["prod-db"]);
        assert!(list_children("missing/", keys).is_empty());
    }

    #[test]
    fn test_list_children_skips_prefix_itself() {
        let keys = ["config/", "config/a"];
        assert_eq!(list_children("config/", keys), vec!["a"]);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let storage = InMemoryStorage::new();
        let value = serde_json::json!({"plugin_name": "mysql"});

        put_json(&storage, "config/prod-db", &value).await.unwrap();
        let loaded: Option<serde_json::Value> = get_json(&storage, "config/prod-db").await.unwrap();
        assert_eq!(loaded, Some(value));

        let missing: Option<serde_json::Value> = get_json(&storage, "config/nope").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_serialization_error() {
        let storage = InMemoryStorage::new();
        storage.put("config/bad", b"not json".to_vec()).await.unwrap();

        let result: Result<Option<serde_json::Value>> = get_json(&storage, "config/bad").await;
        assert!(matches!(result, Err(DbSecretsError::Serialization { .. })));
    }

    #[tokio::test]
    async fn test_open_memory_storage() {
        let config = StorageConfig { url: "memory://".to_string(), ..Default::default() };
        let storage = open(&config).await.unwrap();
        storage.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_scheme() {
        let config = StorageConfig { url: "redis://localhost".to_string(), ..Default::default() };
        assert!(open(&config).await.is_err());
    }
}
