//! In-process storage used by tests and `memory://` deployments.

use super::{list_children, ChangeFeed, KeyChange, Storage};
use crate::errors::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Ordered map guarded by an async lock.
///
/// Local writes do not publish notifications; the change feed carries only
/// what [`InMemoryStorage::notify_changed`] injects, mirroring a replicated
/// store where invalidations originate from other writers.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    feed: ChangeFeed,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report that `key` was modified outside this process
    pub fn notify_changed(&self, key: &str) {
        self.feed.publish(key);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        let keys = entries
            .range(prefix.to_string()..)
            .map(|(k, _)| k.as_str())
            .take_while(|k| k.starts_with(prefix));
        Ok(list_children(prefix, keys))
    }

    fn subscribe(&self) -> broadcast::Receiver<KeyChange> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let storage = InMemoryStorage::new();
        assert!(storage.is_empty().await);

        storage.put("config/a", b"1".to_vec()).await.unwrap();
        assert_eq!(storage.get("config/a").await.unwrap(), Some(b"1".to_vec()));

        storage.put("config/a", b"2".to_vec()).await.unwrap();
        assert_eq!(storage.get("config/a").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(storage.len().await, 1);

        storage.delete("config/a").await.unwrap();
        assert_eq!(storage.get("config/a").await.unwrap(), None);

        // Deleting again is fine
        storage.delete("config/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let storage = InMemoryStorage::new();
        for key in ["config/b", "config/a", "configx/c", "roles/mysql/app"] {
            storage.put(key, Vec::new()).await.unwrap();
        }

        assert_eq!(storage.list("config/").await.unwrap(), vec!["a", "b"]);
        assert_eq!(storage.list("roles/").await.unwrap(), vec!["mysql/"]);
    }

    #[tokio::test]
    async fn test_local_writes_are_silent() {
        let storage = InMemoryStorage::new();
        let mut rx = storage.subscribe();

        storage.put("config/a", b"1".to_vec()).await.unwrap();
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));

        storage.notify_changed("config/a");
        assert_eq!(rx.recv().await.unwrap(), KeyChange { key: "config/a".to_string() });
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let storage = InMemoryStorage::new();
        let other = storage.clone();
        other.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
