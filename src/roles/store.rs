//! Role persistence on top of the key/value storage collaborator.

use super::{DynamicRole, StaticRole, StaticRoleKey};
use crate::errors::Result;
use crate::storage::{self, keys, Storage};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RoleStore {
    storage: Arc<dyn Storage>,
}

impl RoleStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn get_dynamic(&self, technology: &str, name: &str) -> Result<Option<DynamicRole>> {
        storage::get_json(self.storage.as_ref(), &keys::dynamic_role_key(technology, name)).await
    }

    pub async fn put_dynamic(&self, technology: &str, name: &str, role: &DynamicRole) -> Result<()> {
        storage::put_json(self.storage.as_ref(), &keys::dynamic_role_key(technology, name), role).await
    }

    pub async fn delete_dynamic(&self, technology: &str, name: &str) -> Result<()> {
        self.storage.delete(&keys::dynamic_role_key(technology, name)).await
    }

    pub async fn list_dynamic(&self, technology: &str) -> Result<Vec<String>> {
        self.storage.list(&keys::dynamic_role_prefix(technology)).await
    }

    pub async fn get_static(&self, key: &StaticRoleKey) -> Result<Option<StaticRole>> {
        storage::get_json(self.storage.as_ref(), &key.storage_key()).await
    }

    pub async fn put_static(&self, key: &StaticRoleKey, role: &StaticRole) -> Result<()> {
        storage::put_json(self.storage.as_ref(), &key.storage_key(), role).await
    }

    pub async fn delete_static(&self, key: &StaticRoleKey) -> Result<()> {
        self.storage.delete(&key.storage_key()).await
    }

    pub async fn list_static(&self, technology: &str) -> Result<Vec<String>> {
        self.storage.list(&keys::static_role_prefix(technology)).await
    }

    /// Every static role across all technologies
    pub async fn all_static_keys(&self) -> Result<Vec<StaticRoleKey>> {
        let mut found = Vec::new();
        for folder in self.storage.list(keys::STATIC_ROLE_PREFIX).await? {
            let Some(technology) = folder.strip_suffix('/') else {
                continue;
            };
            for name in self.list_static(technology).await? {
                if !name.ends_with('/') {
                    found.push(StaticRoleKey::new(technology, name));
                }
            }
        }
        Ok(found)
    }
}
