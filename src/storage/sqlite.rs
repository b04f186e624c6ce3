//! # SQLite Storage
//!
//! Durable key/value table backed by a SQLite pool.

use super::{list_children, ChangeFeed, KeyChange, Storage};
use crate::config::StorageConfig;
use crate::errors::{DbSecretsError, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{str::FromStr, time::Duration};
use tokio::sync::broadcast;

/// Type alias for the storage connection pool
pub type DbPool = Pool<Sqlite>;

const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// Create the storage pool, running the table migration when enabled
pub async fn create_pool(config: &StorageConfig) -> Result<DbPool> {
    validate_config(config)?;

    // Every connection to `:memory:` is a separate database
    let in_memory = config.url.contains(":memory:");
    let max_connections = if in_memory { 1 } else { config.max_connections };

    let pool_options = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(config.connect_timeout())
        .test_before_acquire(true);

    let pool_options = if in_memory {
        pool_options.min_connections(1).idle_timeout(None).max_lifetime(None)
    } else {
        pool_options
    };

    let connect_options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| DbSecretsError::Storage {
            source: e,
            context: format!("Invalid SQLite connection string: {}", config.url),
        })?
        .create_if_missing(true)
        .busy_timeout(SQLITE_BUSY_TIMEOUT)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = pool_options.connect_with(connect_options).await.map_err(|e| {
        tracing::error!(
            error = %e,
            url = %config.url,
            busy_timeout_ms = SQLITE_BUSY_TIMEOUT.as_millis(),
            "Failed to create SQLite storage pool"
        );
        DbSecretsError::Storage {
            source: e,
            context: format!("Failed to open storage: {}", config.url),
        }
    })?;

    tracing::info!(
        max_connections = max_connections,
        connect_timeout_ms = config.connect_timeout().as_millis(),
        "Storage connection pool created"
    );

    if config.auto_migrate {
        run_migrations(&pool).await?;
    }

    Ok(pool)
}

fn validate_config(config: &StorageConfig) -> Result<()> {
    if config.max_connections == 0 {
        return Err(DbSecretsError::validation("max_connections must be greater than 0"));
    }

    if !config.is_sqlite() {
        return Err(DbSecretsError::validation("SQLite storage URL must start with 'sqlite://'"));
    }

    Ok(())
}

/// Create the key/value table if it does not exist
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::query(CREATE_TABLE).execute(pool).await.map_err(|e| DbSecretsError::Storage {
        source: e,
        context: "Failed to create kv_entries table".to_string(),
    })?;
    tracing::debug!("Storage migrations applied");
    Ok(())
}

/// [`Storage`] over a SQLite `kv_entries` table.
///
/// Like the in-memory store, local writes are not echoed on the change
/// feed; [`SqliteStorage::notify_changed`] injects external changes.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: DbPool,
    feed: ChangeFeed,
}

impl SqliteStorage {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, feed: ChangeFeed::default() }
    }

    pub fn notify_changed(&self, key: &str) {
        self.feed.publish(key);
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DbSecretsError::Storage {
                source: e,
                context: format!("Failed to read '{}'", key),
            })?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DbSecretsError::Storage {
            source: e,
            context: format!("Failed to write '{}'", key),
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| DbSecretsError::Storage {
                source: e,
                context: format!("Failed to delete '{}'", key),
            })?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM kv_entries WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbSecretsError::Storage {
            source: e,
            context: format!("Failed to list '{}'", prefix),
        })?;

        Ok(list_children(prefix, keys.iter().map(String::as_str)))
    }

    fn subscribe(&self) -> broadcast::Receiver<KeyChange> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_storage() -> SqliteStorage {
        let config = StorageConfig { url: "sqlite://:memory:".to_string(), ..Default::default() };
        SqliteStorage::new(create_pool(&config).await.unwrap())
    }

    #[test]
    fn test_validate_config() {
        let config = StorageConfig { url: "sqlite://./test.db".to_string(), ..Default::default() };
        assert!(validate_config(&config).is_ok());

        let config = StorageConfig { max_connections: 0, ..config };
        assert!(validate_config(&config).is_err());

        let config = StorageConfig { url: "memory://".to_string(), ..Default::default() };
        assert!(validate_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_round_trip_and_upsert() {
        let storage = memory_storage().await;

        storage.put("config/prod-db", b"one".to_vec()).await.unwrap();
        storage.put("config/prod-db", b"two".to_vec()).await.unwrap();
        assert_eq!(storage.get("config/prod-db").await.unwrap(), Some(b"two".to_vec()));

        storage.delete("config/prod-db").await.unwrap();
        assert_eq!(storage.get("config/prod-db").await.unwrap(), None);
        storage.delete("config/prod-db").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_children() {
        let storage = memory_storage().await;
        for key in [
            "static-roles/mysql/svc1",
            "static-roles/mysql/svc2",
            "static-roles/postgres/svc3",
            "static-rolesx/ignored",
        ] {
            storage.put(key, b"{}".to_vec()).await.unwrap();
        }

        assert_eq!(storage.list("static-roles/").await.unwrap(), vec!["mysql/", "postgres/"]);
        assert_eq!(storage.list("static-roles/mysql/").await.unwrap(), vec!["svc1", "svc2"]);
    }

    #[tokio::test]
    async fn test_persists_across_pools() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("secrets.db").display());
        let config = StorageConfig { url, ..Default::default() };

        {
            let storage = SqliteStorage::new(create_pool(&config).await.unwrap());
            storage.put("config/a", b"persisted".to_vec()).await.unwrap();
            storage.pool().close().await;
        }

        let storage = SqliteStorage::new(create_pool(&config).await.unwrap());
        assert_eq!(storage.get("config/a").await.unwrap(), Some(b"persisted".to_vec()));
    }
}
