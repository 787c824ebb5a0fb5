use std::{fs, path::PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// Durable key-value store backing the cache, the pending-edit queue and the
/// bookmark list. Keys are namespaced by prefix (`cache_`, `content_`,
/// `pending_`, `bookmarks`); values are schema-tagged JSON blobs.
#[derive(Clone)]
pub struct KvStore {
    pool: SqlitePool,
}

impl KvStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All keys starting with `prefix`, ascending.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows = sqlx::query("SELECT key FROM kv WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key ASC")
            .bind(pattern)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("key").map_err(StoreError::from))
            .collect()
    }
}

fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("hubfs");
    path.push("engine.db");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_store() -> KvStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = KvStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = make_store().await;
        assert!(store.get("cache_docs").await.unwrap().is_none());

        store.put("cache_docs", b"one").await.unwrap();
        assert_eq!(store.get("cache_docs").await.unwrap().unwrap(), b"one");

        store.put("cache_docs", b"two").await.unwrap();
        assert_eq!(store.get("cache_docs").await.unwrap().unwrap(), b"two");

        store.delete("cache_docs").await.unwrap();
        assert!(store.get("cache_docs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keys_with_prefix_is_sorted_and_scoped() {
        let store = make_store().await;
        store.put("cache_docs/b", b"x").await.unwrap();
        store.put("cache_docs/a", b"x").await.unwrap();
        store.put("pending_docs/a", b"x").await.unwrap();

        let keys = store.keys_with_prefix("cache_").await.unwrap();
        assert_eq!(keys, vec!["cache_docs/a", "cache_docs/b"]);
    }

    #[tokio::test]
    async fn prefix_wildcards_are_escaped() {
        let store = make_store().await;
        store.put("pending_a%b", b"x").await.unwrap();
        store.put("pending_axb", b"x").await.unwrap();

        let keys = store.keys_with_prefix("pending_a%").await.unwrap();
        assert_eq!(keys, vec!["pending_a%b"]);
    }
}
