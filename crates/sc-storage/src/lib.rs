use anyhow::Result;
use async_trait::async_trait;
use rocksdb::{DB, Options, WriteOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct NoopStore;

#[async_trait]
impl KeyValueStore for NoopStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let guard = self.entries.read().await;
        Ok(guard.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut guard = self.entries.write().await;
        guard.insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut guard = self.entries.write().await;
        guard.remove(key);
        Ok(())
    }
}

/// RocksDB-backed store. With `sync_writes` every write is fsynced before
/// returning, so the value survives the process being killed right after.
pub struct RocksDbStore {
    db: Arc<DB>,
    sync_writes: bool,
}

impl RocksDbStore {
    pub fn open_default(path: &str) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path)?;
        Ok(Self {
            db: Arc::new(db),
            sync_writes: false,
        })
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    fn key_for(key: &str) -> String {
        format!("kv:{key}")
    }

    fn write_options(&self) -> WriteOptions {
        let mut options = WriteOptions::default();
        options.set_sync(self.sync_writes);
        options
    }
}

#[async_trait]
impl KeyValueStore for RocksDbStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.db.get(Self::key_for(key).as_bytes())?;
        match value {
            Some(raw) => Ok(Some(String::from_utf8(raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.db
            .put_opt(Self::key_for(key).as_bytes(), value.as_bytes(), &self.write_options())?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.db
            .delete_opt(Self::key_for(key).as_bytes(), &self.write_options())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_set_get_remove() -> Result<()> {
        let store = InMemoryStore::default();
        assert!(store.is_empty().await);

        store.set("session", "{}".to_owned()).await?;
        assert_eq!(store.get("session").await?, Some("{}".to_owned()));
        assert_eq!(store.len().await, 1);

        store.remove("session").await?;
        store.remove("session").await?;
        assert_eq!(store.get("session").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn noop_never_returns_values() -> Result<()> {
        let store = NoopStore;
        store.set("session", "value".to_owned()).await?;
        assert_eq!(store.get("session").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn rocksdb_values_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("kv");
        let path = path.to_str().expect("temp path should be utf-8");

        {
            let store = RocksDbStore::open_default(path)?.with_sync_writes(true);
            store.set("session", "persisted".to_owned()).await?;
            store.set("other", "x".to_owned()).await?;
            store.remove("other").await?;
        }

        let reopened = RocksDbStore::open_default(path)?;
        assert_eq!(reopened.get("session").await?, Some("persisted".to_owned()));
        assert_eq!(reopened.get("other").await?, None);

        Ok(())
    }
}
