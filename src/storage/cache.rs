//! Write-through cache in front of another store

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use super::backend::KeyValueStore;

/// Caches reads and writes of an inner store. Absent and deleted keys are
/// remembered as `None` so repeated misses never reach the backend.
pub struct CachedStore {
    inner: Arc<dyn KeyValueStore>,
    cache: RwLock<HashMap<String, Option<Vec<u8>>>>,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Drop every cached entry
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }
}

#[async_trait]
impl KeyValueStore for CachedStore {
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.write(key, value.clone()).await?;
        self.cache.write().await.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.cache.read().await.get(key) {
            trace!("Cache hit for {}", key);
            return Ok(cached.clone());
        }
        let value = self.inner.read(key).await?;
        self.cache.write().await.insert(key.to_string(), value.clone());
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await?;
        self.cache.write().await.insert(key.to_string(), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_reads_are_served_from_cache() {
        let backend = Arc::new(MemoryStore::new());
        let cached = CachedStore::new(backend.clone());

        cached.write("k", vec![1]).await.unwrap();
        // Bypass the cache to show the cached copy is used
        backend.write("k", vec![2]).await.unwrap();
        assert_eq!(cached.read("k").await.unwrap(), Some(vec![1]));

        cached.clear().await;
        assert_eq!(cached.read("k").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_delete_is_remembered() {
        let backend = Arc::new(MemoryStore::new());
        let cached = CachedStore::new(backend.clone());
        cached.write("k", vec![1]).await.unwrap();
        cached.delete("k").await.unwrap();
        assert_eq!(backend.read("k").await.unwrap(), None);
        assert_eq!(cached.read("k").await.unwrap(), None);
    }
}
