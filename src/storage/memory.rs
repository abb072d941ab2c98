//! In-process key/value store

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::backend::KeyValueStore;

/// Volatile store backed by a map
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_delete() {
        let store = MemoryStore::new();
        assert!(store.is_empty().await);
        store.write("k", vec![1, 2]).await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), Some(vec![1, 2]));
        store.write("k", vec![3]).await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), Some(vec![3]));
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), None);
    }
}
