//! Key/value store abstraction
//!
//! Persisted client state lives behind [`KeyValueStore`], a byte-string
//! store with read, write and delete. Implementations use interior
//! mutability so one store can be shared as `Arc<dyn KeyValueStore>`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// Abstract byte store for persisted client state
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch the value under `key`, `None` if absent
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`; deleting an absent key is not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// View of a store where every key is prefixed with a namespace
#[derive(Clone)]
pub struct Namespaced {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl Namespaced {
    /// Keys of this view are stored as `<namespace>/<key>`
    pub fn new(inner: Arc<dyn KeyValueStore>, namespace: &str) -> Self {
        Self {
            inner,
            prefix: format!("{}/", namespace),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl std::fmt::Debug for Namespaced {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespaced").field("prefix", &self.prefix).finish()
    }
}

#[async_trait]
impl KeyValueStore for Namespaced {
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.write(&self.full_key(key), value).await
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.read(&self.full_key(key)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&self.full_key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_namespaces_are_disjoint() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let peers = Namespaced::new(store.clone(), "peers");
        let stats = Namespaced::new(store.clone(), "stats");

        peers.write("abc", b"one".to_vec()).await.unwrap();
        assert_eq!(stats.read("abc").await.unwrap(), None);
        assert_eq!(store.read("peers/abc").await.unwrap(), Some(b"one".to_vec()));

        peers.delete("abc").await.unwrap();
        assert_eq!(peers.read("abc").await.unwrap(), None);
    }
}
