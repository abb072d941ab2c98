//! File-backed key/value store
//!
//! Keeps the whole keyspace in one JSON document, values hex-encoded. The
//! file is read on first access and rewritten after every mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::storage::backend::KeyValueStore;

/// JSON document store on the local filesystem
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Option<BTreeMap<String, String>>>,
}

impl JsonFileStore {
    /// Create a store persisted at `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!("Using state file: {}", path.display());
        Self {
            path,
            entries: Mutex::new(None),
        }
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        match fs::read(&self.path).await {
            Ok(data) => {
                debug!("Loaded state file {} ({} bytes)", self.path.display(), data.len());
                let entries = serde_json::from_slice(&data).map_err(|e| {
                    error!("State file '{}' is corrupt: {}", self.path.display(), e);
                    TorrentError::storage_error_full(
                        "Corrupt state file",
                        self.path.display().to_string(),
                        e.to_string(),
                    )
                })?;
                Ok(entries)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(TorrentError::storage_error_full(
                "Failed to read state file",
                self.path.display().to_string(),
                e.to_string(),
            )
            .into()),
        }
    }

    async fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &self.path).await.map_err(|e| {
            error!("Failed to replace state file '{}': {}", self.path.display(), e);
            TorrentError::storage_error_full("Failed to write state file", self.path.display().to_string(), e.to_string())
        })?;
        trace!("Flushed {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        let entries = guard.get_or_insert_with(BTreeMap::new);
        entries.insert(key.to_string(), hex::encode(value));
        self.flush(entries).await
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        match guard.as_ref().and_then(|entries| entries.get(key)) {
            Some(encoded) => Ok(Some(hex::decode(encoded).map_err(|e| {
                TorrentError::storage_error_full("Corrupt value in state file", key, e.to_string())
            })?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        let entries = guard.get_or_insert_with(BTreeMap::new);
        if entries.remove(key).is_some() {
            self.flush(entries).await?;
        }
        Ok(())
    }
}
