//! Client configuration
//!
//! Timeouts are stored in milliseconds so the JSON form stays readable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TorrentError};
use crate::protocol::DEFAULT_PEER_ID_PREFIX;

/// Ports the CLI is allowed to listen on
pub const PORT_RANGE: std::ops::RangeInclusive<u16> = 6881..=6889;

/// Settings shared by the orchestrator and its sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Listening port, 0 picks any free port
    pub port: u16,
    /// Wait per socket read inside the message pump
    pub read_timeout_ms: u64,
    /// TCP connect and handshake timeout
    pub connect_timeout_ms: u64,
    /// Longest wait for one requested block
    pub block_timeout_ms: u64,
    /// Idle time after which a keep-alive is sent
    pub keep_alive_interval_ms: u64,
    /// Pending requests accepted from one peer
    pub max_pending_requests: usize,
    /// First 8 bytes of our peer id
    pub peer_id_prefix: String,
    /// Timeout of tracker HTTP requests
    pub http_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: *PORT_RANGE.start(),
            read_timeout_ms: 100,
            connect_timeout_ms: 10_000,
            block_timeout_ms: 10_000,
            keep_alive_interval_ms: 60_000,
            max_pending_requests: 256,
            peer_id_prefix: DEFAULT_PEER_ID_PREFIX.to_string(),
            http_timeout_ms: 15_000,
        }
    }
}

impl ClientConfig {
    /// Load a JSON config file; absent fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            TorrentError::config_error_with_field(format!("Cannot read {}: {}", path.display(), e), "config")
        })?;
        let config: Self = serde_json::from_slice(&data).map_err(|e| {
            TorrentError::config_error_with_field(format!("Invalid config {}: {}", path.display(), e), "config")
        })?;
        debug!("Loaded client config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("read_timeout_ms", self.read_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("block_timeout_ms", self.block_timeout_ms),
            ("keep_alive_interval_ms", self.keep_alive_interval_ms),
            ("http_timeout_ms", self.http_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(TorrentError::config_error_with_field("must be greater than zero", field));
            }
        }
        if self.max_pending_requests == 0 {
            return Err(TorrentError::config_error_with_field(
                "must allow at least one request",
                "max_pending_requests",
            ));
        }
        if self.peer_id_prefix.len() > 8 {
            return Err(TorrentError::config_error_with_field(
                "must be at most 8 bytes",
                "peer_id_prefix",
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 6881);
        assert_eq!(config.read_timeout(), Duration::from_millis(100));
        assert_eq!(config.peer_id_prefix, "-RT0100-");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"port": 6885, "max_pending_requests": 8}"#).unwrap();
        assert_eq!(config.port, 6885);
        assert_eq!(config.max_pending_requests, 8);
        assert_eq!(config.block_timeout_ms, 10_000);
    }

    #[test]
    fn test_validation_names_field() {
        let config = ClientConfig {
            read_timeout_ms: 0,
            ..ClientConfig::default()
        };
        match config.validate() {
            Err(TorrentError::ConfigError { field, .. }) => assert_eq!(field.as_deref(), Some("read_timeout_ms")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, r#"{"peer_id_prefix": "-XY0001-"}"#).unwrap();
        assert_eq!(ClientConfig::from_file(&path).unwrap().peer_id_prefix, "-XY0001-");

        std::fs::write(&path, r#"{"peer_id_prefix": "-TOOLONGPREFIX-"}"#).unwrap();
        assert!(ClientConfig::from_file(&path).is_err());
    }
}
