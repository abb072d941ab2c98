//! CLI configuration module
//!
//! Merges the optional JSON client configuration with command-line overrides.

use crate::cli::args::CliArgs;
use crate::config::{ClientConfig, PORT_RANGE};
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Configuration for one CLI invocation
#[derive(Debug, Clone)]
pub struct Config {
    /// Settings handed to the client core
    pub client: ClientConfig,
    /// JSON state file
    pub state_path: PathBuf,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let mut client = match &args.config {
            Some(path) => ClientConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ClientConfig::default(),
        };
        if let Some(port) = args.port {
            client.port = port;
        }

        Ok(Self {
            client,
            state_path: args.state.clone(),
            verbose: args.verbose,
            quiet: args.quiet,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !PORT_RANGE.contains(&self.client.port) {
            return Err(anyhow::anyhow!(
                "Port {} is outside {}..={}",
                self.client.port,
                PORT_RANGE.start(),
                PORT_RANGE.end()
            ));
        }

        if self.state_path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("state path cannot be empty"));
        }

        self.client.validate()?;
        Ok(())
    }

    /// Get the listen address for incoming connections
    pub fn get_listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.client.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["rust-torrent"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["stats", "abcd"]);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_config_from_args() {
        let config = Config::from_args(&args(&["--port", "6885", "--state", "/tmp/s.json"])).unwrap();
        assert_eq!(config.client.port, 6885);
        assert_eq!(config.state_path, PathBuf::from("/tmp/s.json"));
        assert_eq!(config.get_listen_addr(), "0.0.0.0:6885");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate_invalid_port() {
        let config = Config::from_args(&args(&["--port", "7000"])).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_config_with_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, r#"{"port": 6882, "max_pending_requests": 4}"#).unwrap();
        let path = path.to_string_lossy().into_owned();

        let config = Config::from_args(&args(&["--config", &path])).unwrap();
        assert_eq!(config.client.port, 6882);
        assert_eq!(config.client.max_pending_requests, 4);

        let config = Config::from_args(&args(&["--config", &path, "-p", "6889"])).unwrap();
        assert_eq!(config.client.port, 6889);
    }
}
