//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::tracker::TrackerEvent;

/// CLI arguments for the torrent client
#[derive(Debug, Parser)]
#[command(name = "rust-torrent")]
#[command(about = "BitTorrent client: metainfo, trackers and peer transfers", long_about = None)]
pub struct CliArgs {
    /// JSON file holding the persisted client state
    #[arg(long, global = true, value_name = "FILE", default_value = "rust-torrent-state.json")]
    pub state: PathBuf,

    /// JSON client configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Listening port for incoming connections
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Client operations
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the contents of a .torrent file
    Info {
        #[arg(value_name = "TORRENT")]
        torrent: PathBuf,
    },
    /// Load a .torrent file into the client state
    Load {
        #[arg(value_name = "TORRENT")]
        torrent: PathBuf,
    },
    /// Remove a torrent and everything stored for it
    Unload {
        #[arg(value_name = "INFOHASH")]
        info_hash: String,
    },
    /// Announce to the trackers of a loaded torrent
    Announce {
        #[arg(value_name = "INFOHASH")]
        info_hash: String,
        /// started, stopped, completed or regular
        #[arg(long, default_value = "regular")]
        event: TrackerEvent,
    },
    /// Scrape every tracker of a loaded torrent
    Scrape {
        #[arg(value_name = "INFOHASH")]
        info_hash: String,
    },
    /// Show transfer statistics
    Stats {
        #[arg(value_name = "INFOHASH")]
        info_hash: String,
    },
    /// List known peers
    Peers {
        #[arg(value_name = "INFOHASH")]
        info_hash: String,
    },
    /// Download a torrent from its swarm and write its files
    Download {
        #[arg(value_name = "TORRENT")]
        torrent: PathBuf,
        /// Download directory
        #[arg(short, long, value_name = "DIR", default_value = "./downloads")]
        output_dir: PathBuf,
        /// Maximum number of peer connections
        #[arg(short, long, default_value_t = 8)]
        max_peers: usize,
    },
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
