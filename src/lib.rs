//! rust-torrent-core
//!
//! BitTorrent client core: bencode codec, peer wire protocol, tiered
//! tracker announce and scrape, and per-torrent peer session management.

pub mod bencode;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod stats;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::{Result, TorrentError};

pub use bencode::{Dict, DictKey, Value};
pub use cli::{CliArgs, Command, Config, ProgressDisplay};
pub use client::{ShutdownHandle, TorrentClient};
pub use config::ClientConfig;
pub use peer::{ConnectedPeer, KnownPeer, PeerConnection, PeerManager, PeerState};
pub use protocol::{Handshake, Message, MessageId};
pub use stats::{ScrapeData, TorrentStats};
pub use storage::{CachedStore, JsonFileStore, KeyValueStore, MemoryStore, Piece, PieceTable, StateStore};
pub use torrent::{InfoHash, TorrentFile, TorrentInfo, TorrentParser};
#[cfg(feature = "http")]
pub use tracker::ReqwestFetcher;
pub use tracker::{AnnounceTiers, HttpFetcher, TrackerClient, TrackerEvent};
