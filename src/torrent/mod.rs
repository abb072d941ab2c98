//! Torrent file handling module
//!
//! Metainfo parsing and the immutable description of a loaded torrent.

pub mod info;
pub mod parser;

pub use info::{InfoHash, TorrentFile, TorrentInfo};
pub use parser::TorrentParser;
