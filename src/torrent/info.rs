//! Torrent information structures
//!
//! Provides the immutable view of a loaded torrent.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TorrentError;
use crate::storage::piece::sha1_digest;

/// SHA-1 of the raw `info` dictionary; the torrent's identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Hash the raw bytes of an `info` dictionary
    pub fn from_info_bytes(info_dict_bytes: &[u8]) -> Self {
        InfoHash(sha1_digest(info_dict_bytes))
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| TorrentError::precondition_with_context("Invalid infohash", e.to_string()))?;
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TorrentError::precondition_with_context("Infohash must be 20 bytes", s))?;
        Ok(InfoHash(hash))
    }
}

/// A file inside a torrent, located by its byte offset in the piece stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentFile {
    /// Path components joined with `/`
    pub name: String,
    /// Position in the file list
    pub index: u32,
    /// Offset of the first byte within the concatenated torrent data
    pub offset: u64,
    /// File size in bytes
    pub length: u64,
}

/// High-level torrent information
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentInfo {
    /// SHA1 hash of info dictionary
    pub info_hash: InfoHash,
    /// Torrent name
    pub name: String,
    /// Size of each piece in bytes
    pub piece_length: u32,
    /// Total size of all files
    pub total_length: u64,
    /// Files in torrent order
    pub files: Vec<TorrentFile>,
    /// List of piece hashes (each is a 20-byte SHA1 hash)
    pub pieces: Vec<[u8; 20]>,
    /// Announce tiers, `announce-list` if present, else the single `announce`
    pub announce_tiers: Vec<Vec<String>>,
}

impl TorrentInfo {
    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    /// Length of the piece at `index`
    pub fn piece_size(&self, index: u32) -> Option<u32> {
        let count = self.pieces.len() as u32;
        if index >= count {
            return None;
        }
        if index + 1 == count {
            Some((self.total_length - index as u64 * self.piece_length as u64) as u32)
        } else {
            Some(self.piece_length)
        }
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>, TorrentError> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error(format!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            )));
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_hex_roundtrip() {
        let hash = InfoHash::from_info_bytes(b"d4:name4:teste");
        let parsed: InfoHash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);
        assert_eq!(hash.to_string().len(), 40);
    }

    #[test]
    fn test_info_hash_rejects_bad_hex() {
        assert!("xyz".parse::<InfoHash>().is_err());
        assert!("abcd".parse::<InfoHash>().is_err());
    }

    #[test]
    fn test_piece_size_last_piece() {
        let info = TorrentInfo {
            info_hash: InfoHash([0u8; 20]),
            name: "test".to_string(),
            piece_length: 10,
            total_length: 25,
            files: vec![],
            pieces: vec![[0u8; 20]; 3],
            announce_tiers: vec![],
        };
        assert_eq!(info.piece_size(0), Some(10));
        assert_eq!(info.piece_size(2), Some(5));
        assert_eq!(info.piece_size(3), None);
    }

    #[test]
    fn test_parse_piece_hashes() {
        let bytes = [7u8; 40];
        let hashes = TorrentInfo::parse_piece_hashes(&bytes).unwrap();
        assert_eq!(hashes.len(), 2);
        assert!(TorrentInfo::parse_piece_hashes(&[0u8; 21]).is_err());
    }
}
