//! Piece storage module
//!
//! Holds the piece table of a loaded torrent and the scratch buffer used
//! while a piece is assembled from blocks.

use sha1::{Digest, Sha1};
use tracing::{debug, trace, warn};

use crate::error::{Result, TorrentError};

/// Size of a single request window
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// SHA-1 digest of a byte slice
pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Represents a piece of the torrent
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    /// Piece index
    pub index: u32,
    /// Declared length in bytes
    pub length: u32,
    /// Expected SHA1 hash
    pub hash: [u8; 20],
    /// Verified piece data; `None` until downloaded
    pub data: Option<Vec<u8>>,
}

impl Piece {
    /// Create a new, not yet downloaded piece
    pub fn new(index: u32, length: u32, hash: [u8; 20]) -> Self {
        Self {
            index,
            length,
            hash,
            data: None,
        }
    }

    /// Whether verified data is present
    pub fn is_present(&self) -> bool {
        self.data.is_some()
    }

    /// Check a candidate buffer against the declared hash
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() == self.length as usize && sha1_digest(data) == self.hash
    }

    /// Install `data` if it verifies; the slot is left untouched otherwise
    pub fn install(&mut self, data: Vec<u8>) -> Result<()> {
        if !self.matches(&data) {
            warn!("Piece {} failed verification ({} bytes)", self.index, data.len());
            return Err(TorrentError::piece_hash(self.index));
        }
        debug!("Piece {} verified and installed", self.index);
        self.data = Some(data);
        Ok(())
    }

    /// Re-verify installed data, clearing it on mismatch
    pub fn recheck(&mut self) -> bool {
        let valid = match &self.data {
            Some(data) => self.matches(data),
            None => false,
        };
        if !valid && self.data.take().is_some() {
            warn!("Piece {} no longer matches its hash; cleared", self.index);
        }
        valid
    }

    /// Request windows covering the piece: `(offset, length)` pairs of at most
    /// [`BLOCK_SIZE`] bytes, the last one possibly shorter
    pub fn windows(&self) -> Vec<(u32, u32)> {
        let mut windows = Vec::with_capacity(self.length.div_ceil(BLOCK_SIZE) as usize);
        let mut offset = 0u32;
        while offset < self.length {
            let len = BLOCK_SIZE.min(self.length - offset);
            windows.push((offset, len));
            offset += len;
        }
        windows
    }

    /// Read `length` bytes at `offset` from installed data
    pub fn block(&self, offset: u32, length: u32) -> Option<&[u8]> {
        let data = self.data.as_ref()?;
        let start = offset as usize;
        let end = start.checked_add(length as usize)?;
        data.get(start..end)
    }
}

/// Buffer for a piece being assembled from received blocks
#[derive(Debug)]
pub struct PieceAssembly {
    index: u32,
    buffer: Vec<u8>,
    received: u64,
}

impl PieceAssembly {
    /// Start assembling a piece of the given length
    pub fn new(index: u32, length: u32) -> Self {
        Self {
            index,
            buffer: vec![0u8; length as usize],
            received: 0,
        }
    }

    /// Copy a block into place
    pub fn add_block(&mut self, offset: u32, block: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + block.len();
        if end > self.buffer.len() {
            return Err(TorrentError::protocol_error(format!(
                "Block at offset {} with length {} overflows piece {} of {} bytes",
                offset,
                block.len(),
                self.index,
                self.buffer.len()
            )));
        }
        trace!("Piece {}: copying {} bytes at offset {}", self.index, block.len(), offset);
        self.buffer[start..end].copy_from_slice(block);
        self.received += block.len() as u64;
        Ok(())
    }

    /// Bytes received so far, counted towards wasted on failure
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Hand over the assembled buffer
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

/// Piece table of a loaded torrent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PieceTable {
    pieces: Vec<Piece>,
}

impl PieceTable {
    /// Build an empty table from piece hashes
    pub fn new(piece_hashes: &[[u8; 20]], piece_length: u32, total_size: u64) -> Self {
        let count = piece_hashes.len();
        let pieces = piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                // Last piece may be smaller
                let length = if index + 1 == count {
                    (total_size - index as u64 * piece_length as u64) as u32
                } else {
                    piece_length
                };
                Piece::new(index as u32, length, *hash)
            })
            .collect();
        Self { pieces }
    }

    /// Wrap pieces restored from storage
    pub fn from_pieces(mut pieces: Vec<Piece>) -> Self {
        pieces.sort_by_key(|p| p.index);
        Self { pieces }
    }

    /// Get a piece by index
    pub fn get(&self, index: u32) -> Option<&Piece> {
        self.pieces.get(index as usize)
    }

    /// Get a mutable piece by index
    pub fn get_mut(&mut self, index: u32) -> Option<&mut Piece> {
        self.pieces.get_mut(index as usize)
    }

    /// Get all pieces
    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Mutable access to all pieces
    pub fn pieces_mut(&mut self) -> &mut [Piece] {
        &mut self.pieces
    }

    /// Get the number of pieces
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    /// Whether the table has no pieces
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Whether the piece at `index` has verified data
    pub fn has(&self, index: u32) -> bool {
        self.get(index).is_some_and(Piece::is_present)
    }

    /// Possession map, one byte per piece
    pub fn bitfield(&self) -> Vec<u8> {
        self.pieces.iter().map(|p| p.is_present() as u8).collect()
    }

    /// Get the number of completed pieces
    pub fn completed_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_present()).count()
    }

    /// Bytes still missing
    pub fn missing_bytes(&self) -> u64 {
        self.pieces
            .iter()
            .filter(|p| !p.is_present())
            .map(|p| p.length as u64)
            .sum()
    }

    /// Concatenated data of all pieces, zero-filled where missing
    pub fn concatenated(&self) -> Vec<u8> {
        let total: u64 = self.pieces.iter().map(|p| p.length as u64).sum();
        let mut out = Vec::with_capacity(total as usize);
        for piece in &self.pieces {
            match &piece.data {
                Some(data) => out.extend_from_slice(data),
                None => out.resize(out.len() + piece.length as usize, 0),
            }
        }
        out
    }
}
