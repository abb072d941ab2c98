//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer-to-peer wire format.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, DEFAULT_PEER_ID_PREFIX, HANDSHAKE_LEN, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{read_frame, write_frame, BitTorrentWire, WireProtocol};
