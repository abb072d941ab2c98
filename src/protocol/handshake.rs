//! BitTorrent handshake protocol
//!
//! Handles the initial handshake between peers.

use bytes::{BufMut, BytesMut};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, TorrentError};

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Size of an encoded handshake
pub const HANDSHAKE_LEN: usize = 68;

/// Default client prefix of generated peer ids
pub const DEFAULT_PEER_ID_PREFIX: &str = "-RT0100-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved bytes, always sent as zero
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a peer ID: `prefix` padded or cut to 8 bytes, then 12
    /// random alphanumeric characters
    pub fn generate_peer_id(prefix: &str) -> [u8; 20] {
        let mut peer_id = [b'-'; 20];
        let prefix = prefix.as_bytes();
        let len = prefix.len().min(8);
        peer_id[..len].copy_from_slice(&prefix[..len]);
        for (slot, byte) in peer_id[8..]
            .iter_mut()
            .zip(rand::thread_rng().sample_iter(&Alphanumeric))
        {
            *slot = byte;
        }
        info!("Generated new peer ID: {}", String::from_utf8_lossy(&peer_id));
        peer_id
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing handshake");
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        trace!("Handshake serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Deserialize a handshake from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LEN {
            error!("Handshake data too short: expected {} bytes, got {}", HANDSHAKE_LEN, data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Handshake data too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            ));
        }

        let protocol_length = data[0];
        if protocol_length != PROTOCOL_LENGTH {
            error!("Invalid protocol length: expected {}, got {}", PROTOCOL_LENGTH, protocol_length);
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, protocol_length),
            ));
        }

        if &data[1..20] != PROTOCOL_STRING.as_bytes() {
            error!("Invalid protocol string");
            return Err(TorrentError::protocol_error("Invalid protocol string"));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        if reserved != [0u8; 8] {
            debug!("Peer advertises reserved bits {}", hex::encode(reserved));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        debug!(
            "Handshake info_hash: {}, peer_id: {}",
            hex::encode(info_hash),
            String::from_utf8_lossy(&peer_id)
        );

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Check that the handshake is for the expected torrent
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!("Handshake validation failed: info hash mismatch");
            warn!("  Expected: {}", hex::encode(expected_info_hash));
            warn!("  Got:      {}", hex::encode(self.info_hash));
            return false;
        }
        true
    }

    /// Peer id as text, lossy for non-UTF-8 ids
    pub fn peer_id_string(&self) -> String {
        String::from_utf8_lossy(&self.peer_id).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let serialized = handshake.serialize();
        assert_eq!(serialized.len(), HANDSHAKE_LEN);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");
        assert_eq!(&serialized[20..28], &[0u8; 8]);
        assert_eq!(&serialized[28..48], &[1u8; 20]);

        let parsed = Handshake::deserialize(&serialized).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn test_rejects_bad_protocol() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[0] = 18;
        assert!(matches!(
            Handshake::deserialize(&bytes),
            Err(TorrentError::ProtocolError { .. })
        ));

        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[5] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
        assert!(Handshake::deserialize(&bytes[..40]).is_err());
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = Handshake::generate_peer_id(DEFAULT_PEER_ID_PREFIX);
        assert_eq!(&peer_id[0..8], b"-RT0100-");
        assert!(peer_id[8..].iter().all(u8::is_ascii_alphanumeric));
    }

    #[test]
    fn test_handshake_validate() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]));
        assert!(!handshake.validate(&[3u8; 20]));
    }
}
