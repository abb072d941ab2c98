//! Error types for the torrent client core
//!
//! Every library operation reports failures through [`TorrentError`], whose
//! variants follow the failure taxonomy of the client: caller faults,
//! misbehaving remotes, choked or broken peer sessions, corrupt pieces and
//! exhausted trackers.

use std::fmt;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, TorrentError>;

/// Error type for torrent client operations
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentError {
    /// Caller fault: unknown infohash, unknown or disconnected peer,
    /// piece not requested or not possessed
    PreconditionError {
        message: String,
        context: Option<String>,
    },

    /// Malformed handshake or truncated wire message
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Malformed bencode
    DecodeError {
        message: String,
        position: usize,
    },

    /// Metainfo that decodes but lacks required structure
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Peer choked the client while a piece transfer was in flight
    PeerChokedError {
        peer: String,
        piece: u32,
    },

    /// Transport failure before, during or after the handshake
    PeerConnectError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Assembled piece does not match its declared SHA-1
    PieceHashError {
        index: u32,
    },

    /// Every tracker in every tier failed
    TrackerFailure {
        message: String,
    },

    /// Key/value store errors
    StorageError {
        message: String,
        key: Option<String>,
        source: Option<String>,
    },

    /// Listener and socket setup errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new PreconditionError
    pub fn precondition(message: impl Into<String>) -> Self {
        TorrentError::PreconditionError {
            message: message.into(),
            context: None,
        }
    }

    /// Create a new PreconditionError naming the offending value
    pub fn precondition_with_context(message: impl Into<String>, context: impl Into<String>) -> Self {
        TorrentError::PreconditionError {
            message: message.into(),
            context: Some(context.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new DecodeError at a byte offset
    pub fn decode_error(message: impl Into<String>, position: usize) -> Self {
        TorrentError::DecodeError {
            message: message.into(),
            position,
        }
    }

    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerChokedError
    pub fn peer_choked(peer: impl Into<String>, piece: u32) -> Self {
        TorrentError::PeerChokedError {
            peer: peer.into(),
            piece,
        }
    }

    /// Create a new PeerConnectError
    pub fn peer_connect_error(message: impl Into<String>) -> Self {
        TorrentError::PeerConnectError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerConnectError with peer address
    pub fn peer_connect_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerConnectError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerConnectError with peer and source
    pub fn peer_connect_error_full(
        message: impl Into<String>,
        peer: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::PeerConnectError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new PieceHashError
    pub fn piece_hash(index: u32) -> Self {
        TorrentError::PieceHashError { index }
    }

    /// Create a new TrackerFailure
    pub fn tracker_failure(message: impl Into<String>) -> Self {
        TorrentError::TrackerFailure {
            message: message.into(),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            key: None,
            source: None,
        }
    }

    /// Create a new StorageError with key and source
    pub fn storage_error_full(message: impl Into<String>, key: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            key: Some(key.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Whether this error indicates corrupt data or a misbehaving remote
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            TorrentError::ProtocolError { .. } | TorrentError::DecodeError { .. } | TorrentError::ParseError { .. }
        )
    }

    /// Whether the caller may retry the operation, possibly against another peer
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorrentError::PeerChokedError { .. }
                | TorrentError::PeerConnectError { .. }
                | TorrentError::PieceHashError { .. }
        )
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        let append = |slot: &mut Option<String>| {
            *slot = Some(slot.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
        };
        match &mut self {
            TorrentError::PreconditionError { context, .. } => append(context),
            TorrentError::ProtocolError { source, .. } => append(source),
            TorrentError::ParseError { source, .. } => append(source),
            TorrentError::PeerConnectError { source, .. } => append(source),
            TorrentError::StorageError { source, .. } => append(source),
            TorrentError::NetworkError { source, .. } => append(source),
            _ => {}
        }
        self
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::PreconditionError { message, context } => {
                if let Some(ctx) = context {
                    write!(f, "Precondition failed: {} ({})", message, ctx)
                } else {
                    write!(f, "Precondition failed: {}", message)
                }
            }
            TorrentError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            TorrentError::DecodeError { message, position } => {
                write!(f, "Decode error at byte {}: {}", position, message)
            }
            TorrentError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            TorrentError::PeerChokedError { peer, piece } => {
                write!(f, "Peer {} choked us while transferring piece {}", peer, piece)
            }
            TorrentError::PeerConnectError { message, peer, source } => match (peer, source) {
                (Some(p), Some(s)) => write!(f, "Peer connect error: {} (peer: {}, source: {})", message, p, s),
                (Some(p), None) => write!(f, "Peer connect error: {} (peer: {})", message, p),
                (None, Some(s)) => write!(f, "Peer connect error: {} (source: {})", message, s),
                (None, None) => write!(f, "Peer connect error: {}", message),
            },
            TorrentError::PieceHashError { index } => {
                write!(f, "Piece {} failed hash verification", index)
            }
            TorrentError::TrackerFailure { message } => {
                write!(f, "Tracker failure: {}", message)
            }
            TorrentError::StorageError { message, key, source } => match (key, source) {
                (Some(k), Some(s)) => write!(f, "Storage error: {} (key: {}, source: {})", message, k, s),
                (Some(k), None) => write!(f, "Storage error: {} (key: {})", message, k),
                (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                (None, None) => write!(f, "Storage error: {}", message),
            },
            TorrentError::NetworkError { message, address, source } => match (address, source) {
                (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                (None, None) => write!(f, "Network error: {}", message),
            },
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::NetworkError {
            message: err.to_string(),
            address: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::storage_error(format!("JSON error: {}", err))
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error(format!("Invalid address: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_display() {
        let err = TorrentError::precondition_with_context("torrent not loaded", "abcd");
        assert_eq!(err.to_string(), "Precondition failed: torrent not loaded (abcd)");
    }

    #[test]
    fn test_decode_error_is_protocol() {
        let err = TorrentError::decode_error("unexpected end of input", 7);
        assert!(err.is_protocol_error());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("byte 7"));
    }

    #[test]
    fn test_transfer_errors_are_retryable() {
        assert!(TorrentError::peer_choked("1.2.3.4:6881", 3).is_retryable());
        assert!(TorrentError::piece_hash(3).is_retryable());
        assert!(TorrentError::peer_connect_error("reset").is_retryable());
        assert!(!TorrentError::tracker_failure("all trackers failed").is_retryable());
    }

    #[test]
    fn test_with_context_appends() {
        let err = TorrentError::protocol_error_with_source("bad message", "peer")
            .with_context("while pumping");
        match err {
            TorrentError::ProtocolError { source, .. } => {
                assert_eq!(source.as_deref(), Some("peer: while pumping"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: TorrentError = io.into();
        assert!(matches!(err, TorrentError::NetworkError { .. }));
    }
}
