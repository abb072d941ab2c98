//! Peer connection module
//!
//! One TCP session to a peer: handshake in either role, then framed
//! messages. Inbound bytes are buffered so a read that times out never
//! loses part of a frame.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, TorrentError};
use crate::peer::KnownPeer;
use crate::protocol::{read_frame, BitTorrentWire, Handshake, Message, WireProtocol};
use crate::torrent::InfoHash;

/// Represents a connected peer
pub struct PeerConnection {
    /// Identity the session is registered under
    peer: KnownPeer,
    /// Peer id sent in the remote handshake
    remote_id: [u8; 20],
    stream: TcpStream,
    inbound: BytesMut,
    wire: BitTorrentWire,
    last_sent: Instant,
}

impl PeerConnection {
    /// Connect to `peer`, send our handshake and verify the reply
    pub async fn connect(
        peer: &KnownPeer,
        info_hash: &InfoHash,
        our_peer_id: [u8; 20],
        connect_timeout: Duration,
    ) -> Result<Self> {
        let addr = peer.addr();
        info!("Connecting to peer: {}", addr);

        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|e| {
                warn!("Connection timeout to {}", addr);
                TorrentError::peer_connect_error_full("Connection timeout", addr.to_string(), e.to_string())
            })?
            .map_err(|e| {
                error!("Failed to connect to {}: {}", addr, e);
                TorrentError::peer_connect_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;
        debug!("Connected to peer: {}", addr);

        let mut wire = BitTorrentWire;
        let mut stream = stream;
        let ours = Handshake::new(*info_hash.as_bytes(), our_peer_id);
        wire.write_handshake(&mut stream, &ours).await.map_err(|e| {
            error!("Failed to send handshake to {}: {}", addr, e);
            TorrentError::peer_connect_error_full("Failed to send handshake", addr.to_string(), e.to_string())
        })?;

        let theirs = timeout(connect_timeout, wire.read_handshake(&mut stream))
            .await
            .map_err(|e| TorrentError::peer_connect_error_full("Handshake timeout", addr.to_string(), e.to_string()))?
            .map_err(|e| {
                error!("Failed to read handshake from {}: {}", addr, e);
                TorrentError::peer_connect_error_full("Failed to read handshake", addr.to_string(), e.to_string())
            })?;

        if !theirs.validate(info_hash.as_bytes()) {
            return Err(TorrentError::peer_connect_error_full(
                "Handshake validation failed",
                addr.to_string(),
                "info hash mismatch",
            ));
        }

        info!("Handshake completed with {} (peer id {})", addr, theirs.peer_id_string());
        Ok(Self::established(peer.clone(), theirs.peer_id, stream))
    }

    /// Answer an inbound handshake
    ///
    /// `is_loaded` decides whether the requested torrent is served; an
    /// unknown info hash closes the socket with a precondition error.
    pub async fn accept(
        mut stream: TcpStream,
        our_peer_id: [u8; 20],
        handshake_timeout: Duration,
        is_loaded: impl FnOnce(&InfoHash) -> bool,
    ) -> Result<(InfoHash, Self)> {
        let addr: SocketAddr = stream.peer_addr()?;
        let mut wire = BitTorrentWire;

        let theirs = timeout(handshake_timeout, wire.read_handshake(&mut stream))
            .await
            .map_err(|e| TorrentError::peer_connect_error_full("Handshake timeout", addr.to_string(), e.to_string()))?
            .map_err(|e| {
                TorrentError::peer_connect_error_full("Failed to read handshake", addr.to_string(), e.to_string())
            })?;

        let info_hash = InfoHash(theirs.info_hash);
        if !is_loaded(&info_hash) {
            warn!("Inbound peer {} asked for unknown torrent {}", addr, info_hash);
            return Err(TorrentError::precondition_with_context(
                "Inbound handshake for a torrent that is not loaded",
                info_hash.to_hex(),
            ));
        }

        wire.write_handshake(&mut stream, &Handshake::new(theirs.info_hash, our_peer_id))
            .await
            .map_err(|e| {
                TorrentError::peer_connect_error_full("Failed to send handshake", addr.to_string(), e.to_string())
            })?;

        // The raw id stays on the connection; the known-peer entry is address only
        let peer = KnownPeer::from_addr(addr, None);
        info!("Accepted peer {} (peer id {}) for {}", peer, theirs.peer_id_string(), info_hash);
        Ok((info_hash, Self::established(peer, theirs.peer_id, stream)))
    }

    fn established(peer: KnownPeer, remote_id: [u8; 20], stream: TcpStream) -> Self {
        Self {
            peer,
            remote_id,
            stream,
            inbound: BytesMut::with_capacity(32 * 1024),
            wire: BitTorrentWire,
            last_sent: Instant::now(),
        }
    }

    /// Send a message to the peer
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        trace!("Sending {:?} to {}", message.message_id(), self.peer);
        self.wire.write_message(&mut self.stream, message).await.map_err(|e| {
            error!("Failed to send message to {}: {}", self.peer, e);
            TorrentError::peer_connect_error_full("Failed to send message", self.peer.to_string(), e.to_string())
        })?;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Next complete message, waiting at most `wait` for more bytes
    ///
    /// `Ok(None)` means nothing complete arrived in time. A closed or failed
    /// socket is a `PeerConnectError`, a malformed frame a `ProtocolError`.
    pub async fn poll_message(&mut self, wait: Duration) -> Result<Option<Message>> {
        if let Some(message) = self.buffered_message()? {
            return Ok(Some(message));
        }

        match timeout(wait, self.stream.read_buf(&mut self.inbound)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(TorrentError::peer_connect_error_with_peer(
                "Connection closed by peer",
                self.peer.to_string(),
            )),
            Ok(Ok(n)) => {
                trace!("Read {} bytes from {}", n, self.peer);
                self.buffered_message()
            }
            Ok(Err(e)) => Err(TorrentError::peer_connect_error_full(
                "Failed to read from peer",
                self.peer.to_string(),
                e.to_string(),
            )),
        }
    }

    fn buffered_message(&mut self) -> Result<Option<Message>> {
        match read_frame(&mut self.inbound)? {
            Some(body) => {
                let message = Message::from_frame(&body)?;
                debug!("Received {:?} from {}", message.message_id(), self.peer);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Time since the last message we sent
    pub fn idle_for(&self) -> Duration {
        self.last_sent.elapsed()
    }

    /// Identity of the session
    pub fn peer(&self) -> &KnownPeer {
        &self.peer
    }

    /// Peer id from the remote handshake
    pub fn remote_id(&self) -> &[u8; 20] {
        &self.remote_id
    }

    /// Close the connection
    pub async fn close(mut self) {
        use tokio::io::AsyncWriteExt;
        info!("Closing connection to peer: {}", self.peer);
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("buffered", &self.inbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const HASH: InfoHash = InfoHash([9u8; 20]);

    async fn pair() -> (PeerConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            socket.read_exact(&mut buf).await.unwrap();
            let theirs = Handshake::deserialize(&buf).unwrap();
            assert_eq!(theirs.peer_id, [b'L'; 20]);
            socket
                .write_all(&Handshake::new(theirs.info_hash, [b'R'; 20]).serialize())
                .await
                .unwrap();
            socket
        });
        let peer = KnownPeer::from_addr(addr, None);
        let conn = PeerConnection::connect(&peer, &HASH, [b'L'; 20], Duration::from_secs(2))
            .await
            .unwrap();
        (conn, remote.await.unwrap())
    }

    #[tokio::test]
    async fn test_connect_and_poll() {
        let (mut conn, mut remote) = pair().await;
        assert_eq!(conn.remote_id(), &[b'R'; 20]);

        assert!(conn.poll_message(Duration::from_millis(20)).await.unwrap().is_none());

        // Split a frame across two writes
        let bytes = Message::Have { piece_index: 3 }.serialize();
        remote.write_all(&bytes[..3]).await.unwrap();
        assert!(conn.poll_message(Duration::from_millis(50)).await.unwrap().is_none());
        remote.write_all(&bytes[3..]).await.unwrap();
        let message = conn.poll_message(Duration::from_millis(500)).await.unwrap();
        assert_eq!(message, Some(Message::Have { piece_index: 3 }));

        drop(remote);
        let err = conn.poll_message(Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, TorrentError::PeerConnectError { .. }));
    }

    #[tokio::test]
    async fn test_connect_rejects_wrong_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            socket.read_exact(&mut buf).await.unwrap();
            let _ = socket.write_all(&Handshake::new([1u8; 20], [b'R'; 20]).serialize()).await;
        });

        let err = PeerConnection::connect(&KnownPeer::from_addr(addr, None), &HASH, [b'L'; 20], Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TorrentError::PeerConnectError { .. }));
    }

    #[tokio::test]
    async fn test_accept_unknown_torrent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut socket = TcpStream::connect(addr).await.unwrap();
            socket.write_all(&Handshake::new([7u8; 20], [b'R'; 20]).serialize()).await.unwrap();
            let mut buf = Vec::new();
            // Closed without a reply
            socket.read_to_end(&mut buf).await.unwrap_or(0)
        });

        let (stream, _) = listener.accept().await.unwrap();
        let err = PeerConnection::accept(stream, [b'L'; 20], Duration::from_secs(2), |_| false)
            .await
            .unwrap_err();
        assert!(matches!(err, TorrentError::PreconditionError { .. }));
        assert_eq!(client.await.unwrap(), 0);
    }
}
