//! Peer manager module
//!
//! Owns every session of one torrent together with the piece table and
//! statistics they mutate. The message pump, piece download and piece
//! upload all go through the same dispatch.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{Result, TorrentError};
use crate::peer::{
    ConnectedPeer, KnownPeer, PeerBitfield, PeerConnection, PeerRequestQueue, PeerState, QueueOutcome,
};
use crate::protocol::Message;
use crate::stats::{StatsTracker, TorrentStats};
use crate::storage::{PieceAssembly, PieceTable};
use crate::torrent::InfoHash;

/// A session slot; the connection is cleared when the transport fails
struct PeerSession {
    flags: ConnectedPeer,
    state: PeerState,
    connection: Option<PeerConnection>,
}

/// Manages all peer connections for a torrent
pub struct PeerManager {
    info_hash: InfoHash,
    our_peer_id: [u8; 20],
    config: ClientConfig,
    pieces: PieceTable,
    stats: StatsTracker,
    sessions: HashMap<KnownPeer, PeerSession>,
    bitfields: HashMap<KnownPeer, PeerBitfield>,
    requests: HashMap<KnownPeer, PeerRequestQueue>,
    shutdown: watch::Receiver<bool>,
}

impl PeerManager {
    /// Create a new peer manager
    pub fn new(
        info_hash: InfoHash,
        our_peer_id: [u8; 20],
        config: ClientConfig,
        pieces: PieceTable,
        stats: TorrentStats,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            info_hash,
            our_peer_id,
            config,
            pieces,
            stats: StatsTracker::new(stats),
            sessions: HashMap::new(),
            bitfields: HashMap::new(),
            requests: HashMap::new(),
            shutdown,
        }
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub fn pieces(&self) -> &PieceTable {
        &self.pieces
    }

    /// Mutable piece table; call [`PeerManager::refresh_possession`] after changes
    pub fn pieces_mut(&mut self) -> &mut PieceTable {
        &mut self.pieces
    }

    /// Recompute `left` and `have_pieces` from the piece table
    pub fn refresh_possession(&mut self) {
        let have = self.pieces.completed_count() as u32;
        let left = self.pieces.missing_bytes();
        self.stats.set_possession(have, left);
    }

    /// Statistics with running durations folded in
    pub fn stats(&self) -> TorrentStats {
        self.stats.snapshot()
    }

    pub fn start_timing(&mut self) {
        self.stats.start_timing();
    }

    pub fn stop_timing(&mut self) {
        self.stats.stop_timing();
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Whether a live session to `peer` exists
    pub fn is_connected(&self, peer: &KnownPeer) -> bool {
        self.sessions.get(peer).is_some_and(|s| s.state.is_connected())
    }

    fn session(&self, peer: &KnownPeer) -> Result<&PeerSession> {
        self.sessions
            .get(peer)
            .filter(|s| s.state.is_connected())
            .ok_or_else(|| TorrentError::precondition_with_context("Peer is not connected", peer.to_string()))
    }

    fn flags_mut(&mut self, peer: &KnownPeer) -> Option<&mut ConnectedPeer> {
        self.sessions.get_mut(peer).map(|s| &mut s.flags)
    }

    fn take_connection(&mut self, peer: &KnownPeer) -> Result<PeerConnection> {
        self.sessions
            .get_mut(peer)
            .filter(|s| s.state.is_connected())
            .and_then(|s| s.connection.take())
            .ok_or_else(|| TorrentError::precondition_with_context("Peer is not connected", peer.to_string()))
    }

    fn restore(&mut self, peer: &KnownPeer, connection: PeerConnection) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.connection = Some(connection);
        }
    }

    async fn mark_disconnected(&mut self, peer: &KnownPeer, connection: Option<PeerConnection>, reason: &TorrentError) {
        warn!("Dropping session with {}: {}", peer, reason);
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        session.state = PeerState::Disconnected;
        let connection = connection.or_else(|| session.connection.take());
        self.requests.remove(peer);
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    /// Send one message, dropping the session if the transport fails
    async fn send_to(&mut self, peer: &KnownPeer, message: &Message) -> Result<()> {
        let mut connection = self.take_connection(peer)?;
        match connection.send(message).await {
            Ok(()) => {
                self.restore(peer, connection);
                Ok(())
            }
            Err(e) => {
                self.mark_disconnected(peer, Some(connection), &e).await;
                Err(e)
            }
        }
    }

    /// Open a session to `peer`
    ///
    /// Sends our bitfield when anything is held, then handles whatever the
    /// peer sends within one read timeout.
    pub async fn connect(&mut self, peer: &KnownPeer) -> Result<()> {
        if self.is_connected(peer) {
            return Err(TorrentError::precondition_with_context("Peer is already connected", peer.to_string()));
        }

        let mut connection =
            PeerConnection::connect(peer, &self.info_hash, self.our_peer_id, self.config.connect_timeout()).await?;

        if self.pieces.completed_count() > 0 {
            let bitfield = self.pieces.bitfield();
            debug!("Sending bitfield ({} pieces held) to {}", self.pieces.completed_count(), peer);
            if let Err(e) = connection.send(&Message::Bitfield { bitfield }).await {
                connection.close().await;
                return Err(e);
            }
        }

        self.sessions.insert(
            peer.clone(),
            PeerSession {
                flags: ConnectedPeer::new(peer.clone()),
                state: PeerState::Connected,
                connection: Some(connection),
            },
        );
        info!("Connected to {} for {}", peer, self.info_hash);
        self.pump_peer(peer).await;
        Ok(())
    }

    /// Register a session accepted on the listening socket
    pub async fn register(&mut self, mut connection: PeerConnection) -> KnownPeer {
        let peer = connection.peer().clone();
        if self.pieces.completed_count() > 0 {
            if let Err(e) = connection.send(&Message::Bitfield { bitfield: self.pieces.bitfield() }).await {
                warn!("Inbound peer {} failed before bitfield: {}", peer, e);
            }
        }
        self.sessions.insert(
            peer.clone(),
            PeerSession {
                flags: ConnectedPeer::new(peer.clone()),
                state: PeerState::Connected,
                connection: Some(connection),
            },
        );
        info!("Registered inbound peer {} for {}", peer, self.info_hash);
        peer
    }

    /// Close the session with `peer`
    pub async fn disconnect(&mut self, peer: &KnownPeer) -> Result<()> {
        self.session(peer)?;
        if let Some(mut session) = self.sessions.remove(peer) {
            if let Some(connection) = session.connection.take() {
                connection.close().await;
            }
        }
        self.requests.remove(peer);
        info!("Disconnected from {}", peer);
        Ok(())
    }

    /// Close every session
    pub async fn close_all(&mut self) {
        for (peer, mut session) in self.sessions.drain() {
            if let Some(connection) = session.connection.take() {
                debug!("Closing session with {}", peer);
                connection.close().await;
            }
        }
        self.requests.clear();
    }

    /// Live sessions, ordered by peer
    pub fn connected_peers(&self) -> Vec<ConnectedPeer> {
        let mut peers: Vec<ConnectedPeer> = self
            .sessions
            .values()
            .filter(|s| s.state.is_connected())
            .map(|s| s.flags.clone())
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        peers
    }

    pub async fn choke(&mut self, peer: &KnownPeer) -> Result<()> {
        self.send_to(peer, &Message::Choke).await?;
        if let Some(flags) = self.flags_mut(peer) {
            flags.am_choking = true;
        }
        Ok(())
    }

    pub async fn unchoke(&mut self, peer: &KnownPeer) -> Result<()> {
        self.send_to(peer, &Message::Unchoke).await?;
        if let Some(flags) = self.flags_mut(peer) {
            flags.am_choking = false;
        }
        Ok(())
    }

    /// One pump pass: keep-alives, then drain every live session
    pub async fn pump(&mut self) {
        let peers: Vec<KnownPeer> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state.is_connected())
            .map(|(p, _)| p.clone())
            .collect();

        let interval = self.config.keep_alive_interval();
        for peer in &peers {
            let idle = self
                .sessions
                .get(peer)
                .and_then(|s| s.connection.as_ref())
                .is_some_and(|c| c.idle_for() >= interval);
            if idle {
                trace!("Sending keep-alive to {}", peer);
                let _ = self.send_to(peer, &Message::KeepAlive).await;
            }
        }

        for peer in &peers {
            if self.shutting_down() {
                break;
            }
            self.pump_peer(peer).await;
        }
    }

    async fn pump_peer(&mut self, peer: &KnownPeer) {
        let Ok(mut connection) = self.take_connection(peer) else {
            return;
        };
        let outcome = loop {
            if self.shutting_down() {
                break Ok(());
            }
            match connection.poll_message(self.config.read_timeout()).await {
                Ok(Some(message)) => {
                    if let Err(e) = self.dispatch(peer, &mut connection, message).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        match outcome {
            Ok(()) => self.restore(peer, connection),
            Err(e) => self.mark_disconnected(peer, Some(connection), &e).await,
        }
    }

    /// Whether `peer` announced a piece we are missing
    fn offers_missing(&self, peer: &KnownPeer) -> bool {
        self.bitfields.get(peer).is_some_and(|bits| {
            bits.pieces()
                .any(|index| (index as usize) < self.pieces.len() && !self.pieces.has(index))
        })
    }

    async fn become_interested(&mut self, peer: &KnownPeer, connection: &mut PeerConnection) -> Result<()> {
        let already = self.flags_mut(peer).map_or(true, |f| f.am_interested);
        if already {
            return Ok(());
        }
        connection.send(&Message::Interested).await?;
        if let Some(flags) = self.flags_mut(peer) {
            flags.am_interested = true;
        }
        debug!("Interested in {}", peer);
        Ok(())
    }

    /// Apply one incoming message to the session state
    async fn dispatch(&mut self, peer: &KnownPeer, connection: &mut PeerConnection, message: Message) -> Result<()> {
        match message {
            Message::KeepAlive => trace!("Keep-alive from {}", peer),
            Message::Choke => {
                if let Some(flags) = self.flags_mut(peer) {
                    flags.peer_choking = true;
                }
            }
            Message::Unchoke => {
                if let Some(flags) = self.flags_mut(peer) {
                    flags.peer_choking = false;
                }
            }
            Message::Interested => {
                if let Some(flags) = self.flags_mut(peer) {
                    flags.peer_interested = true;
                }
            }
            Message::NotInterested => {
                if let Some(flags) = self.flags_mut(peer) {
                    flags.peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                if piece_index as usize >= self.pieces.len() {
                    debug!("Ignoring have for piece {} from {}: out of range", piece_index, peer);
                    return Ok(());
                }
                self.bitfields.entry(peer.clone()).or_default().set(piece_index);
                if !self.pieces.has(piece_index) {
                    self.become_interested(peer, connection).await?;
                }
            }
            Message::Bitfield { bitfield } => {
                let known = bitfield.len().min(self.pieces.len());
                if known < bitfield.len() {
                    debug!("Truncating {}-byte bitfield from {} to {} pieces", bitfield.len(), peer, known);
                }
                self.bitfields.entry(peer.clone()).or_default().merge(&bitfield[..known]);
                if self.offers_missing(peer) {
                    self.become_interested(peer, connection).await?;
                }
            }
            Message::Request { index, begin, length } => {
                let capacity = self.config.max_pending_requests;
                let outcome = self.requests.entry(peer.clone()).or_default().push(index, begin, length, capacity);
                if outcome == QueueOutcome::Queued {
                    debug!("{} requested piece {} offset {} length {}", peer, index, begin, length);
                }
            }
            Message::Cancel { index, begin, length } => {
                if let Some(queue) = self.requests.get_mut(peer) {
                    if queue.cancel(index, begin, length) {
                        debug!("{} cancelled piece {} offset {}", peer, index, begin);
                    }
                }
            }
            Message::Piece { index, begin, .. } => {
                debug!("Ignoring unsolicited block {}:{} from {}", index, begin, peer);
            }
            Message::Unknown { id, .. } => debug!("Ignoring message id {} from {}", id, peer),
        }
        Ok(())
    }

    /// Download and verify one piece from `peer`
    pub async fn request_piece(&mut self, peer: &KnownPeer, index: u32) -> Result<()> {
        let peer_choking = self.session(peer)?.flags.peer_choking;
        let piece = self
            .pieces
            .get(index)
            .ok_or_else(|| TorrentError::precondition_with_context("No such piece", index.to_string()))?;
        let (length, windows, was_present) = (piece.length, piece.windows(), piece.is_present());
        if !self.bitfields.get(peer).is_some_and(|b| b.has(index)) {
            return Err(TorrentError::precondition_with_context(
                format!("Peer does not have piece {}", index),
                peer.to_string(),
            ));
        }
        if peer_choking {
            return Err(TorrentError::peer_choked(peer.to_string(), index));
        }

        info!("Requesting piece {} ({} bytes) from {}", index, length, peer);
        let mut connection = self.take_connection(peer)?;
        let mut assembly = PieceAssembly::new(index, length);
        let fetched = self.fetch_windows(peer, &mut connection, index, &windows, &mut assembly).await;

        if let Err(e) = fetched {
            self.stats.record_wasted(assembly.received());
            if matches!(e, TorrentError::PeerConnectError { .. }) || e.is_protocol_error() {
                self.mark_disconnected(peer, Some(connection), &e).await;
            } else {
                self.restore(peer, connection);
            }
            return Err(e);
        }
        self.restore(peer, connection);

        let data = assembly.into_inner();
        let installed = match self.pieces.get_mut(index) {
            Some(slot) => slot.install(data),
            None => Err(TorrentError::precondition_with_context("No such piece", index.to_string())),
        };
        if let Err(e) = installed {
            error!("Piece {} from {} failed verification", index, peer);
            self.stats.record_wasted(length as u64);
            return Err(e);
        }

        if was_present {
            self.stats.record_duplicate(length as u64);
        } else {
            self.stats.record_download(length as u64);
        }
        info!("Piece {} verified ({}/{} pieces)", index, self.pieces.completed_count(), self.pieces.len());
        self.announce_have(index).await;
        Ok(())
    }

    async fn fetch_windows(
        &mut self,
        peer: &KnownPeer,
        connection: &mut PeerConnection,
        index: u32,
        windows: &[(u32, u32)],
        assembly: &mut PieceAssembly,
    ) -> Result<()> {
        for &(offset, length) in windows {
            connection.send(&Message::Request { index, begin: offset, length }).await?;
            let deadline = Instant::now() + self.config.block_timeout();
            loop {
                if self.shutting_down() {
                    return Err(TorrentError::peer_connect_error_with_peer(
                        "Transfer interrupted by shutdown",
                        peer.to_string(),
                    ));
                }
                if Instant::now() >= deadline {
                    return Err(TorrentError::peer_connect_error_full(
                        "Timed out waiting for block",
                        peer.to_string(),
                        format!("piece {} offset {}", index, offset),
                    ));
                }
                match connection.poll_message(self.config.read_timeout()).await? {
                    None => continue,
                    Some(Message::Piece { index: got, begin, block }) if got == index && begin == offset => {
                        if block.len() != length as usize {
                            return Err(TorrentError::protocol_error_with_source(
                                "Block length mismatch",
                                format!("expected {}, got {}", length, block.len()),
                            ));
                        }
                        assembly.add_block(offset, &block)?;
                        trace!("Block {}:{} received from {}", index, offset, peer);
                        break;
                    }
                    Some(Message::Choke) => {
                        if let Some(flags) = self.flags_mut(peer) {
                            flags.peer_choking = true;
                        }
                        warn!("{} choked us during piece {}", peer, index);
                        return Err(TorrentError::peer_choked(peer.to_string(), index));
                    }
                    Some(other) => self.dispatch(peer, connection, other).await?,
                }
            }
        }
        Ok(())
    }

    /// Tell every peer about a new piece and drop interest where nothing is left
    async fn announce_have(&mut self, index: u32) {
        let peers: Vec<KnownPeer> = self.connected_peers().into_iter().map(|c| c.peer).collect();
        for peer in peers {
            if self.send_to(&peer, &Message::Have { piece_index: index }).await.is_err() {
                continue;
            }
            let interested = self.session(&peer).map(|s| s.flags.am_interested).unwrap_or(false);
            if interested && !self.offers_missing(&peer) && self.send_to(&peer, &Message::NotInterested).await.is_ok() {
                if let Some(flags) = self.flags_mut(&peer) {
                    flags.am_interested = false;
                }
                debug!("No longer interested in {}", peer);
            }
        }
    }

    /// Serve the pending requests of `peer` for piece `index`
    ///
    /// Keeps serving requests that arrive meanwhile and returns once the
    /// peer stays quiet for one read timeout.
    pub async fn send_piece(&mut self, peer: &KnownPeer, index: u32) -> Result<()> {
        self.session(peer)?;
        if !self.requests.get(peer).is_some_and(|q| q.has_pending(index)) {
            return Err(TorrentError::precondition_with_context(
                format!("No pending request for piece {}", index),
                peer.to_string(),
            ));
        }
        if !self.pieces.has(index) {
            return Err(TorrentError::precondition_with_context(
                format!("Piece {} is not held", index),
                peer.to_string(),
            ));
        }

        let mut connection = self.take_connection(peer)?;
        match self.serve_requests(peer, &mut connection, index).await {
            Ok(served) => {
                self.restore(peer, connection);
                info!("Served {} bytes of piece {} to {}", served, index, peer);
                Ok(())
            }
            Err(e) => {
                self.mark_disconnected(peer, Some(connection), &e).await;
                Err(e)
            }
        }
    }

    async fn serve_requests(&mut self, peer: &KnownPeer, connection: &mut PeerConnection, index: u32) -> Result<u64> {
        let mut served = 0u64;
        loop {
            while let Some((offset, length)) = self.requests.get_mut(peer).and_then(|q| q.pop(index)) {
                let Some(block) = self.pieces.get(index).and_then(|p| p.block(offset, length)) else {
                    warn!("{} requested {}:{}+{} outside the piece", peer, index, offset, length);
                    continue;
                };
                let block = block.to_vec();
                connection.send(&Message::Piece { index, begin: offset, block }).await?;
                self.stats.record_upload(length as u64);
                served += length as u64;
            }

            if self.shutting_down() {
                return Ok(served);
            }
            match connection.poll_message(self.config.read_timeout()).await? {
                Some(message) => self.dispatch(peer, connection, message).await?,
                None => return Ok(served),
            }
        }
    }

    /// Pieces each unchoked peer can serve, starting at `start` and wrapping
    pub fn available_pieces(&self, per_peer: usize, start: u32) -> BTreeMap<KnownPeer, Vec<u32>> {
        let missing: Vec<u32> = (0..self.pieces.len() as u32).filter(|&i| !self.pieces.has(i)).collect();
        let (from_start, before_start): (Vec<u32>, Vec<u32>) = missing.into_iter().partition(|&i| i >= start);

        self.sessions
            .iter()
            .filter(|(_, s)| s.state.is_connected() && !s.flags.peer_choking)
            .map(|(peer, _)| {
                let bits = self.bitfields.get(peer);
                let pieces = from_start
                    .iter()
                    .chain(before_start.iter())
                    .copied()
                    .filter(|&i| bits.is_some_and(|b| b.has(i)))
                    .take(per_peer)
                    .collect();
                (peer.clone(), pieces)
            })
            .collect()
    }

    /// Piece indices each peer is waiting on
    pub fn requested_pieces(&self) -> BTreeMap<KnownPeer, Vec<u32>> {
        self.requests
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(peer, queue)| (peer.clone(), queue.pieces()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::protocol::Handshake;
    use crate::storage::sha1_digest;

    const HASH: InfoHash = InfoHash([3u8; 20]);

    fn manager(data: &[u8], piece_length: u32) -> (PeerManager, watch::Sender<bool>) {
        let hashes: Vec<[u8; 20]> = data.chunks(piece_length as usize).map(sha1_digest).collect();
        let pieces = PieceTable::new(&hashes, piece_length, data.len() as u64);
        let stats = TorrentStats::new(data.len() as u64, hashes.len() as u32);
        let config = ClientConfig {
            port: 0,
            block_timeout_ms: 2_000,
            connect_timeout_ms: 2_000,
            ..ClientConfig::default()
        };
        let (tx, rx) = watch::channel(false);
        (PeerManager::new(HASH, [b'L'; 20], config, pieces, stats, rx), tx)
    }

    async fn fake_peer<F, Fut, T>(script: F) -> (KnownPeer, JoinHandle<T>)
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            socket.read_exact(&mut buf).await.unwrap();
            let theirs = Handshake::deserialize(&buf).unwrap();
            socket
                .write_all(&Handshake::new(theirs.info_hash, *b"-FK0001-abcdefghijkl").serialize())
                .await
                .unwrap();
            script(socket).await
        });
        (KnownPeer::from_addr(addr, None), handle)
    }

    async fn next_message(socket: &mut TcpStream) -> Option<Message> {
        let mut len = [0u8; 4];
        socket.read_exact(&mut len).await.ok()?;
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        socket.read_exact(&mut body).await.ok()?;
        Message::from_frame(&body).ok()
    }

    async fn send(socket: &mut TcpStream, message: Message) {
        socket.write_all(&message.serialize()).await.unwrap();
    }

    async fn wait_unchoked(manager: &mut PeerManager, peer: &KnownPeer) {
        for _ in 0..50 {
            manager.pump().await;
            if manager.connected_peers().iter().any(|p| p.peer == *peer && !p.peer_choking) {
                return;
            }
        }
        panic!("peer never unchoked");
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_request_piece_windows_and_have() {
        let data = pattern(32832);
        let (mut manager, _tx) = manager(&data, 32832);
        let served = data.clone();
        let (peer, fake) = fake_peer(move |mut socket| async move {
            send(&mut socket, Message::Bitfield { bitfield: vec![1] }).await;
            send(&mut socket, Message::Unchoke).await;
            let mut requests = Vec::new();
            let mut saw_have = false;
            while let Some(message) = next_message(&mut socket).await {
                match message {
                    Message::Request { index, begin, length } => {
                        requests.push((begin, length));
                        let block = served[begin as usize..(begin + length) as usize].to_vec();
                        send(&mut socket, Message::Piece { index, begin, block }).await;
                    }
                    Message::Have { piece_index: 0 } => saw_have = true,
                    Message::NotInterested => break,
                    _ => {}
                }
            }
            (requests, saw_have)
        })
        .await;

        manager.connect(&peer).await.unwrap();
        wait_unchoked(&mut manager, &peer).await;
        assert!(manager.connected_peers()[0].am_interested);

        manager.request_piece(&peer, 0).await.unwrap();
        let (requests, saw_have) = fake.await.unwrap();
        assert_eq!(requests, vec![(0, 16384), (16384, 16384), (32768, 64)]);
        assert!(saw_have);

        assert!(manager.pieces().has(0));
        let stats = manager.stats();
        assert_eq!(stats.downloaded, 32832);
        assert_eq!(stats.left, 0);
        assert_eq!(stats.have_pieces, 1);
        assert_eq!(stats.wasted, 0);
        assert!(!manager.connected_peers()[0].am_interested);
    }

    #[tokio::test]
    async fn test_out_of_range_have_and_bitfield_are_bounded() {
        let data = pattern(300);
        let (mut manager, _tx) = manager(&data, 100);
        let (peer, _fake) = fake_peer(|mut socket| async move {
            send(&mut socket, Message::Have { piece_index: u32::MAX }).await;
            send(&mut socket, Message::Bitfield { bitfield: vec![1; 4096] }).await;
            send(&mut socket, Message::Unchoke).await;
            while next_message(&mut socket).await.is_some() {}
        })
        .await;

        manager.connect(&peer).await.unwrap();
        wait_unchoked(&mut manager, &peer).await;

        assert!(manager.is_connected(&peer));
        assert_eq!(manager.bitfields[&peer].len(), 3);
        assert_eq!(manager.available_pieces(3, 0)[&peer], vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_hash_mismatch_leaves_slot_empty() {
        let data = pattern(100);
        let (mut manager, _tx) = manager(&data, 100);
        let (peer, _fake) = fake_peer(|mut socket| async move {
            send(&mut socket, Message::Bitfield { bitfield: vec![1] }).await;
            send(&mut socket, Message::Unchoke).await;
            while let Some(message) = next_message(&mut socket).await {
                if let Message::Request { index, begin, length } = message {
                    let block = vec![0u8; length as usize];
                    send(&mut socket, Message::Piece { index, begin, block }).await;
                }
            }
        })
        .await;

        manager.connect(&peer).await.unwrap();
        wait_unchoked(&mut manager, &peer).await;

        let err = manager.request_piece(&peer, 0).await.unwrap_err();
        assert_eq!(err, TorrentError::piece_hash(0));
        assert!(!manager.pieces().has(0));
        let stats = manager.stats();
        assert_eq!(stats.wasted, 100);
        assert_eq!(stats.downloaded, 0);
        assert_eq!(stats.left, 100);
        assert!(manager.is_connected(&peer));
    }

    #[tokio::test]
    async fn test_choke_during_transfer_counts_wasted() {
        let data = pattern(32832);
        let (mut manager, _tx) = manager(&data, 32832);
        let served = data.clone();
        let (peer, _fake) = fake_peer(move |mut socket| async move {
            send(&mut socket, Message::Bitfield { bitfield: vec![1] }).await;
            send(&mut socket, Message::Unchoke).await;
            let mut answered = false;
            while let Some(message) = next_message(&mut socket).await {
                if let Message::Request { index, begin, length } = message {
                    if answered {
                        continue;
                    }
                    answered = true;
                    let block = served[begin as usize..(begin + length) as usize].to_vec();
                    send(&mut socket, Message::Piece { index, begin, block }).await;
                    send(&mut socket, Message::Choke).await;
                }
            }
        })
        .await;

        manager.connect(&peer).await.unwrap();
        wait_unchoked(&mut manager, &peer).await;

        let err = manager.request_piece(&peer, 0).await.unwrap_err();
        assert!(matches!(err, TorrentError::PeerChokedError { piece: 0, .. }));
        let stats = manager.stats();
        assert_eq!(stats.wasted, 16384);
        assert_eq!(stats.downloaded, 0);
        assert!(manager.connected_peers()[0].peer_choking);

        let again = manager.request_piece(&peer, 0).await.unwrap_err();
        assert!(matches!(again, TorrentError::PeerChokedError { .. }));
    }

    #[tokio::test]
    async fn test_available_pieces_wraps_from_start() {
        let data = pattern(12);
        let (mut manager, _tx) = manager(&data, 4);
        let (peer, _fake) = fake_peer(|mut socket| async move {
            send(&mut socket, Message::Bitfield { bitfield: vec![0, 1, 1] }).await;
            send(&mut socket, Message::Unchoke).await;
            while next_message(&mut socket).await.is_some() {}
        })
        .await;

        manager.connect(&peer).await.unwrap();
        wait_unchoked(&mut manager, &peer).await;

        assert_eq!(manager.available_pieces(2, 2)[&peer], vec![2, 1]);
        assert_eq!(manager.available_pieces(1, 0)[&peer], vec![1]);
        assert_eq!(manager.available_pieces(5, 0)[&peer], vec![1, 2]);
    }

    #[tokio::test]
    async fn test_send_piece_serves_queued_and_new_requests() {
        let data = pattern(8);
        let (mut manager, _tx) = manager(&data, 8);
        manager.pieces_mut().get_mut(0).unwrap().install(data.clone()).unwrap();
        manager.refresh_possession();

        let (peer, fake) = fake_peer(|mut socket| async move {
            let mut burst = Vec::new();
            for (begin, length) in [(0, 4), (0, 4), (4, 4)] {
                burst.extend(Message::Request { index: 0, begin, length }.serialize());
            }
            socket.write_all(&burst).await.unwrap();

            let mut blocks = Vec::new();
            while let Some(message) = next_message(&mut socket).await {
                if let Message::Piece { begin, block, .. } = message {
                    blocks.push((begin, block));
                    if blocks.len() == 2 {
                        send(&mut socket, Message::Request { index: 0, begin: 0, length: 2 }).await;
                    }
                    if blocks.len() == 3 {
                        break;
                    }
                }
            }
            blocks
        })
        .await;

        manager.connect(&peer).await.unwrap();
        for _ in 0..50 {
            if manager.requested_pieces().get(&peer) == Some(&vec![0]) {
                break;
            }
            manager.pump().await;
        }
        assert_eq!(manager.requested_pieces()[&peer], vec![0]);

        manager.send_piece(&peer, 0).await.unwrap();
        let blocks = fake.await.unwrap();
        assert_eq!(
            blocks,
            vec![(0, data[..4].to_vec()), (4, data[4..].to_vec()), (0, data[..2].to_vec())]
        );
        assert_eq!(manager.stats().uploaded, 10);
        assert!(manager.requested_pieces().is_empty());

        let err = manager.send_piece(&peer, 0).await.unwrap_err();
        assert!(matches!(err, TorrentError::PreconditionError { .. }));
    }

    #[tokio::test]
    async fn test_transport_fault_marks_session_disconnected() {
        let data = pattern(8);
        let (mut manager, _tx) = manager(&data, 8);
        let (peer, fake) = fake_peer(|socket| async move { drop(socket) }).await;

        manager.connect(&peer).await.unwrap();
        fake.await.unwrap();
        for _ in 0..10 {
            manager.pump().await;
        }

        assert!(manager.connected_peers().is_empty());
        let err = manager.request_piece(&peer, 0).await.unwrap_err();
        assert!(matches!(err, TorrentError::PreconditionError { .. }));
        assert!(manager.disconnect(&peer).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_pump() {
        let data = pattern(8);
        let (mut manager, tx) = manager(&data, 8);
        let (peer, _fake) = fake_peer(|mut socket| async move {
            while next_message(&mut socket).await.is_some() {}
        })
        .await;
        manager.connect(&peer).await.unwrap();

        tx.send(true).unwrap();
        let started = Instant::now();
        manager.pump().await;
        assert!(started.elapsed() < std::time::Duration::from_millis(100));
        assert!(manager.is_connected(&peer));
    }
}
