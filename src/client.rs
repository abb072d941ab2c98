//! Torrent orchestrator
//!
//! [`TorrentClient`] owns every loaded torrent, the tracker client, the
//! persisted state and the listening socket. Torrents are addressed by the
//! hex form of their infohash.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{Result, TorrentError};
use crate::peer::{ConnectedPeer, KnownPeer, PeerConnection, PeerManager};
use crate::protocol::Handshake;
use crate::stats::{ScrapeData, TorrentStats};
use crate::storage::{KeyValueStore, PieceTable, StateStore};
use crate::torrent::{InfoHash, TorrentInfo, TorrentParser};
use crate::tracker::{AnnounceParams, AnnounceTiers, HttpFetcher, TrackerClient, TrackerEvent};

/// Raises the shutdown signal observed by the pump and upload loops
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.0.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

/// In-memory state of one loaded torrent
struct LoadedTorrent {
    info: TorrentInfo,
    tiers: AnnounceTiers,
    known_peers: BTreeSet<KnownPeer>,
    tracker_stats: BTreeMap<String, ScrapeData>,
    peers: PeerManager,
}

impl LoadedTorrent {
    fn trackers(&self) -> Vec<String> {
        let mut urls: BTreeSet<String> = self.tiers.urls().cloned().collect();
        urls.extend(self.info.announce_tiers.iter().flatten().cloned());
        urls.extend(self.tracker_stats.keys().cloned());
        urls.into_iter().collect()
    }
}

fn not_loaded(hash: &InfoHash) -> TorrentError {
    TorrentError::precondition_with_context("Torrent is not loaded", hash.to_hex())
}

/// BitTorrent client core
pub struct TorrentClient {
    config: ClientConfig,
    peer_id: [u8; 20],
    state: StateStore,
    tracker: TrackerClient,
    torrents: HashMap<InfoHash, LoadedTorrent>,
    listener: Option<TcpListener>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl TorrentClient {
    /// Create a client and restore every torrent recorded as loaded in `store`
    pub async fn new(
        store: Arc<dyn KeyValueStore>,
        fetcher: Arc<dyn HttpFetcher>,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let peer_id = Handshake::generate_peer_id(&config.peer_id_prefix);
        let (shutdown, _) = watch::channel(false);

        let mut client = Self {
            tracker: TrackerClient::new(fetcher, peer_id),
            state: StateStore::new(store),
            config,
            peer_id,
            torrents: HashMap::new(),
            listener: None,
            shutdown: Arc::new(shutdown),
        };
        client.restore().await?;
        Ok(client)
    }

    async fn restore(&mut self) -> Result<()> {
        for hash in self.state.loaded().await? {
            let Some(metainfo) = self.state.metainfo(&hash).await? else {
                warn!("Torrent {} is listed as loaded but has no metainfo; skipping", hash);
                continue;
            };
            let info = TorrentParser::parse_bytes(&metainfo)?;

            let tiers = self
                .state
                .announces(&hash)
                .await?
                .unwrap_or_else(|| info.announce_tiers.clone());
            let known_peers = self.state.peers(&hash).await?;
            let mut tracker_stats = BTreeMap::new();
            for url in tiers.iter().flatten() {
                if let Some(data) = self.state.tracker_stat(&hash, url).await? {
                    tracker_stats.insert(url.clone(), data);
                }
            }
            let pieces = match self.state.pieces(&hash).await? {
                Some(pieces) => PieceTable::from_pieces(pieces),
                None => PieceTable::new(&info.pieces, info.piece_length, info.total_length),
            };
            let stats = self
                .state
                .torrent_stats(&hash)
                .await?
                .unwrap_or_else(|| TorrentStats::new(info.total_length, info.piece_count() as u32));

            info!(
                "Restored torrent '{}' ({}): {}/{} pieces, {} known peers",
                info.name,
                hash,
                pieces.completed_count(),
                pieces.len(),
                known_peers.len()
            );
            let torrent = self.assemble(info, AnnounceTiers::new(tiers), known_peers, tracker_stats, pieces, stats);
            self.torrents.insert(hash, torrent);
        }
        Ok(())
    }

    fn assemble(
        &self,
        info: TorrentInfo,
        tiers: AnnounceTiers,
        known_peers: BTreeSet<KnownPeer>,
        tracker_stats: BTreeMap<String, ScrapeData>,
        pieces: PieceTable,
        stats: TorrentStats,
    ) -> LoadedTorrent {
        let mut peers = PeerManager::new(
            info.info_hash,
            self.peer_id,
            self.config.clone(),
            pieces,
            stats,
            self.shutdown.subscribe(),
        );
        if self.listener.is_some() {
            peers.start_timing();
        }
        LoadedTorrent {
            info,
            tiers,
            known_peers,
            tracker_stats,
            peers,
        }
    }

    /// Our 20-byte peer id
    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Address of the listening socket while started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Infohashes of every loaded torrent, sorted
    pub fn loaded(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self.torrents.keys().map(InfoHash::to_hex).collect();
        hashes.sort();
        hashes
    }

    fn torrent(&self, info_hash: &str) -> Result<(InfoHash, &LoadedTorrent)> {
        let hash: InfoHash = info_hash.parse()?;
        let torrent = self.torrents.get(&hash).ok_or_else(|| not_loaded(&hash))?;
        Ok((hash, torrent))
    }

    /// Parsed metainfo of a loaded torrent
    pub fn info(&self, info_hash: &str) -> Result<&TorrentInfo> {
        Ok(&self.torrent(info_hash)?.1.info)
    }

    /// Load a torrent from metainfo bytes, returning its infohash
    pub async fn load(&mut self, metainfo: &[u8]) -> Result<String> {
        let info = TorrentParser::parse_bytes(metainfo)?;
        let hash = info.info_hash;
        if self.torrents.contains_key(&hash) {
            return Err(TorrentError::precondition_with_context("Torrent is already loaded", hash.to_hex()));
        }

        let pieces = PieceTable::new(&info.pieces, info.piece_length, info.total_length);
        let stats = TorrentStats::new(info.total_length, info.piece_count() as u32);

        self.state.put_metainfo(&hash, metainfo).await?;
        self.state.put_announces(&hash, &info.announce_tiers).await?;
        self.state.put_pieces(&hash, &pieces).await?;
        self.state.put_files(&hash, &info.files).await?;
        self.state.put_torrent_stats(&hash, &stats).await?;

        let tiers = AnnounceTiers::new(info.announce_tiers.clone());
        info!("Loaded torrent '{}' ({})", info.name, hash);
        let torrent = self.assemble(info, tiers, BTreeSet::new(), BTreeMap::new(), pieces, stats);
        self.torrents.insert(hash, torrent);
        self.persist_loaded().await?;
        Ok(hash.to_hex())
    }

    /// Drop a torrent and every record persisted for it
    pub async fn unload(&mut self, info_hash: &str) -> Result<()> {
        let hash: InfoHash = info_hash.parse()?;
        let mut torrent = self.torrents.remove(&hash).ok_or_else(|| not_loaded(&hash))?;
        torrent.peers.close_all().await;
        self.state.delete_torrent(&hash, &torrent.trackers()).await?;
        self.persist_loaded().await?;
        info!("Unloaded torrent '{}' ({})", torrent.info.name, hash);
        Ok(())
    }

    async fn persist_loaded(&self) -> Result<()> {
        let mut hashes: Vec<InfoHash> = self.torrents.keys().copied().collect();
        hashes.sort();
        self.state.set_loaded(&hashes).await
    }

    /// Current tracker tiers, reflecting shuffles and promotions
    pub fn announces(&self, info_hash: &str) -> Result<Vec<Vec<String>>> {
        Ok(self.torrent(info_hash)?.1.tiers.tiers().to_vec())
    }

    /// Announce to the first tracker that answers, returning its interval
    pub async fn announce(
        &mut self,
        info_hash: &str,
        event: TrackerEvent,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> Result<u32> {
        let hash: InfoHash = info_hash.parse()?;
        let port = self.local_addr().map_or(self.config.port, |addr| addr.port());
        let torrent = self.torrents.get_mut(&hash).ok_or_else(|| not_loaded(&hash))?;
        let params = AnnounceParams {
            event,
            port,
            uploaded,
            downloaded,
            left,
        };

        let result = self
            .tracker
            .announce(&hash, &mut torrent.tiers, &params, &mut torrent.tracker_stats)
            .await;
        if let Ok(success) = &result {
            let before = torrent.known_peers.len();
            torrent.known_peers.extend(success.peers.iter().cloned());
            debug!(
                "{} new peers for {} from {}",
                torrent.known_peers.len() - before,
                hash,
                success.tracker
            );
        }

        Self::persist_tracker_state(&self.state, &hash, torrent).await?;
        result.map(|success| success.interval)
    }

    /// Scrape every tracker of a torrent
    pub async fn scrape(&mut self, info_hash: &str) -> Result<BTreeMap<String, ScrapeData>> {
        let hash: InfoHash = info_hash.parse()?;
        let torrent = self.torrents.get_mut(&hash).ok_or_else(|| not_loaded(&hash))?;
        self.tracker
            .scrape(&hash, &torrent.tiers, &mut torrent.tracker_stats)
            .await;
        Self::persist_tracker_state(&self.state, &hash, torrent).await?;
        Ok(torrent.tracker_stats.clone())
    }

    async fn persist_tracker_state(state: &StateStore, hash: &InfoHash, torrent: &LoadedTorrent) -> Result<()> {
        state.put_announces(hash, torrent.tiers.tiers()).await?;
        state.put_peers(hash, &torrent.known_peers).await?;
        for (tracker, data) in &torrent.tracker_stats {
            state.put_tracker_stat(hash, tracker, data).await?;
        }
        Ok(())
    }

    /// Forget a peer
    pub async fn invalidate_peer(&mut self, info_hash: &str, peer: &KnownPeer) -> Result<()> {
        let hash: InfoHash = info_hash.parse()?;
        let torrent = self.torrents.get_mut(&hash).ok_or_else(|| not_loaded(&hash))?;
        if torrent.known_peers.remove(peer) {
            debug!("Invalidated peer {} of {}", peer, hash);
            self.state.put_peers(&hash, &torrent.known_peers).await?;
        }
        Ok(())
    }

    /// Known peers in address order
    pub fn known_peers(&self, info_hash: &str) -> Result<Vec<KnownPeer>> {
        Ok(self.torrent(info_hash)?.1.known_peers.iter().cloned().collect())
    }

    /// Latest outcome per contacted tracker
    pub fn tracker_stats(&self, info_hash: &str) -> Result<BTreeMap<String, ScrapeData>> {
        Ok(self.torrent(info_hash)?.1.tracker_stats.clone())
    }

    pub fn torrent_stats(&self, info_hash: &str) -> Result<TorrentStats> {
        Ok(self.torrent(info_hash)?.1.peers.stats())
    }

    /// Bind the listening socket and start duration accounting
    pub async fn start(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Err(TorrentError::precondition("Client is already started"));
        }
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!("Failed to bind {}: {}", addr, e);
            TorrentError::network_error_full("Failed to bind listening socket", addr.to_string(), e.to_string())
        })?;
        info!("Listening for peers on {}", listener.local_addr()?);
        self.listener = Some(listener);
        self.shutdown.send_replace(false);
        for torrent in self.torrents.values_mut() {
            torrent.peers.start_timing();
        }
        Ok(())
    }

    /// Close every session and the listener, then persist statistics
    ///
    /// Pieces are already persisted as they are installed.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.send_replace(true);
        self.listener = None;
        for (hash, torrent) in self.torrents.iter_mut() {
            torrent.peers.close_all().await;
            torrent.peers.stop_timing();
            self.state.put_torrent_stats(hash, &torrent.peers.stats()).await?;
        }
        info!("Client stopped");
        Ok(())
    }

    fn torrent_mut(&mut self, info_hash: &str) -> Result<(InfoHash, &mut LoadedTorrent)> {
        let hash: InfoHash = info_hash.parse()?;
        let torrent = self.torrents.get_mut(&hash).ok_or_else(|| not_loaded(&hash))?;
        Ok((hash, torrent))
    }

    /// Open a session to a known peer
    pub async fn connect(&mut self, info_hash: &str, peer: &KnownPeer) -> Result<()> {
        let (_, torrent) = self.torrent_mut(info_hash)?;
        if !torrent.known_peers.contains(peer) {
            return Err(TorrentError::precondition_with_context("Peer is not known", peer.to_string()));
        }
        torrent.peers.connect(peer).await
    }

    pub async fn disconnect(&mut self, info_hash: &str, peer: &KnownPeer) -> Result<()> {
        self.torrent_mut(info_hash)?.1.peers.disconnect(peer).await
    }

    pub fn connected_peers(&self, info_hash: &str) -> Result<Vec<ConnectedPeer>> {
        Ok(self.torrent(info_hash)?.1.peers.connected_peers())
    }

    pub async fn choke(&mut self, info_hash: &str, peer: &KnownPeer) -> Result<()> {
        self.torrent_mut(info_hash)?.1.peers.choke(peer).await
    }

    pub async fn unchoke(&mut self, info_hash: &str, peer: &KnownPeer) -> Result<()> {
        self.torrent_mut(info_hash)?.1.peers.unchoke(peer).await
    }

    /// One pump tick: every session of every torrent, then pending accepts
    ///
    /// Expected to be called often; each socket waits at most one read
    /// timeout.
    pub async fn handle_small_messages(&mut self) -> Result<()> {
        for torrent in self.torrents.values_mut() {
            torrent.peers.pump().await;
        }

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let accepted = match &self.listener {
                Some(listener) => timeout(self.config.read_timeout(), listener.accept()).await,
                None => break,
            };
            match accepted {
                Err(_) => break,
                Ok(Ok((stream, addr))) => {
                    debug!("Inbound connection from {}", addr);
                    self.accept_inbound(stream).await?;
                }
                Ok(Err(e)) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn accept_inbound(&mut self, stream: TcpStream) -> Result<()> {
        let loaded: HashSet<InfoHash> = self.torrents.keys().copied().collect();
        let accepted = PeerConnection::accept(stream, self.peer_id, self.config.connect_timeout(), |hash| {
            loaded.contains(hash)
        })
        .await;
        let (hash, connection) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Rejected inbound peer: {}", e);
                return Ok(());
            }
        };
        let Some(torrent) = self.torrents.get_mut(&hash) else {
            return Ok(());
        };
        let peer = torrent.peers.register(connection).await;
        if torrent.known_peers.insert(peer) {
            self.state.put_peers(&hash, &torrent.known_peers).await?;
        }
        Ok(())
    }

    /// Download and verify one piece from a connected peer
    pub async fn request_piece(&mut self, info_hash: &str, peer: &KnownPeer, index: u32) -> Result<()> {
        let hash: InfoHash = info_hash.parse()?;
        let torrent = self.torrents.get_mut(&hash).ok_or_else(|| not_loaded(&hash))?;
        let result = torrent.peers.request_piece(peer, index).await;
        if result.is_ok() {
            if let Some(piece) = torrent.peers.pieces().get(index) {
                self.state.put_piece(&hash, piece).await?;
            }
        }
        self.state.put_torrent_stats(&hash, &torrent.peers.stats()).await?;
        result
    }

    /// Serve the pending requests of a peer for one piece
    pub async fn send_piece(&mut self, info_hash: &str, peer: &KnownPeer, index: u32) -> Result<()> {
        let hash: InfoHash = info_hash.parse()?;
        let torrent = self.torrents.get_mut(&hash).ok_or_else(|| not_loaded(&hash))?;
        let result = torrent.peers.send_piece(peer, index).await;
        self.state.put_torrent_stats(&hash, &torrent.peers.stats()).await?;
        result
    }

    /// Up to `per_peer` pieces each unchoked peer can give us, from `start` on
    pub fn available_pieces(
        &self,
        info_hash: &str,
        per_peer: usize,
        start: u32,
    ) -> Result<BTreeMap<KnownPeer, Vec<u32>>> {
        Ok(self.torrent(info_hash)?.1.peers.available_pieces(per_peer, start))
    }

    pub fn requested_pieces(&self, info_hash: &str) -> Result<BTreeMap<KnownPeer, Vec<u32>>> {
        Ok(self.torrent(info_hash)?.1.peers.requested_pieces())
    }

    /// File contents keyed by file name; missing pieces read as zeros
    pub fn files(&self, info_hash: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let (_, torrent) = self.torrent(info_hash)?;
        let data = torrent.peers.pieces().concatenated();
        Ok(torrent
            .info
            .files
            .iter()
            .map(|file| {
                let start = (file.offset as usize).min(data.len());
                let end = (start + file.length as usize).min(data.len());
                (file.name.clone(), data[start..end].to_vec())
            })
            .collect())
    }

    /// Install every piece covered by `files` that verifies; returns how many
    pub async fn load_files(&mut self, info_hash: &str, files: &BTreeMap<String, Vec<u8>>) -> Result<usize> {
        let hash: InfoHash = info_hash.parse()?;
        let torrent = self.torrents.get_mut(&hash).ok_or_else(|| not_loaded(&hash))?;

        let mut data = vec![0u8; torrent.info.total_length as usize];
        for file in &torrent.info.files {
            let Some(content) = files.get(&file.name) else {
                debug!("No content supplied for {}", file.name);
                continue;
            };
            let start = file.offset as usize;
            let len = content.len().min(file.length as usize);
            data[start..start + len].copy_from_slice(&content[..len]);
        }

        let piece_length = torrent.info.piece_length as usize;
        let mut installed = 0;
        for piece in torrent.peers.pieces_mut().pieces_mut() {
            let start = piece.index as usize * piece_length;
            let Some(slice) = data.get(start..start + piece.length as usize) else {
                continue;
            };
            if !piece.is_present() && piece.install(slice.to_vec()).is_ok() {
                installed += 1;
            }
        }
        torrent.peers.refresh_possession();

        info!("Installed {} pieces of {} from files", installed, hash);
        self.state.put_pieces(&hash, torrent.peers.pieces()).await?;
        self.state.put_torrent_stats(&hash, &torrent.peers.stats()).await?;
        Ok(installed)
    }

    /// Re-verify every piece; true when all are present and valid
    pub async fn recheck(&mut self, info_hash: &str) -> Result<bool> {
        let hash: InfoHash = info_hash.parse()?;
        let torrent = self.torrents.get_mut(&hash).ok_or_else(|| not_loaded(&hash))?;
        let mut complete = true;
        for piece in torrent.peers.pieces_mut().pieces_mut() {
            complete &= piece.recheck();
        }
        torrent.peers.refresh_possession();

        let stats = torrent.peers.stats();
        info!("Recheck of {}: {}/{} pieces valid", hash, stats.have_pieces, stats.pieces);
        self.state.put_pieces(&hash, torrent.peers.pieces()).await?;
        self.state.put_torrent_stats(&hash, &stats).await?;
        Ok(complete)
    }
}

impl std::fmt::Debug for TorrentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentClient")
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .field("torrents", &self.torrents.len())
            .field("listening", &self.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use crate::storage::MemoryStore;
    use crate::torrent::parser::sample_metainfo;
    use crate::tracker::testing::MockFetcher;
    use crate::tracker::ANNOUNCE_CONNECTION_FAILED;

    const TRACKER: &str = "http://tracker.test/announce";

    fn config() -> ClientConfig {
        ClientConfig {
            port: 0,
            connect_timeout_ms: 2_000,
            block_timeout_ms: 2_000,
            ..ClientConfig::default()
        }
    }

    fn payload() -> Vec<u8> {
        (0..40u8).collect()
    }

    fn tracker_response(port: u16) -> Vec<u8> {
        let mut compact = vec![127, 0, 0, 1];
        compact.extend_from_slice(&port.to_be_bytes());
        bencode::encode(&Value::dict([
            ("complete", Value::Integer(1)),
            ("interval", Value::Integer(900)),
            ("peers", Value::Bytes(compact)),
        ]))
    }

    async fn client(store: Arc<MemoryStore>, fetcher: MockFetcher) -> TorrentClient {
        TorrentClient::new(store, Arc::new(fetcher), config()).await.unwrap()
    }

    #[tokio::test]
    async fn test_load_persists_and_restores() {
        let store = Arc::new(MemoryStore::new());
        let metainfo = sample_metainfo("demo.bin", 16, &payload(), &[vec![TRACKER]]);

        let mut first = client(store.clone(), MockFetcher::default()).await;
        let hash = first.load(&metainfo).await.unwrap();
        assert_eq!(hash.len(), 40);
        assert!(matches!(
            first.load(&metainfo).await.unwrap_err(),
            TorrentError::PreconditionError { .. }
        ));

        let stats = first.torrent_stats(&hash).unwrap();
        assert_eq!(stats.left, 40);
        assert_eq!(stats.pieces, 3);
        assert_eq!(first.files(&hash).unwrap()["demo.bin"], vec![0u8; 40]);

        let second = client(store.clone(), MockFetcher::default()).await;
        assert_eq!(second.loaded(), vec![hash.clone()]);
        assert_eq!(second.announces(&hash).unwrap(), vec![vec![TRACKER.to_string()]]);
        assert_eq!(second.info(&hash).unwrap().name, "demo.bin");
    }

    #[tokio::test]
    async fn test_unknown_torrent_is_precondition() {
        let mut client = client(Arc::new(MemoryStore::new()), MockFetcher::default()).await;
        let absent = "ab".repeat(20);
        assert!(matches!(client.announces(&absent), Err(TorrentError::PreconditionError { .. })));
        assert!(matches!(client.unload(&absent).await, Err(TorrentError::PreconditionError { .. })));
        assert!(matches!(client.known_peers("not hex"), Err(TorrentError::PreconditionError { .. })));
    }

    #[tokio::test]
    async fn test_unload_deletes_everything() {
        let store = Arc::new(MemoryStore::new());
        let metainfo = sample_metainfo("demo.bin", 16, &payload(), &[vec![TRACKER]]);
        let fetcher = MockFetcher::default().with(TRACKER, tracker_response(6881));

        let mut client = client(store.clone(), fetcher).await;
        let hash = client.load(&metainfo).await.unwrap();
        client.announce(&hash, TrackerEvent::Started, 0, 0, 40).await.unwrap();
        client.unload(&hash).await.unwrap();

        assert!(client.loaded().is_empty());
        // Only the emptied loaded list remains
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_announce_merges_peers_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let metainfo = sample_metainfo(
            "demo.bin",
            16,
            &payload(),
            &[vec!["http://dead.test/announce"], vec![TRACKER]],
        );
        let fetcher = MockFetcher::default().with(TRACKER, tracker_response(6881));

        let mut client = client(store.clone(), fetcher).await;
        let hash = client.load(&metainfo).await.unwrap();
        let interval = client.announce(&hash, TrackerEvent::Started, 0, 0, 40).await.unwrap();
        assert_eq!(interval, 900);

        let peers = client.known_peers(&hash).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].to_string(), "127.0.0.1:6881");

        let stats = client.tracker_stats(&hash).unwrap();
        assert_eq!(stats["http://dead.test/announce"], ScrapeData::failure(ANNOUNCE_CONNECTION_FAILED));
        assert!(matches!(stats[TRACKER], ScrapeData::Scrape { complete: 1, .. }));

        let restored = TorrentClient::new(store, Arc::new(MockFetcher::default()), config())
            .await
            .unwrap();
        assert_eq!(restored.known_peers(&hash).unwrap(), peers);
        assert_eq!(restored.tracker_stats(&hash).unwrap(), stats);

        client.invalidate_peer(&hash, &peers[0]).await.unwrap();
        assert!(client.known_peers(&hash).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_announce_total_failure_records_stats() {
        let metainfo = sample_metainfo("demo.bin", 16, &payload(), &[vec![TRACKER]]);
        let mut client = client(Arc::new(MemoryStore::new()), MockFetcher::default()).await;
        let hash = client.load(&metainfo).await.unwrap();

        let err = client.announce(&hash, TrackerEvent::Regular, 0, 0, 40).await.unwrap_err();
        assert!(matches!(err, TorrentError::TrackerFailure { .. }));
        assert_eq!(
            client.tracker_stats(&hash).unwrap()[TRACKER],
            ScrapeData::failure(ANNOUNCE_CONNECTION_FAILED)
        );
    }

    #[tokio::test]
    async fn test_load_files_and_recheck() {
        let data = payload();
        let metainfo = sample_metainfo("demo.bin", 16, &data, &[]);
        let mut client = client(Arc::new(MemoryStore::new()), MockFetcher::default()).await;
        let hash = client.load(&metainfo).await.unwrap();
        assert!(!client.recheck(&hash).await.unwrap());

        let mut partial = data.clone();
        partial[20] ^= 0xff;
        let files = BTreeMap::from([("demo.bin".to_string(), partial)]);
        assert_eq!(client.load_files(&hash, &files).await.unwrap(), 2);
        let stats = client.torrent_stats(&hash).unwrap();
        assert_eq!(stats.have_pieces, 2);
        assert_eq!(stats.left, 16);

        let files = BTreeMap::from([("demo.bin".to_string(), data.clone())]);
        assert_eq!(client.load_files(&hash, &files).await.unwrap(), 1);
        assert!(client.recheck(&hash).await.unwrap());
        assert_eq!(client.files(&hash).unwrap()["demo.bin"], data);
        assert_eq!(client.torrent_stats(&hash).unwrap().left, 0);
    }

    #[tokio::test]
    async fn test_connect_requires_known_peer() {
        let metainfo = sample_metainfo("demo.bin", 16, &payload(), &[]);
        let mut client = client(Arc::new(MemoryStore::new()), MockFetcher::default()).await;
        let hash = client.load(&metainfo).await.unwrap();
        let stranger = KnownPeer::from_addr("127.0.0.1:6889".parse().unwrap(), None);
        assert!(matches!(
            client.connect(&hash, &stranger).await,
            Err(TorrentError::PreconditionError { .. })
        ));
    }

    #[tokio::test]
    async fn test_inbound_peer_is_accepted_and_registered() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let metainfo = sample_metainfo("demo.bin", 16, &payload(), &[]);
        let store = Arc::new(MemoryStore::new());
        let mut client = client(store.clone(), MockFetcher::default()).await;
        let hash = client.load(&metainfo).await.unwrap();
        client.start().await.unwrap();
        let addr = client.local_addr().unwrap();
        let info_hash: InfoHash = hash.parse().unwrap();

        let remote = tokio::spawn(async move {
            let mut socket = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
            let ours = Handshake::new(*info_hash.as_bytes(), *b"-XX0001-\x00\xffbinary-id!");
            socket.write_all(&ours.serialize()).await.unwrap();
            let mut reply = [0u8; 68];
            socket.read_exact(&mut reply).await.unwrap();
            (socket.local_addr().unwrap(), Handshake::deserialize(&reply).unwrap(), socket)
        });

        let mut connected = Vec::new();
        for _ in 0..100 {
            client.handle_small_messages().await.unwrap();
            connected = client.connected_peers(&hash).unwrap();
            if !connected.is_empty() {
                break;
            }
        }
        let (remote_addr, echoed, _socket) = remote.await.unwrap();
        assert_eq!(echoed.info_hash, *info_hash.as_bytes());
        assert_eq!(&echoed.peer_id, client.peer_id());

        let expected = KnownPeer::from_addr(remote_addr, None);
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].peer, expected);
        assert!(connected[0].am_choking && connected[0].peer_choking);
        assert_eq!(client.known_peers(&hash).unwrap(), vec![expected.clone()]);

        let restored = TorrentClient::new(store, Arc::new(MockFetcher::default()), config())
            .await
            .unwrap();
        assert_eq!(restored.known_peers(&hash).unwrap(), vec![expected]);
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_seeder_to_leecher_transfer() {
        let data = payload();
        let metainfo = sample_metainfo("demo.bin", 16, &data, &[vec![TRACKER]]);

        let mut seeder = client(Arc::new(MemoryStore::new()), MockFetcher::default()).await;
        let hash = seeder.load(&metainfo).await.unwrap();
        let files = BTreeMap::from([("demo.bin".to_string(), data.clone())]);
        seeder.load_files(&hash, &files).await.unwrap();
        seeder.start().await.unwrap();
        let port = seeder.local_addr().unwrap().port();

        let handle = seeder.shutdown_handle();
        let stop_seeding = handle.clone();
        let seed_hash = hash.clone();
        let seeding = tokio::spawn(async move {
            while !handle.is_shutdown() {
                seeder.handle_small_messages().await.unwrap();
                for peer in seeder.connected_peers(&seed_hash).unwrap() {
                    if peer.am_choking {
                        seeder.unchoke(&seed_hash, &peer.peer).await.unwrap();
                    }
                }
                for (peer, pieces) in seeder.requested_pieces(&seed_hash).unwrap() {
                    for index in pieces {
                        let _ = seeder.send_piece(&seed_hash, &peer, index).await;
                    }
                }
            }
            seeder
        });

        let fetcher = MockFetcher::default().with(TRACKER, tracker_response(port));
        let leecher_store = Arc::new(MemoryStore::new());
        let mut leecher = client(leecher_store.clone(), fetcher).await;
        leecher.load(&metainfo).await.unwrap();
        leecher.announce(&hash, TrackerEvent::Started, 0, 0, 40).await.unwrap();
        let seed_peer = leecher.known_peers(&hash).unwrap()[0].clone();
        leecher.connect(&hash, &seed_peer).await.unwrap();

        let mut available = Vec::new();
        for _ in 0..100 {
            leecher.handle_small_messages().await.unwrap();
            available = leecher
                .available_pieces(&hash, 10, 1)
                .unwrap()
                .remove(&seed_peer)
                .unwrap_or_default();
            if !available.is_empty() {
                break;
            }
        }
        assert_eq!(available, vec![1, 2, 0]);

        for index in available {
            leecher.request_piece(&hash, &seed_peer, index).await.unwrap();
        }

        let stats = leecher.torrent_stats(&hash).unwrap();
        assert_eq!(stats.left, 0);
        assert_eq!(stats.downloaded, 40);
        assert!(leecher.recheck(&hash).await.unwrap());
        assert_eq!(leecher.files(&hash).unwrap()["demo.bin"], data);

        let restored = client(leecher_store, MockFetcher::default()).await;
        assert_eq!(restored.files(&hash).unwrap()["demo.bin"], data);
        assert_eq!(restored.torrent_stats(&hash).unwrap().left, 0);

        stop_seeding.shutdown();
        let mut seeder = seeding.await.unwrap();
        assert_eq!(seeder.torrent_stats(&hash).unwrap().uploaded, 40);
        seeder.stop().await.unwrap();
        assert!(seeder.local_addr().is_none());
    }
}
