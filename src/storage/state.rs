//! Typed access to persisted client state
//!
//! Each record family lives in its own namespace of the underlying store
//! and is encoded with the bencode codec.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::bencode::{self, DictKey, Value};
use crate::error::{Result, TorrentError};
use crate::peer::KnownPeer;
use crate::stats::{ScrapeData, TorrentStats};
use crate::storage::backend::{KeyValueStore, Namespaced};
use crate::storage::piece::{Piece, PieceTable};
use crate::torrent::{InfoHash, TorrentFile};

const LOADED_KEY: &str = "loaded";

/// Storage key of one piece's data
fn piece_data_key(info_hash: &InfoHash, index: u32) -> String {
    format!("{}_{}", info_hash, index)
}

/// Storage key of a tracker's statistics
pub fn tracker_stats_key(info_hash: &InfoHash, tracker: &str) -> String {
    format!("{}_{}", info_hash, tracker)
}

/// Persisted state, one namespace per record family
#[derive(Debug, Clone)]
pub struct StateStore {
    torrents: Namespaced,
    metainfo: Namespaced,
    announces: Namespaced,
    peers: Namespaced,
    tracker_stats: Namespaced,
    pieces: Namespaced,
    piece_data: Namespaced,
    files: Namespaced,
    torrent_stats: Namespaced,
}

fn storage_err(key: &str) -> impl FnOnce(anyhow::Error) -> TorrentError + '_ {
    move |e| TorrentError::storage_error_full("Store access failed", key, format!("{:#}", e))
}

fn shape_err(key: &str, expected: &str) -> TorrentError {
    TorrentError::storage_error_full("Unexpected record shape", key, format!("expected {}", expected))
}

impl StateStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            torrents: Namespaced::new(store.clone(), "torrents"),
            metainfo: Namespaced::new(store.clone(), "metainfo"),
            announces: Namespaced::new(store.clone(), "announces"),
            peers: Namespaced::new(store.clone(), "peers"),
            tracker_stats: Namespaced::new(store.clone(), "tracker-stats"),
            pieces: Namespaced::new(store.clone(), "pieces"),
            piece_data: Namespaced::new(store.clone(), "piece-data"),
            files: Namespaced::new(store.clone(), "files"),
            torrent_stats: Namespaced::new(store, "torrent-stats"),
        }
    }

    async fn get(ns: &Namespaced, key: &str) -> Result<Option<Value>> {
        match ns.read(key).await.map_err(storage_err(key))? {
            Some(bytes) => {
                trace!("Read {} bytes for {:?}/{}", bytes.len(), ns, key);
                Ok(Some(bencode::decode(&bytes).map_err(|e| e.with_context(key.to_string()))?))
            }
            None => Ok(None),
        }
    }

    async fn put(ns: &Namespaced, key: &str, value: &Value) -> Result<()> {
        ns.write(key, bencode::encode(value)).await.map_err(storage_err(key))
    }

    async fn remove(ns: &Namespaced, key: &str) -> Result<()> {
        ns.delete(key).await.map_err(storage_err(key))
    }

    /// Infohashes of loaded torrents
    pub async fn loaded(&self) -> Result<Vec<InfoHash>> {
        let Some(value) = Self::get(&self.torrents, LOADED_KEY).await? else {
            return Ok(Vec::new());
        };
        value
            .as_list()
            .ok_or_else(|| shape_err(LOADED_KEY, "list"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| shape_err(LOADED_KEY, "hex string"))?
                    .parse::<InfoHash>()
            })
            .collect()
    }

    pub async fn set_loaded(&self, hashes: &[InfoHash]) -> Result<()> {
        let list = hashes.iter().map(|h| Value::string(&h.to_hex())).collect();
        Self::put(&self.torrents, LOADED_KEY, &Value::List(list)).await
    }

    /// Original metainfo bytes
    pub async fn metainfo(&self, info_hash: &InfoHash) -> Result<Option<Vec<u8>>> {
        let key = info_hash.to_hex();
        self.metainfo.read(&key).await.map_err(storage_err(&key))
    }

    pub async fn put_metainfo(&self, info_hash: &InfoHash, data: &[u8]) -> Result<()> {
        let key = info_hash.to_hex();
        self.metainfo.write(&key, data.to_vec()).await.map_err(storage_err(&key))
    }

    pub async fn announces(&self, info_hash: &InfoHash) -> Result<Option<Vec<Vec<String>>>> {
        let key = info_hash.to_hex();
        let Some(value) = Self::get(&self.announces, &key).await? else {
            return Ok(None);
        };
        let tiers = value
            .as_list()
            .ok_or_else(|| shape_err(&key, "list of tiers"))?
            .iter()
            .map(|tier| {
                tier.as_list()
                    .ok_or_else(|| shape_err(&key, "tier list"))?
                    .iter()
                    .map(|url| url.as_str().map(str::to_string).ok_or_else(|| shape_err(&key, "tracker URL")))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(tiers))
    }

    pub async fn put_announces(&self, info_hash: &InfoHash, tiers: &[Vec<String>]) -> Result<()> {
        let value = Value::List(
            tiers
                .iter()
                .map(|tier| Value::List(tier.iter().map(|url| Value::string(url)).collect()))
                .collect(),
        );
        Self::put(&self.announces, &info_hash.to_hex(), &value).await
    }

    pub async fn peers(&self, info_hash: &InfoHash) -> Result<BTreeSet<KnownPeer>> {
        let key = info_hash.to_hex();
        let Some(value) = Self::get(&self.peers, &key).await? else {
            return Ok(BTreeSet::new());
        };
        value
            .into_list()
            .ok_or_else(|| shape_err(&key, "peer list"))?
            .into_iter()
            .map(|v| match v {
                Value::Peer(peer) => Ok(peer),
                _ => Err(shape_err(&key, "peer record")),
            })
            .collect()
    }

    pub async fn put_peers(&self, info_hash: &InfoHash, peers: &BTreeSet<KnownPeer>) -> Result<()> {
        let value = Value::List(peers.iter().cloned().map(Value::Peer).collect());
        Self::put(&self.peers, &info_hash.to_hex(), &value).await
    }

    pub async fn tracker_stat(&self, info_hash: &InfoHash, tracker: &str) -> Result<Option<ScrapeData>> {
        let key = tracker_stats_key(info_hash, tracker);
        match Self::get(&self.tracker_stats, &key).await? {
            Some(Value::Scrape(data)) => Ok(Some(data)),
            Some(_) => Err(shape_err(&key, "scrape record")),
            None => Ok(None),
        }
    }

    pub async fn put_tracker_stat(&self, info_hash: &InfoHash, tracker: &str, data: &ScrapeData) -> Result<()> {
        let key = tracker_stats_key(info_hash, tracker);
        Self::put(&self.tracker_stats, &key, &Value::Scrape(data.clone())).await
    }

    /// Piece table without data; each piece's data lives under its own key
    async fn piece_layout(&self, info_hash: &InfoHash) -> Result<Option<Vec<Piece>>> {
        let key = info_hash.to_hex();
        let Some(value) = Self::get(&self.pieces, &key).await? else {
            return Ok(None);
        };
        let pieces = value
            .into_dict()
            .ok_or_else(|| shape_err(&key, "piece table"))?
            .into_values()
            .map(|v| match v {
                Value::Piece(piece) => Ok(piece),
                _ => Err(shape_err(&key, "piece record")),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(pieces))
    }

    pub async fn pieces(&self, info_hash: &InfoHash) -> Result<Option<Vec<Piece>>> {
        let Some(mut pieces) = self.piece_layout(info_hash).await? else {
            return Ok(None);
        };
        for piece in &mut pieces {
            let key = piece_data_key(info_hash, piece.index);
            piece.data = self.piece_data.read(&key).await.map_err(storage_err(&key))?;
        }
        Ok(Some(pieces))
    }

    /// Persist the whole table: layout plus the data of every piece
    pub async fn put_pieces(&self, info_hash: &InfoHash, table: &PieceTable) -> Result<()> {
        let dict = table
            .pieces()
            .iter()
            .map(|p| {
                let layout = Piece { data: None, ..p.clone() };
                (DictKey::Integer(p.index as i64), Value::Piece(layout))
            })
            .collect();
        debug!("Persisting piece table of {} ({} pieces)", info_hash, table.len());
        Self::put(&self.pieces, &info_hash.to_hex(), &Value::Dict(dict)).await?;
        for piece in table.pieces() {
            self.put_piece(info_hash, piece).await?;
        }
        Ok(())
    }

    /// Persist the data of a single piece
    pub async fn put_piece(&self, info_hash: &InfoHash, piece: &Piece) -> Result<()> {
        let key = piece_data_key(info_hash, piece.index);
        match &piece.data {
            Some(data) => self.piece_data.write(&key, data.clone()).await,
            None => self.piece_data.delete(&key).await,
        }
        .map_err(storage_err(&key))
    }

    pub async fn files(&self, info_hash: &InfoHash) -> Result<Option<Vec<TorrentFile>>> {
        let key = info_hash.to_hex();
        let Some(value) = Self::get(&self.files, &key).await? else {
            return Ok(None);
        };
        let files = value
            .into_list()
            .ok_or_else(|| shape_err(&key, "file list"))?
            .into_iter()
            .map(|v| match v {
                Value::File(file) => Ok(file),
                _ => Err(shape_err(&key, "file record")),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(files))
    }

    pub async fn put_files(&self, info_hash: &InfoHash, files: &[TorrentFile]) -> Result<()> {
        let value = Value::List(files.iter().cloned().map(Value::File).collect());
        Self::put(&self.files, &info_hash.to_hex(), &value).await
    }

    pub async fn torrent_stats(&self, info_hash: &InfoHash) -> Result<Option<TorrentStats>> {
        let key = info_hash.to_hex();
        match Self::get(&self.torrent_stats, &key).await? {
            Some(Value::Stats(stats)) => Ok(Some(stats)),
            Some(_) => Err(shape_err(&key, "stats record")),
            None => Ok(None),
        }
    }

    pub async fn put_torrent_stats(&self, info_hash: &InfoHash, stats: &TorrentStats) -> Result<()> {
        Self::put(&self.torrent_stats, &info_hash.to_hex(), &Value::Stats(stats.clone())).await
    }

    /// Delete every record of a torrent, including stats of the given trackers
    pub async fn delete_torrent(&self, info_hash: &InfoHash, trackers: &[String]) -> Result<()> {
        let key = info_hash.to_hex();
        for tracker in trackers {
            Self::remove(&self.tracker_stats, &tracker_stats_key(info_hash, tracker)).await?;
        }
        Self::remove(&self.metainfo, &key).await?;
        Self::remove(&self.announces, &key).await?;
        Self::remove(&self.peers, &key).await?;
        for piece in self.piece_layout(info_hash).await?.unwrap_or_default() {
            Self::remove(&self.piece_data, &piece_data_key(info_hash, piece.index)).await?;
        }
        Self::remove(&self.pieces, &key).await?;
        Self::remove(&self.files, &key).await?;
        Self::remove(&self.torrent_stats, &key).await?;
        debug!("Deleted persisted state of {}", info_hash);
        Ok(())
    }
}
