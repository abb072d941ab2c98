//! Tracker module
//!
//! Tiered announce with failover and per-tracker scrape over HTTP.

pub mod announce;
pub mod http;
pub mod scrape;

use std::sync::Arc;

pub use announce::{AnnounceParams, AnnounceSuccess, AnnounceTiers, TrackerEvent};
pub use http::HttpFetcher;
#[cfg(feature = "http")]
pub use http::ReqwestFetcher;
pub use scrape::scrape_url;

/// Failure recorded when a tracker cannot be reached during announce
pub const ANNOUNCE_CONNECTION_FAILED: &str = "announce: URL connection failed";

/// Failure recorded when a tracker cannot be scraped
pub const SCRAPE_CONNECTION_FAILED: &str = "scrape: URL connection failed";

/// Talks to the trackers of a torrent on behalf of one client
#[derive(Clone)]
pub struct TrackerClient {
    fetcher: Arc<dyn HttpFetcher>,
    peer_id: [u8; 20],
}

impl TrackerClient {
    pub fn new(fetcher: Arc<dyn HttpFetcher>, peer_id: [u8; 20]) -> Self {
        Self { fetcher, peer_id }
    }

    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }
}

impl std::fmt::Debug for TrackerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerClient")
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

/// Swarm summary carried by announce and scrape responses
pub(crate) fn scrape_from_response(response: &crate::bencode::Value) -> crate::stats::ScrapeData {
    let count = |key: &str| {
        response
            .get(key)
            .and_then(|v| v.as_integer())
            .and_then(|i| u64::try_from(i).ok())
            .unwrap_or(0)
    };
    crate::stats::ScrapeData::Scrape {
        complete: count("complete"),
        downloaded: count("downloaded"),
        incomplete: count("incomplete"),
        name: response.get("name").and_then(|v| v.as_str()).map(str::to_string),
    }
}
