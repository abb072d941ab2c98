//! Tiered announce with failover

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{scrape_from_response, TrackerClient, ANNOUNCE_CONNECTION_FAILED};
use crate::bencode::{self, Value};
use crate::error::{Result, TorrentError};
use crate::peer::KnownPeer;
use crate::stats::ScrapeData;
use crate::torrent::InfoHash;

/// Announce event reported to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
    /// Periodic announce
    Regular,
}

impl TrackerEvent {
    /// Value of the `event` query parameter
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
            TrackerEvent::Regular => "",
        }
    }
}

impl fmt::Display for TrackerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerEvent::Regular => write!(f, "regular"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl FromStr for TrackerEvent {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "started" => Ok(TrackerEvent::Started),
            "stopped" => Ok(TrackerEvent::Stopped),
            "completed" => Ok(TrackerEvent::Completed),
            "regular" | "" => Ok(TrackerEvent::Regular),
            other => Err(TorrentError::precondition(format!("Unknown announce event '{}'", other))),
        }
    }
}

/// Ordered tiers of tracker URLs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceTiers(Vec<Vec<String>>);

impl AnnounceTiers {
    pub fn new(tiers: Vec<Vec<String>>) -> Self {
        Self(tiers)
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<Vec<String>> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Vec::is_empty)
    }

    /// Every tracker in tier order
    pub fn urls(&self) -> impl Iterator<Item = &String> {
        self.0.iter().flatten()
    }

    /// Shuffle each tier independently
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        for tier in &mut self.0 {
            tier.shuffle(&mut rng);
        }
    }

    /// Move a tracker to the head of its tier
    pub fn promote(&mut self, tier: usize, index: usize) {
        if let Some(trackers) = self.0.get_mut(tier) {
            if index < trackers.len() {
                let url = trackers.remove(index);
                trackers.insert(0, url);
            }
        }
    }
}

/// Values reported with an announce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceParams {
    pub event: TrackerEvent,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Result of the first tracker that answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceSuccess {
    pub tracker: String,
    /// Seconds to wait before the next announce
    pub interval: u32,
    pub peers: Vec<KnownPeer>,
}

enum Outcome {
    Answered { interval: u32, peers: Vec<KnownPeer>, scrape: ScrapeData },
    Rejected(String),
}

fn percent_encode(bytes: &[u8]) -> String {
    urlencoding::encode_binary(bytes).into_owned()
}

/// Full announce URL for `tracker`
pub fn announce_url(tracker: &str, info_hash: &InfoHash, peer_id: &[u8; 20], params: &AnnounceParams) -> String {
    let separator = if tracker.contains('?') { '&' } else { '?' };
    format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&event={}",
        tracker,
        separator,
        percent_encode(info_hash.as_bytes()),
        percent_encode(peer_id),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
        params.event.as_str()
    )
}

impl TrackerClient {
    /// Walk the tiers until a tracker answers
    ///
    /// Every contacted tracker gets its outcome written to `stats`. `tiers`
    /// is shuffled on `Started` and the answering tracker is promoted to the
    /// head of its tier; both changes are visible to the caller even when
    /// every tracker fails.
    pub async fn announce(
        &self,
        info_hash: &InfoHash,
        tiers: &mut AnnounceTiers,
        params: &AnnounceParams,
        stats: &mut BTreeMap<String, ScrapeData>,
    ) -> Result<AnnounceSuccess> {
        if params.event == TrackerEvent::Started {
            tiers.shuffle();
            debug!("Shuffled announce tiers of {}", info_hash);
        }

        for tier in 0..tiers.0.len() {
            for index in 0..tiers.0[tier].len() {
                let tracker = tiers.0[tier][index].clone();
                let url = announce_url(&tracker, info_hash, &self.peer_id, params);
                debug!("Announcing {} ({}) to {}", info_hash, params.event, tracker);

                match self.contact(&url).await {
                    Outcome::Answered { interval, peers, scrape } => {
                        info!(
                            "Tracker {} answered for {}: interval {}s, {} peers",
                            tracker,
                            info_hash,
                            interval,
                            peers.len()
                        );
                        stats.insert(tracker.clone(), scrape);
                        tiers.promote(tier, index);
                        return Ok(AnnounceSuccess { tracker, interval, peers });
                    }
                    Outcome::Rejected(reason) => {
                        warn!("Tracker {} failed for {}: {}", tracker, info_hash, reason);
                        stats.insert(tracker, ScrapeData::failure(reason));
                    }
                }
            }
        }

        Err(TorrentError::tracker_failure(format!(
            "announce: every tracker of {} failed",
            info_hash
        )))
    }

    async fn contact(&self, url: &str) -> Outcome {
        let body = match self.fetcher.fetch(url).await {
            Ok(body) => body,
            Err(e) => {
                debug!("Fetch failed: {:#}", e);
                return Outcome::Rejected(ANNOUNCE_CONNECTION_FAILED.to_string());
            }
        };
        let response = match bencode::decode_tracker_response(&body) {
            Ok(response @ Value::Dict(_)) => response,
            Ok(_) => return Outcome::Rejected(ANNOUNCE_CONNECTION_FAILED.to_string()),
            Err(e) => {
                debug!("Undecodable tracker response: {}", e);
                return Outcome::Rejected(ANNOUNCE_CONNECTION_FAILED.to_string());
            }
        };

        if let Some(reason) = response.get("failure reason") {
            let reason = reason
                .as_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            return Outcome::Rejected(reason);
        }

        let interval = response
            .get("interval")
            .and_then(Value::as_integer)
            .and_then(|i| u32::try_from(i).ok())
            .unwrap_or(0);
        let peers = response
            .get("peers")
            .and_then(Value::as_list)
            .map(|list| {
                list.iter()
                    .filter_map(|v| match v {
                        Value::Peer(peer) => Some(peer.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Outcome::Answered {
            interval,
            peers,
            scrape: scrape_from_response(&response),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tracker::testing::MockFetcher;

    fn hash() -> InfoHash {
        InfoHash([0x12; 20])
    }

    fn params(event: TrackerEvent) -> AnnounceParams {
        AnnounceParams {
            event,
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
        }
    }

    fn answer(interval: i64) -> Vec<u8> {
        bencode::encode(&Value::dict([
            ("interval", Value::Integer(interval)),
            ("complete", Value::Integer(3)),
            ("incomplete", Value::Integer(1)),
            ("peers", Value::Bytes(vec![127, 0, 0, 1, 0x1a, 0xe1])),
        ]))
    }

    fn rejection(reason: &str) -> Vec<u8> {
        bencode::encode(&Value::dict([("failure reason", Value::string(reason))]))
    }

    fn tiers(raw: &[&[&str]]) -> AnnounceTiers {
        AnnounceTiers::new(raw.iter().map(|t| t.iter().map(|s| s.to_string()).collect()).collect())
    }

    #[test]
    fn test_announce_url_encoding() {
        let mut peer_id = [b'a'; 20];
        peer_id[0] = b'-';
        let url = announce_url(
            "http://t.example/announce",
            &InfoHash([0xff; 20]),
            &peer_id,
            &params(TrackerEvent::Started),
        );
        assert!(url.starts_with("http://t.example/announce?info_hash=%FF%FF"));
        assert!(url.contains("&peer_id=-aaaaaaaaaaaaaaaaaaa&port=6881"));
        assert!(url.ends_with("&left=100&compact=1&event=started"));
    }

    #[tokio::test]
    async fn test_failover_across_tiers() {
        let fetcher = Arc::new(
            MockFetcher::default()
                .with("http://b/announce", rejection("unregistered torrent"))
                .with("http://c/announce", answer(900)),
        );
        let client = TrackerClient::new(fetcher.clone(), [b'x'; 20]);
        let mut tiers = tiers(&[&["http://a/announce", "http://b/announce"], &["http://d/announce", "http://c/announce"]]);
        let mut stats = BTreeMap::new();

        let success = client
            .announce(&hash(), &mut tiers, &params(TrackerEvent::Regular), &mut stats)
            .await
            .unwrap();

        assert_eq!(success.interval, 900);
        assert_eq!(success.tracker, "http://c/announce");
        assert_eq!(success.peers, vec![KnownPeer::new("127.0.0.1".parse().unwrap(), 6881, None)]);
        let order: Vec<String> = fetcher
            .contacted()
            .iter()
            .map(|u| u.split('?').next().unwrap().to_string())
            .collect();
        assert_eq!(
            order,
            vec!["http://a/announce", "http://b/announce", "http://d/announce", "http://c/announce"]
        );
        assert_eq!(
            tiers,
            self::tiers(&[&["http://a/announce", "http://b/announce"], &["http://c/announce", "http://d/announce"]])
        );
        assert_eq!(stats["http://a/announce"], ScrapeData::failure(ANNOUNCE_CONNECTION_FAILED));
        assert_eq!(stats["http://b/announce"], ScrapeData::failure("unregistered torrent"));
        assert_eq!(
            stats["http://c/announce"],
            ScrapeData::Scrape { complete: 3, downloaded: 0, incomplete: 1, name: None }
        );
    }

    #[tokio::test]
    async fn test_total_failure_records_every_tracker() {
        let fetcher = Arc::new(MockFetcher::default().with("http://b/announce", b"garbage".to_vec()));
        let client = TrackerClient::new(fetcher.clone(), [b'x'; 20]);
        let mut tiers = tiers(&[&["http://a/announce"], &["http://b/announce"]]);
        let mut stats = BTreeMap::new();

        let err = client
            .announce(&hash(), &mut tiers, &params(TrackerEvent::Regular), &mut stats)
            .await
            .unwrap_err();

        assert!(matches!(err, TorrentError::TrackerFailure { .. }));
        assert_eq!(fetcher.contacted().len(), 2);
        assert_eq!(stats.len(), 2);
        assert!(stats.values().all(|s| *s == ScrapeData::failure(ANNOUNCE_CONNECTION_FAILED)));
    }

    #[tokio::test]
    async fn test_started_shuffles_within_tiers() {
        let fetcher = Arc::new(MockFetcher::default());
        let client = TrackerClient::new(fetcher, [b'x'; 20]);
        let mut tiers = tiers(&[&["1", "2", "3", "4"], &["5"]]);
        let mut stats = BTreeMap::new();

        let _ = client
            .announce(&hash(), &mut tiers, &params(TrackerEvent::Started), &mut stats)
            .await;

        let mut first = tiers.tiers()[0].clone();
        first.sort();
        assert_eq!(first, vec!["1", "2", "3", "4"]);
        assert_eq!(tiers.tiers()[1], vec!["5"]);
    }

    #[test]
    fn test_event_parsing() {
        assert_eq!("STARTED".parse::<TrackerEvent>().unwrap(), TrackerEvent::Started);
        assert_eq!("regular".parse::<TrackerEvent>().unwrap(), TrackerEvent::Regular);
        assert!("paused".parse::<TrackerEvent>().is_err());
    }
}
