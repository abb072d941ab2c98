//! Transfer and tracker statistics

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Latest outcome of contacting a tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScrapeData {
    /// Swarm summary returned by the tracker
    Scrape {
        complete: u64,
        downloaded: u64,
        incomplete: u64,
        name: Option<String>,
    },
    /// Tracker could not be used
    Failure { reason: String },
}

impl ScrapeData {
    /// Build a failure record
    pub fn failure(reason: impl Into<String>) -> Self {
        ScrapeData::Failure { reason: reason.into() }
    }

    /// Whether this is a failure record
    pub fn is_failure(&self) -> bool {
        matches!(self, ScrapeData::Failure { .. })
    }
}

/// Per-torrent transfer statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TorrentStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub wasted: u64,
    /// uploaded / downloaded, 0 while nothing was downloaded
    pub share_ratio: f64,
    pub pieces: u32,
    pub have_pieces: u32,
    pub leech_time: Duration,
    pub seed_time: Duration,
}

impl TorrentStats {
    /// Fresh statistics for a torrent with nothing downloaded
    pub fn new(total_length: u64, pieces: u32) -> Self {
        Self {
            left: total_length,
            pieces,
            ..Self::default()
        }
    }

    /// Recompute the derived share ratio
    pub fn refresh_share_ratio(&mut self) {
        self.share_ratio = if self.downloaded == 0 {
            0.0
        } else {
            self.uploaded as f64 / self.downloaded as f64
        };
    }

    /// Whether every byte has been downloaded
    pub fn is_seeding(&self) -> bool {
        self.left == 0
    }
}

/// Mutable statistics plus the clock for leech/seed durations
#[derive(Debug, Clone)]
pub struct StatsTracker {
    stats: TorrentStats,
    active_since: Option<Instant>,
}

impl StatsTracker {
    /// Wrap persisted statistics
    pub fn new(stats: TorrentStats) -> Self {
        Self {
            stats,
            active_since: None,
        }
    }

    /// Begin duration accounting
    pub fn start_timing(&mut self) {
        if self.active_since.is_none() {
            self.active_since = Some(Instant::now());
        }
    }

    /// Fold the running interval into the totals and stop the clock
    pub fn stop_timing(&mut self) {
        self.fold_elapsed();
        self.active_since = None;
    }

    /// Whether durations are accumulating
    pub fn is_timing(&self) -> bool {
        self.active_since.is_some()
    }

    fn fold_elapsed(&mut self) {
        if let Some(since) = self.active_since {
            let now = Instant::now();
            let elapsed = now.duration_since(since);
            if self.stats.is_seeding() {
                self.stats.seed_time += elapsed;
            } else {
                self.stats.leech_time += elapsed;
            }
            self.active_since = Some(now);
        }
    }

    /// Credit a verified piece
    pub fn record_download(&mut self, bytes: u64) {
        let was_leeching = !self.stats.is_seeding();
        if was_leeching {
            // Attribute the interval so far to leeching before `left` changes
            self.fold_elapsed();
        }
        self.stats.downloaded += bytes;
        self.stats.left = self.stats.left.saturating_sub(bytes);
        self.stats.have_pieces += 1;
        if was_leeching && self.stats.is_seeding() {
            info!(
                "Download complete after {:?} of leeching; seeding from now on",
                self.stats.leech_time
            );
        }
    }

    /// Credit a verified piece that was already held; `left` is unchanged
    pub fn record_duplicate(&mut self, bytes: u64) {
        self.stats.downloaded += bytes;
    }

    /// Credit bytes discarded after a failed transfer
    pub fn record_wasted(&mut self, bytes: u64) {
        if bytes > 0 {
            debug!("Counting {} bytes as wasted", bytes);
            self.stats.wasted += bytes;
        }
    }

    /// Credit bytes served to a peer
    pub fn record_upload(&mut self, bytes: u64) {
        self.stats.uploaded += bytes;
    }

    /// Reset possession counters after a recheck or file import
    pub fn set_possession(&mut self, have_pieces: u32, left: u64) {
        self.fold_elapsed();
        self.stats.have_pieces = have_pieces;
        self.stats.left = left;
    }

    /// Statistics including the running interval and the derived ratio
    pub fn snapshot(&self) -> TorrentStats {
        let mut stats = self.stats.clone();
        if let Some(since) = self.active_since {
            let elapsed = since.elapsed();
            if stats.is_seeding() {
                stats.seed_time += elapsed;
            } else {
                stats.leech_time += elapsed;
            }
        }
        stats.refresh_share_ratio();
        stats
    }
}
