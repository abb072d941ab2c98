//! Progress display module
//!
//! Terminal output for the CLI: a download progress line and summaries of
//! torrents, statistics, trackers and peers.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::peer::KnownPeer;
use crate::stats::{ScrapeData, TorrentStats};
use crate::torrent::TorrentInfo;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Time to fetch `left` bytes at `speed` bytes per second
pub fn calculate_eta(left: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || left == 0 {
        return None;
    }
    Some(Duration::from_secs_f64(left as f64 / speed))
}

/// Progress display for CLI
pub struct ProgressDisplay {
    /// Start time of the download
    start_time: Instant,
    /// Last update time
    last_update: Instant,
    /// Update interval
    update_interval: Duration,
    /// Quiet mode (no progress output)
    quiet: bool,
    /// `downloaded` at start, for the average speed
    baseline: u64,
}

impl ProgressDisplay {
    /// Create a new progress display
    pub fn new(quiet: bool, baseline: u64) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: Instant::now(),
            update_interval: Duration::from_millis(500),
            quiet,
            baseline,
        }
    }

    /// Average download speed since the display was created
    fn speed(&self, stats: &TorrentStats) -> f64 {
        let secs = self.start_time.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        stats.downloaded.saturating_sub(self.baseline) as f64 / secs
    }

    /// Redraw the progress line, rate limited
    pub fn update(&mut self, stats: &TorrentStats, peers: usize) -> io::Result<()> {
        if self.quiet || self.last_update.elapsed() < self.update_interval {
            return Ok(());
        }
        self.last_update = Instant::now();
        print!("\r\x1b[2K{}", self.progress_line(stats, peers));
        io::stdout().flush()
    }

    fn progress_line(&self, stats: &TorrentStats, peers: usize) -> String {
        let progress = if stats.pieces == 0 {
            1.0
        } else {
            stats.have_pieces as f64 / stats.pieces as f64
        };

        let bar_width: usize = 40;
        let filled = ((progress * bar_width as f64) as usize).min(bar_width);
        let bar = "=".repeat(filled) + &" ".repeat(bar_width - filled);

        let speed = self.speed(stats);
        let eta = calculate_eta(stats.left, speed)
            .map(format_duration)
            .unwrap_or_else(|| "∞".to_string());

        format!(
            "[{}] {:.1}% | {}/{} pieces | ↓ {} | ↑ {} | Peers: {} | ETA: {}",
            bar,
            progress * 100.0,
            stats.have_pieces,
            stats.pieces,
            format_speed(speed),
            format_bytes(stats.uploaded),
            peers,
            eta,
        )
    }

    /// Print completion message
    pub fn print_complete(&self, stats: &TorrentStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        print!("\r\x1b[2K");
        io::stdout().flush()?;

        println!("Download Complete!");
        println!("  Downloaded: {}", format_bytes(stats.downloaded));
        println!("  Wasted: {}", format_bytes(stats.wasted));
        println!("  Elapsed Time: {}", format_duration(self.start_time.elapsed()));
        Ok(())
    }

    /// Print a status message
    pub fn print_status(&self, message: &str) {
        if !self.quiet {
            println!("\r\x1b[2K{}", message);
        }
    }

    /// Get the elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Print the contents of a parsed .torrent file
pub fn print_torrent_info(info: &TorrentInfo) {
    println!("Name:         {}", info.name);
    println!("Infohash:     {}", info.info_hash);
    println!("Total size:   {}", format_bytes(info.total_length));
    println!(
        "Pieces:       {} x {}",
        info.piece_count(),
        format_bytes(info.piece_length as u64)
    );
    println!("Files:");
    for file in &info.files {
        println!("  {} ({})", file.name, format_bytes(file.length));
    }
    println!("Trackers:");
    for (tier, urls) in info.announce_tiers.iter().enumerate() {
        println!("  tier {}: {}", tier, urls.join(", "));
    }
}

/// Print transfer statistics
pub fn print_stats(stats: &TorrentStats) {
    println!("Downloaded:   {}", format_bytes(stats.downloaded));
    println!("Uploaded:     {}", format_bytes(stats.uploaded));
    println!("Left:         {}", format_bytes(stats.left));
    println!("Wasted:       {}", format_bytes(stats.wasted));
    println!("Share ratio:  {:.2}", stats.share_ratio);
    println!("Pieces:       {}/{}", stats.have_pieces, stats.pieces);
    println!("Leech time:   {}", format_duration(stats.leech_time));
    println!("Seed time:    {}", format_duration(stats.seed_time));
}

/// One line per tracker outcome
pub fn print_tracker_stats(stats: &BTreeMap<String, ScrapeData>) {
    if stats.is_empty() {
        println!("No tracker contacted yet");
    }
    for (tracker, data) in stats {
        match data {
            ScrapeData::Scrape {
                complete,
                downloaded,
                incomplete,
                name,
            } => println!(
                "{}: {} seeders, {} leechers, {} completed{}",
                tracker,
                complete,
                incomplete,
                downloaded,
                name.as_deref().map(|n| format!(" ({})", n)).unwrap_or_default()
            ),
            ScrapeData::Failure { reason } => println!("{}: failed: {}", tracker, reason),
        }
    }
}

pub fn print_peers(peers: &[KnownPeer]) {
    println!("{} known peers", peers.len());
    for peer in peers {
        match &peer.peer_id {
            Some(id) => println!("  {} ({})", peer, id),
            None => println!("  {}", peer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024.0), "1.00 KB/s");
        assert_eq!(format_speed(1024.0 * 1024.0), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_calculate_eta() {
        assert_eq!(calculate_eta(50, 10.0), Some(Duration::from_secs(5)));
        assert_eq!(calculate_eta(0, 10.0), None);
        assert_eq!(calculate_eta(50, 0.0), None);
    }

    #[test]
    fn test_progress_line() {
        let display = ProgressDisplay::new(true, 0);
        let mut stats = TorrentStats::new(100, 4);
        stats.have_pieces = 1;
        let line = display.progress_line(&stats, 3);
        assert!(line.starts_with(&format!("[{}{}] 25.0%", "=".repeat(10), " ".repeat(30))));
        assert!(line.contains("1/4 pieces"));
        assert!(line.contains("Peers: 3"));
    }
}
