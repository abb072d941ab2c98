//! rust-torrent - Main entry point
//!
//! Command-line front end of the torrent client core.

use anyhow::{Context, Result};
use rust_torrent_core::cli::progress::{print_peers, print_stats, print_torrent_info, print_tracker_stats};
use rust_torrent_core::{
    CachedStore, CliArgs, Command, Config, JsonFileStore, KnownPeer, ProgressDisplay, ReqwestFetcher,
    TorrentClient, TorrentParser, TrackerEvent,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse_args();
    init_logging(&args);
    setup_panic_handler();
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args).context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;

    if let Command::Info { torrent } = &args.command {
        let info = TorrentParser::parse_file(torrent).context("Failed to parse torrent file")?;
        print_torrent_info(&info);
        return Ok(());
    }

    let mut client = open_client(&config).await?;
    match args.command {
        Command::Info { .. } => {}
        Command::Load { torrent } => {
            let metainfo = read_torrent(&torrent)?;
            let hash = client.load(&metainfo).await.context("Failed to load torrent")?;
            println!("{}", hash);
        }
        Command::Unload { info_hash } => {
            client.unload(&info_hash).await.context("Failed to unload torrent")?;
        }
        Command::Announce { info_hash, event } => {
            let stats = client.torrent_stats(&info_hash)?;
            let interval = client
                .announce(&info_hash, event, stats.uploaded, stats.downloaded, stats.left)
                .await;
            print_tracker_stats(&client.tracker_stats(&info_hash)?);
            let interval = interval.context("Announce failed")?;
            println!("Next announce in {}s", interval);
            print_peers(&client.known_peers(&info_hash)?);
        }
        Command::Scrape { info_hash } => {
            let stats = client.scrape(&info_hash).await.context("Scrape failed")?;
            print_tracker_stats(&stats);
        }
        Command::Stats { info_hash } => {
            print_stats(&client.torrent_stats(&info_hash)?);
            print_tracker_stats(&client.tracker_stats(&info_hash)?);
        }
        Command::Peers { info_hash } => {
            print_peers(&client.known_peers(&info_hash)?);
        }
        Command::Download {
            torrent,
            output_dir,
            max_peers,
        } => {
            let result = run_download(&mut client, &torrent, &output_dir, max_peers, config.quiet).await;
            client.stop().await.context("Failed to stop client")?;
            result?;
        }
    }

    info!("rust-torrent finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized at {:?}", args.log_level());
}

async fn open_client(config: &Config) -> Result<TorrentClient> {
    let store = Arc::new(CachedStore::new(Arc::new(JsonFileStore::new(&config.state_path))));
    let fetcher = Arc::new(
        ReqwestFetcher::new(config.client.http_timeout()).context("Failed to create HTTP client")?,
    );
    TorrentClient::new(store, fetcher, config.client.clone())
        .await
        .with_context(|| format!("Failed to open state {}", config.state_path.display()))
}

fn read_torrent(path: &Path) -> Result<Vec<u8>> {
    info!("Loading torrent file: {}", path.display());
    std::fs::read(path).with_context(|| format!("Failed to read torrent file {}", path.display()))
}

/// Download a torrent until complete, then write its files
async fn run_download(
    client: &mut TorrentClient,
    torrent: &Path,
    output_dir: &Path,
    max_peers: usize,
    quiet: bool,
) -> Result<()> {
    let metainfo = read_torrent(torrent)?;
    let info = TorrentParser::parse_bytes(&metainfo).context("Failed to parse torrent file")?;
    let hash = info.info_hash.to_hex();
    if !client.loaded().contains(&hash) {
        client.load(&metainfo).await.context("Failed to load torrent")?;
    }
    client.start().await.context("Failed to start listening")?;

    let shutdown = client.shutdown_handle();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.shutdown();
        }
    });

    let stats = client.torrent_stats(&hash)?;
    let mut progress = ProgressDisplay::new(quiet, stats.downloaded);
    progress.print_status(&format!("Downloading '{}' ({})", info.name, hash));

    let interval = client
        .announce(&hash, TrackerEvent::Started, stats.uploaded, stats.downloaded, stats.left)
        .await
        .context("No tracker answered")?;
    let mut next_announce = Instant::now() + Duration::from_secs(interval.max(30) as u64);

    let piece_count = info.piece_count().max(1) as u32;
    let mut start = 0u32;
    let mut rounds = 0u64;

    while client.torrent_stats(&hash)?.left > 0 {
        if shutdown.is_shutdown() {
            warn!("Interrupted before completion");
            return Ok(());
        }
        rounds += 1;
        trace!("Download round {}", rounds);

        connect_more(client, &hash, max_peers).await?;
        client.handle_small_messages().await?;

        for peer in client.connected_peers(&hash)? {
            if peer.am_choking && peer.peer_interested {
                if let Err(e) = client.unchoke(&hash, &peer.peer).await {
                    debug!("Unchoke of {} failed: {}", peer.peer, e);
                }
            }
        }
        for (peer, pieces) in client.requested_pieces(&hash)? {
            for index in pieces {
                if let Err(e) = client.send_piece(&hash, &peer, index).await {
                    debug!("Serving piece {} to {} failed: {}", index, peer, e);
                }
            }
        }

        let mut requested = HashSet::new();
        for (peer, pieces) in client.available_pieces(&hash, 1, start)? {
            for index in pieces {
                if !requested.insert(index) {
                    continue;
                }
                if let Err(e) = client.request_piece(&hash, &peer, index).await {
                    warn!("Piece {} from {} failed: {}", index, peer, e);
                }
            }
        }
        start = (start + 1) % piece_count;

        let stats = client.torrent_stats(&hash)?;
        progress.update(&stats, client.connected_peers(&hash)?.len())?;

        if Instant::now() >= next_announce {
            match client
                .announce(&hash, TrackerEvent::Regular, stats.uploaded, stats.downloaded, stats.left)
                .await
            {
                Ok(interval) => next_announce = Instant::now() + Duration::from_secs(interval.max(30) as u64),
                Err(e) => {
                    warn!("Periodic announce failed: {}", e);
                    next_announce = Instant::now() + Duration::from_secs(60);
                }
            }
        }
    }

    write_files(client, &hash, output_dir)?;
    let stats = client.torrent_stats(&hash)?;
    progress.print_complete(&stats)?;
    if let Err(e) = client
        .announce(&hash, TrackerEvent::Completed, stats.uploaded, stats.downloaded, 0)
        .await
    {
        warn!("Completion announce failed: {}", e);
    }
    info!("Download of {} finished after {} rounds", hash, rounds);
    Ok(())
}

/// Open sessions to known peers until `max_peers` are connected
async fn connect_more(client: &mut TorrentClient, hash: &str, max_peers: usize) -> Result<()> {
    let connected: HashSet<KnownPeer> = client.connected_peers(hash)?.into_iter().map(|c| c.peer).collect();
    let wanted = max_peers.saturating_sub(connected.len());
    if wanted == 0 {
        return Ok(());
    }

    let candidates: Vec<KnownPeer> = client
        .known_peers(hash)?
        .into_iter()
        .filter(|p| !connected.contains(p))
        .take(wanted)
        .collect();
    for peer in candidates {
        if let Err(e) = client.connect(hash, &peer).await {
            debug!("Connect to {} failed: {}", peer, e);
            client.invalidate_peer(hash, &peer).await?;
        }
    }
    Ok(())
}

fn write_files(client: &TorrentClient, hash: &str, output_dir: &Path) -> Result<()> {
    for (name, data) in client.files(hash)? {
        let path = output_dir.join(&name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, &data).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {} ({} bytes)", path.display(), data.len());
    }
    Ok(())
}
