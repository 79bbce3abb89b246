use std::{future::Future, path::PathBuf, time::Duration};

use time::OffsetDateTime;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config,
    db::{Db, DbEpisodeContext, DbMovie, RequestStatus},
    importer::Importer,
    indexer::IndexerRegistry,
    library::{self, ScanKind, ScanTracker},
    metadata::{opensubtitles, opensubtitles::OpenSubtitlesApi, MetadataStack},
    posters::PosterCache,
    torrent::TorrentClient,
    utils,
};

const INCOMING_SCAN_INTERVAL: Duration = Duration::from_secs(5 * 60);
const REQUEST_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const SEEDING_CLEANUP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const SUBTITLE_SCAN_INTERVAL: Duration = Duration::from_secs(60 * 60);
const FEED_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Cap of subtitle downloads per pass so one sweep cannot exhaust the
/// provider quota
const SUBTITLE_BATCH: usize = 20;

/// Everything the background fleet needs, shared by reference from main
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    pub db: &'static Db,
    pub metadata: &'static MetadataStack,
    pub torrent_client: &'static TorrentClient,
    pub importer: &'static Importer,
    pub scan_tracker: &'static ScanTracker,
    pub registry: &'static IndexerRegistry,
    pub subtitles: Option<&'static OpenSubtitlesApi>,
}

/// Spawn the timer driven workers onto the shared task tracker. All of
/// them stop within one iteration of the token being cancelled.
pub fn spawn_workers(ctx: WorkerContext, tracker: &TaskTracker, token: CancellationToken) {
    spawn_worker(tracker, token.clone(), "incoming-scan", INCOMING_SCAN_INTERVAL, move || {
        incoming_scan(ctx)
    });
    spawn_worker(
        tracker,
        token.clone(),
        "request-cleanup",
        REQUEST_CLEANUP_INTERVAL,
        move || completed_request_cleanup(ctx.db),
    );
    spawn_worker(
        tracker,
        token.clone(),
        "seeding-cleanup",
        SEEDING_CLEANUP_INTERVAL,
        move || seeding_cleanup(ctx.db, ctx.torrent_client),
    );
    spawn_worker(
        tracker,
        token.clone(),
        "subtitle-scan",
        SUBTITLE_SCAN_INTERVAL,
        move || subtitle_scan(ctx.db, ctx.subtitles),
    );
    spawn_worker(
        tracker,
        token,
        "feed-cache-sweep",
        FEED_CACHE_SWEEP_INTERVAL,
        move || async move {
            let removed = ctx.registry.rss_cache().sweep();
            if removed > 0 {
                tracing::debug!(removed, "Swept expired feed cache entries");
            }
        },
    );
}

fn spawn_worker<F, Fut>(
    tracker: &TaskTracker,
    token: CancellationToken,
    name: &'static str,
    period: Duration,
    action: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tracker.spawn(async move {
        tracing::info!(worker = name, period = ?period, "Worker started");
        // stagger first runs so the fleet does not stampede at startup
        tokio::time::sleep(Duration::from_millis(rand::random_range(0..2000))).await;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            action().await;
        }
        tracing::info!(worker = name, "Worker stopped");
    });
}

/// Discover whatever the torrent daemon finished writing into the
/// incoming roots, then match the new rows. The two roots scan in
/// parallel; a scan kind already running is simply skipped this round.
async fn incoming_scan(ctx: WorkerContext) {
    let incoming_movies: config::IncomingMoviesPath = config::CONFIG.get_value();
    let incoming_shows: config::IncomingShowsPath = config::CONFIG.get_value();

    let movie_scan = async {
        if let Some(root) = existing_root(incoming_movies.0) {
            match library::scan_movie_root(ctx.db, ctx.scan_tracker, ScanKind::IncomingMovies, &root)
                .await
            {
                Ok(_) => {}
                Err(e) if e.kind == crate::app_state::AppErrorKind::Conflict => {
                    tracing::debug!("Incoming movie scan already running")
                }
                Err(e) => tracing::error!("Incoming movie scan failed: {e}"),
            }
        }
    };
    let show_scan = async {
        if let Some(root) = existing_root(incoming_shows.0) {
            match library::scan_show_root(ctx.db, ctx.scan_tracker, ScanKind::IncomingShows, &root)
                .await
            {
                Ok(_) => {}
                Err(e) if e.kind == crate::app_state::AppErrorKind::Conflict => {
                    tracing::debug!("Incoming show scan already running")
                }
                Err(e) => tracing::error!("Incoming show scan failed: {e}"),
            }
        }
    };
    tokio::join!(movie_scan, show_scan);

    if let Err(e) = library::match_discovered(ctx.db, ctx.metadata, PosterCache::new()).await {
        tracing::error!("Matching discovered media failed: {e}");
    }
}

fn existing_root(root: Option<PathBuf>) -> Option<PathBuf> {
    let root = root?;
    if root.try_exists().unwrap_or(false) {
        Some(root)
    } else {
        tracing::warn!(root = %root.display(), "Configured root does not exist");
        None
    }
}

/// Drop terminal requests that outlived their retention
async fn completed_request_cleanup(db: &Db) {
    let retention_days: config::RequestRetentionDays = config::CONFIG.get_value();
    let cancelled_hours: config::CancelledRetentionHours = config::CONFIG.get_value();
    let requests = match db.terminal_requests().await {
        Ok(requests) => requests,
        Err(e) => {
            tracing::error!("Failed to load terminal requests: {e}");
            return;
        }
    };
    let now = OffsetDateTime::now_utc();
    let mut removed = 0;
    for request in requests {
        let Some(updated_at) = utils::parse_rfc3339(&request.updated_at) else {
            continue;
        };
        let retention = if request.request_status() == Some(RequestStatus::Cancelled) {
            Duration::from_secs(cancelled_hours.0 * 60 * 60)
        } else {
            Duration::from_secs(retention_days.0 * 24 * 60 * 60)
        };
        if now - updated_at > retention {
            match db.delete_request(request.id).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(request = request.id, "Failed to clean up request: {e}"),
            }
        }
    }
    if removed > 0 {
        tracing::info!(removed, "Cleaned up terminal requests");
    }
}

/// Remove torrents that finished seeding their share: ratio above the
/// threshold and the library row they fed already imported. Files stay.
async fn seeding_cleanup(db: &Db, torrent_client: &TorrentClient) {
    let ratio_limit: config::SeedingRatioLimit = config::CONFIG.get_value();
    let seeding = match torrent_client.list(Some("seeding")).await {
        Ok(seeding) => seeding,
        Err(e) => {
            tracing::warn!("Torrent daemon unreachable for seeding cleanup: {e}");
            return;
        }
    };
    for torrent in seeding {
        if torrent.ratio < ratio_limit.0 {
            continue;
        }
        let imported = media_is_imported(db, &torrent.hash).await;
        if !imported {
            continue;
        }
        match torrent_client.delete(&torrent.hash, false).await {
            Ok(()) => tracing::info!(
                hash = torrent.hash,
                name = torrent.name,
                ratio = torrent.ratio,
                "Removed seeded torrent"
            ),
            Err(e) => tracing::warn!(hash = torrent.hash, "Failed to remove torrent: {e}"),
        }
    }
}

async fn media_is_imported(db: &Db, hash: &str) -> bool {
    match db.movie_by_torrent_hash(hash).await {
        Ok(Some(movie)) => return movie.imported_at.is_some(),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!("Movie lookup by hash failed: {e}");
            return false;
        }
    }
    match db.episode_by_torrent_hash(hash).await {
        Ok(Some(episode)) => episode.imported_at.is_some(),
        Ok(None) => false,
        Err(e) => {
            tracing::warn!("Episode lookup by hash failed: {e}");
            false
        }
    }
}

/// Fetch subtitles for imported library media that has none yet
async fn subtitle_scan(db: &Db, subtitles: Option<&'static OpenSubtitlesApi>) {
    let Some(subtitles) = subtitles else {
        return;
    };
    let movies = match db.imported_movies_missing_subtitles().await {
        Ok(movies) => movies,
        Err(e) => {
            tracing::error!("Failed to load movies for subtitle scan: {e}");
            return;
        }
    };
    let episodes = match db.episodes_pending_subtitles().await {
        Ok(episodes) => episodes,
        Err(e) => {
            tracing::error!("Failed to load episodes for subtitle scan: {e}");
            return;
        }
    };

    let mut budget = SUBTITLE_BATCH;
    for movie in movies {
        if budget == 0 {
            break;
        }
        budget -= 1;
        fetch_movie_subtitle(db, subtitles, &movie).await;
    }
    for episode in episodes {
        if budget == 0 {
            break;
        }
        budget -= 1;
        fetch_episode_subtitle(db, subtitles, &episode).await;
    }
}

async fn fetch_movie_subtitle(db: &Db, subtitles: &OpenSubtitlesApi, movie: &DbMovie) {
    let Some(imdb_id) = movie.imdb_id.as_deref().filter(|id| !id.is_empty()) else {
        return;
    };
    match subtitles.fetch_best(imdb_id, "en", None).await {
        Ok(Some((_, contents))) => {
            if write_subtitle(&movie.path, &contents).await {
                let _ = db.set_movie_subtitles_synced(movie.id).await;
                tracing::info!(title = movie.title, "Fetched movie subtitles");
            }
        }
        Ok(None) => tracing::debug!(title = movie.title, "No subtitles available"),
        Err(e) => tracing::warn!(title = movie.title, "Subtitle fetch failed: {e}"),
    }
}

async fn fetch_episode_subtitle(
    db: &Db,
    subtitles: &OpenSubtitlesApi,
    episode: &DbEpisodeContext,
) {
    let Some(imdb_id) = episode.show_imdb_id.as_deref().filter(|id| !id.is_empty()) else {
        return;
    };
    let result = subtitles
        .fetch_best(imdb_id, "en", Some((episode.season_number, episode.number)))
        .await;
    match result {
        Ok(Some((_, contents))) => {
            if write_subtitle(&episode.file_path, &contents).await {
                let _ = db.set_episode_subtitles_synced(episode.id).await;
                tracing::info!(
                    show = episode.show_title,
                    season = episode.season_number,
                    episode = episode.number,
                    "Fetched episode subtitles"
                );
            }
        }
        Ok(None) => tracing::debug!(file = episode.file_path, "No subtitles available"),
        Err(e) => tracing::warn!(file = episode.file_path, "Subtitle fetch failed: {e}"),
    }
}

/// Write the subtitle next to its video, optionally passing it through
/// the sync sidecar afterwards
async fn write_subtitle(video_path: &str, contents: &str) -> bool {
    let video = PathBuf::from(video_path);
    let Some(stem) = video.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let subtitle_path = video.with_file_name(format!("{stem}.en.srt"));
    if let Err(e) = tokio::fs::write(&subtitle_path, contents).await {
        tracing::warn!(path = %subtitle_path.display(), "Failed to write subtitle: {e}");
        return false;
    }
    let subsync: config::EnableSubsync = config::CONFIG.get_value();
    let sidecar: config::FfsubsyncUrl = config::CONFIG.get_value();
    if subsync.0 {
        if let Some(url) = sidecar.0 {
            if let Err(e) = opensubtitles::sync_with_sidecar(
                &url,
                video_path,
                &subtitle_path.to_string_lossy(),
            )
            .await
            {
                tracing::warn!("Subtitle sync sidecar failed, keeping unsynced file: {e}");
            }
        }
    }
    true
}
