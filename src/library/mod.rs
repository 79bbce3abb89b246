use std::{
    collections::HashSet,
    path::Path,
    sync::{Arc, Mutex},
};

use serde::Serialize;
use tokio::{sync::mpsc, task::JoinSet};

use crate::{
    app_state::AppError,
    db::{Db, DbMovie, DbShow, MediaKind, MediaMatch, MediaStatus, NewEpisode, NewMovie, NewShow},
    indexer::extract_resolution,
    metadata::MetadataStack,
    posters::PosterCache,
    utils,
};

pub mod movie;
pub mod show;

use movie::MovieIdentifier;
use show::{parse_season_dir, EpisodeIdentifier};

/// Matcher pool size for the metadata phase
pub const MATCH_WORKERS: usize = 4;
const MATCH_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    IncomingMovies,
    IncomingShows,
    MovieLibrary,
    ShowLibrary,
}

serde_plain::derive_display_from_serialize!(ScanKind);

/// Process wide set of scans currently running. Starting a kind that is
/// already active is refused, which is what the progress indicators and
/// the conflict responses are built on.
#[derive(Debug, Clone, Default)]
pub struct ScanTracker {
    active: Arc<Mutex<HashSet<ScanKind>>>,
}

impl ScanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a scan kind. `None` means this kind is already running.
    pub fn try_begin(&self, kind: ScanKind) -> Option<ScanGuard> {
        let mut active = self.active.lock().unwrap();
        if !active.insert(kind) {
            return None;
        }
        Some(ScanGuard {
            active: self.active.clone(),
            kind,
        })
    }

    pub fn is_running(&self, kind: ScanKind) -> bool {
        self.active.lock().unwrap().contains(&kind)
    }

    pub fn active(&self) -> Vec<ScanKind> {
        self.active.lock().unwrap().iter().copied().collect()
    }
}

#[derive(Debug)]
pub struct ScanGuard {
    active: Arc<Mutex<HashSet<ScanKind>>>,
    kind: ScanKind,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.kind);
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ScanSummary {
    pub movies: usize,
    pub shows: usize,
    pub episodes: usize,
}

/// Discovery phase over a movie root. Every top level directory is a
/// candidate; the largest video file inside is the movie file.
pub async fn scan_movie_root(
    db: &Db,
    tracker: &ScanTracker,
    kind: ScanKind,
    root: &Path,
) -> Result<ScanSummary, AppError> {
    let Some(_guard) = tracker.try_begin(kind) else {
        return Err(AppError::conflict(format!("{kind} scan already running")));
    };
    tracing::info!(root = %root.display(), "Scanning movie root");
    let mut summary = ScanSummary::default();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let dir_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let Some(identifier) = MovieIdentifier::parse(dir_name) else {
            tracing::debug!(directory = dir_name, "Skipping unparseable movie directory");
            continue;
        };
        let Some((video, size)) = largest_video_file(&path) else {
            tracing::debug!(directory = dir_name, "No video file in movie directory");
            continue;
        };
        let file_name = video.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        db.upsert_movie(&NewMovie {
            title: identifier.title,
            year: identifier.year,
            path: video.to_string_lossy().to_string(),
            quality: extract_resolution(file_name),
            size,
        })
        .await?;
        summary.movies += 1;
    }
    tracing::info!(movies = summary.movies, "Movie root scan finished");
    Ok(summary)
}

/// Discovery phase over a show root: show directories containing
/// `Season N` directories containing `SxxEyy` files.
pub async fn scan_show_root(
    db: &Db,
    tracker: &ScanTracker,
    kind: ScanKind,
    root: &Path,
) -> Result<ScanSummary, AppError> {
    let Some(_guard) = tracker.try_begin(kind) else {
        return Err(AppError::conflict(format!("{kind} scan already running")));
    };
    tracing::info!(root = %root.display(), "Scanning show root");
    let mut summary = ScanSummary::default();
    for entry in std::fs::read_dir(root)? {
        let show_dir = entry?.path();
        if !show_dir.is_dir() {
            continue;
        }
        let dir_name = show_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let Some(identifier) = MovieIdentifier::parse(dir_name) else {
            tracing::debug!(directory = dir_name, "Skipping unparseable show directory");
            continue;
        };
        let show_id = db
            .upsert_show(&NewShow {
                title: identifier.title,
                year: identifier.year,
                path: show_dir.to_string_lossy().to_string(),
            })
            .await?;
        summary.shows += 1;
        summary.episodes += scan_show_directory(db, show_id, &show_dir).await?;
    }
    tracing::info!(
        shows = summary.shows,
        episodes = summary.episodes,
        "Show root scan finished"
    );
    Ok(summary)
}

async fn scan_show_directory(db: &Db, show_id: i64, show_dir: &Path) -> Result<usize, AppError> {
    let mut episodes = 0;
    for entry in std::fs::read_dir(show_dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if path.is_dir() {
            let Some(season_number) = parse_season_dir(name) else {
                tracing::debug!(directory = name, "Skipping non-season directory");
                continue;
            };
            let season_id = db.upsert_season(show_id, season_number).await?;
            for video in utils::walk_recursive(&path, Some(|p: &Path| utils::is_video_file(p)))? {
                episodes += upsert_episode_file(db, season_id, &video).await? as usize;
            }
        } else if utils::is_video_file(&path) {
            // tolerate episodes dropped next to the season folders
            let Some(id) = EpisodeIdentifier::parse(name) else {
                continue;
            };
            let season_id = db.upsert_season(show_id, id.season).await?;
            episodes += upsert_episode_file(db, season_id, &path).await? as usize;
        }
    }
    Ok(episodes)
}

async fn upsert_episode_file(db: &Db, season_id: i64, video: &Path) -> Result<bool, AppError> {
    let file_name = video.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let Some(identifier) = EpisodeIdentifier::parse(file_name) else {
        tracing::debug!(file = file_name, "Episode file without SxxEyy token");
        return Ok(false);
    };
    let size = std::fs::metadata(video).map(|m| m.len() as i64).unwrap_or(0);
    db.upsert_episode(&NewEpisode {
        season_id,
        number: identifier.episode,
        title: String::new(),
        file_path: video.to_string_lossy().to_string(),
        quality: extract_resolution(file_name),
        size,
    })
    .await?;
    Ok(true)
}

fn largest_video_file(dir: &Path) -> Option<(std::path::PathBuf, i64)> {
    let files = utils::walk_recursive(dir, Some(|p: &Path| utils::is_video_file(p))).ok()?;
    files
        .into_iter()
        .map(|f| {
            let size = std::fs::metadata(&f).map(|m| m.len() as i64).unwrap_or(0);
            (f, size)
        })
        .max_by_key(|(_, size)| *size)
}

/// Matching phase: every `discovered` row is pushed through the metadata
/// stack by a small worker pool. Rows nothing matched become `unmatched`
/// and wait for operator action.
pub async fn match_discovered(
    db: &'static Db,
    metadata: &'static MetadataStack,
    posters: PosterCache,
) -> Result<(), AppError> {
    let movies = db.movies_with_status(MediaStatus::Discovered).await?;
    let shows = db.shows_with_status(MediaStatus::Discovered).await?;
    let total = movies.len() + shows.len();
    if total == 0 {
        return Ok(());
    }
    tracing::info!(total, "Matching discovered library rows");

    let (tx, rx) = mpsc::channel::<MatchItem>(MATCH_QUEUE_DEPTH);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let mut workers = JoinSet::new();
    for _ in 0..MATCH_WORKERS {
        let rx = rx.clone();
        let posters = posters.clone();
        workers.spawn(async move {
            loop {
                let item = { rx.lock().await.recv().await };
                let Some(item) = item else {
                    break;
                };
                match item {
                    MatchItem::Movie(movie) => match_movie(db, metadata, &posters, movie).await,
                    MatchItem::Show(show) => match_show(db, metadata, &posters, show).await,
                }
            }
        });
    }

    for movie in movies {
        let _ = tx.send(MatchItem::Movie(movie)).await;
    }
    for show in shows {
        let _ = tx.send(MatchItem::Show(show)).await;
    }
    drop(tx);

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Match worker panicked: {e}");
        }
    }
    Ok(())
}

enum MatchItem {
    Movie(DbMovie),
    Show(DbShow),
}

async fn match_movie(db: &Db, metadata: &MetadataStack, posters: &PosterCache, movie: DbMovie) {
    let found = match metadata.identify_movie(&movie.title, movie.year).await {
        Some(found) => Some(found),
        // year out of the file name may be wrong, retry title only
        None if movie.year.is_some() => metadata.identify_movie(&movie.title, None).await,
        None => None,
    };
    match found {
        Some(meta) => {
            let poster = meta.poster.clone();
            let media_match = MediaMatch {
                title: meta.title.clone(),
                year: meta.year,
                external_id: Some(meta.external_id.clone()),
                imdb_id: meta.imdb_id.clone(),
                overview: meta.overview.clone().unwrap_or_default(),
                poster: meta.poster.clone(),
                genres: meta.genres.join(","),
                metadata_blob: serde_json::to_string(&meta).ok(),
            };
            if let Err(e) = db.set_movie_match(movie.id, &media_match).await {
                tracing::error!("Failed to persist movie match: {e}");
                return;
            }
            if let Some(url) = poster {
                if let Err(e) = posters.cache_media_poster(MediaKind::Movie, movie.id, &url).await {
                    tracing::warn!("Failed to cache movie poster: {e}");
                }
            }
            tracing::debug!(title = movie.title, "Matched movie");
        }
        None => {
            tracing::warn!(title = movie.title, "No metadata match for movie");
            if let Err(e) = db.set_movie_status(movie.id, MediaStatus::Unmatched).await {
                tracing::error!("Failed to mark movie unmatched: {e}");
            }
        }
    }
}

async fn match_show(db: &Db, metadata: &MetadataStack, posters: &PosterCache, show: DbShow) {
    let found = match metadata.identify_show(&show.title, show.year).await {
        Some(found) => Some(found),
        None if show.year.is_some() => metadata.identify_show(&show.title, None).await,
        None => None,
    };
    match found {
        Some(meta) => {
            let poster = meta.poster.clone();
            let media_match = MediaMatch {
                title: meta.title.clone(),
                year: meta.year,
                external_id: Some(meta.external_id.clone()),
                imdb_id: meta.imdb_id.clone(),
                overview: meta.overview.clone().unwrap_or_default(),
                poster: meta.poster.clone(),
                genres: meta.genres.join(","),
                metadata_blob: serde_json::to_string(&meta).ok(),
            };
            if let Err(e) = db.set_show_match(show.id, &media_match).await {
                tracing::error!("Failed to persist show match: {e}");
                return;
            }
            if let Some(url) = poster {
                if let Err(e) = posters.cache_media_poster(MediaKind::Show, show.id, &url).await {
                    tracing::warn!("Failed to cache show poster: {e}");
                }
            }
            tracing::debug!(title = show.title, "Matched show");
        }
        None => {
            tracing::warn!(title = show.title, "No metadata match for show");
            if let Err(e) = db.set_show_status(show.id, MediaStatus::Unmatched).await {
                tracing::error!("Failed to mark show unmatched: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use std::fs;
    use std::path::PathBuf;

    fn temp_tree() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push("quartermaster-test");
        path.push(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&path).unwrap();
        path
    }

    fn write_file(path: &Path, bytes: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn tracker_refuses_second_scan_of_same_kind() {
        let tracker = ScanTracker::new();
        let guard = tracker.try_begin(ScanKind::IncomingMovies);
        assert!(guard.is_some());
        assert!(tracker.try_begin(ScanKind::IncomingMovies).is_none());
        // other kinds are unaffected
        assert!(tracker.try_begin(ScanKind::ShowLibrary).is_some());
        assert!(tracker.is_running(ScanKind::IncomingMovies));
        drop(guard);
        assert!(tracker.try_begin(ScanKind::IncomingMovies).is_some());
    }

    #[test_log::test(tokio::test)]
    async fn movie_scan_picks_largest_video_and_is_idempotent() {
        let db = test_db().await;
        let tracker = ScanTracker::new();
        let root = temp_tree();
        let dir = root.join("Example (2020)");
        write_file(&dir.join("sample.mkv"), 10);
        write_file(&dir.join("Example.2020.1080p.mkv"), 1000);
        write_file(&dir.join("cover.jpg"), 50_000);

        let summary = scan_movie_root(&db, &tracker, ScanKind::MovieLibrary, &root)
            .await
            .unwrap();
        assert_eq!(summary.movies, 1);
        let movies = db.all_movies().await.unwrap();
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0].title, "Example");
        assert_eq!(movies[0].year, Some(2020));
        assert_eq!(movies[0].quality, "1080p");
        assert!(movies[0].path.ends_with("Example.2020.1080p.mkv"));
        let updated_at = movies[0].updated_at.clone();

        // second scan of the unchanged tree leaves the row alone
        scan_movie_root(&db, &tracker, ScanKind::MovieLibrary, &root)
            .await
            .unwrap();
        let movies = db.all_movies().await.unwrap();
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0].updated_at, updated_at);

        let _ = fs::remove_dir_all(&root);
    }

    #[test_log::test(tokio::test)]
    async fn show_scan_builds_three_level_hierarchy() {
        let db = test_db().await;
        let tracker = ScanTracker::new();
        let root = temp_tree();
        let show = root.join("Example Show (2019)");
        write_file(&show.join("Season 01").join("Example.Show.S01E01.720p.mkv"), 100);
        write_file(&show.join("Season 01").join("Example.Show.S01E02.720p.mkv"), 100);
        write_file(&show.join("Season 02").join("Example.Show.S02E01.720p.mkv"), 100);
        write_file(&show.join("Season 01").join("notes.txt"), 5);

        let summary = scan_show_root(&db, &tracker, ScanKind::ShowLibrary, &root)
            .await
            .unwrap();
        assert_eq!(summary.shows, 1);
        assert_eq!(summary.episodes, 3);

        let shows = db.all_shows().await.unwrap();
        assert_eq!(shows.len(), 1);
        let seasons = db.seasons_for_show(shows[0].id).await.unwrap();
        assert_eq!(seasons.len(), 2);
        let episodes = db.episodes_for_show(shows[0].id).await.unwrap();
        assert_eq!(episodes.len(), 3);
        assert!(episodes.iter().all(|e| e.quality == "720p"));

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn concurrent_scan_of_same_kind_conflicts() {
        let db = test_db().await;
        let tracker = ScanTracker::new();
        let root = temp_tree();
        let _guard = tracker.try_begin(ScanKind::MovieLibrary).unwrap();
        let err = scan_movie_root(&db, &tracker, ScanKind::MovieLibrary, &root)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::app_state::AppErrorKind::Conflict);
        let _ = fs::remove_dir_all(&root);
    }
}
