use std::{
    collections::HashSet,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::Notify, sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    app_state::{AppError, AppErrorKind},
    config,
    db::{Db, DbRequest, MediaKind, MediaStatus, RequestStatus},
    importer::Importer,
    search::{FederatedSearch, SearchQuery},
    torrent::TorrentClient,
};

/// Loop cadence; request creation kicks the loop early through the notify
pub const TICK_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Concurrent requests advanced within one tick
const REQUEST_FANOUT: usize = 8;

const MOVIE_CATEGORY: &str = "quartermaster-movies";
const SHOW_CATEGORY: &str = "quartermaster-shows";

/// Drives every request through its state machine. One loop per process;
/// a per-request in-memory flag keeps concurrent ticks off the same row.
#[derive(Debug)]
pub struct AutomationService {
    db: &'static Db,
    search: &'static FederatedSearch,
    torrent_client: &'static TorrentClient,
    importer: &'static Importer,
    notify: Notify,
    in_progress: Mutex<HashSet<i64>>,
}

impl AutomationService {
    pub fn new(
        db: &'static Db,
        search: &'static FederatedSearch,
        torrent_client: &'static TorrentClient,
        importer: &'static Importer,
    ) -> Self {
        Self {
            db,
            search,
            torrent_client,
            importer,
            notify: Notify::new(),
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    /// Ask the loop to run now. [Notify] holds at most one stored permit,
    /// which gives exactly the "at most one extra run queued" coalescing.
    pub fn trigger_immediate(&self) {
        self.notify.notify_one();
    }

    pub async fn run(&'static self, token: CancellationToken) {
        tracing::info!(interval = ?TICK_INTERVAL, "Automation loop started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
            }
            self.tick().await;
        }
        tracing::info!("Automation loop stopped");
    }

    /// Advance every non-terminal request once. Handlers are idempotent so
    /// re-running a tick is always safe.
    pub async fn tick(&'static self) {
        let requests = match self.db.non_terminal_requests().await {
            Ok(requests) => requests,
            Err(e) => {
                tracing::error!("Failed to load requests: {e}");
                return;
            }
        };
        if requests.is_empty() {
            return;
        }
        tracing::debug!(count = requests.len(), "Automation tick");
        let semaphore = Arc::new(Semaphore::new(REQUEST_FANOUT));
        let mut handles = JoinSet::new();
        for request in requests {
            if !self.claim(request.id) {
                tracing::trace!(request = request.id, "Request already being advanced");
                continue;
            }
            let semaphore = semaphore.clone();
            handles.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("fanout semaphore is never closed");
                let id = request.id;
                let outcome = self.advance(request).await;
                self.release(id);
                (id, outcome)
            });
        }
        while let Some(joined) = handles.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) if e.kind == AppErrorKind::BadRequest => {
                    // the request itself is broken, nothing will fix it
                    tracing::error!(request = id, "Request failed permanently: {e}");
                    let _ = self
                        .db
                        .update_request_status(id, RequestStatus::Failed, Some(&e.message))
                        .await;
                }
                Ok((id, Err(e))) => {
                    tracing::warn!(request = id, "Request advance failed, retrying next tick: {e}")
                }
                Err(e) => tracing::error!("Request advance task panicked: {e}"),
            }
        }
    }

    fn claim(&self, id: i64) -> bool {
        self.in_progress.lock().unwrap().insert(id)
    }

    fn release(&self, id: i64) {
        self.in_progress.lock().unwrap().remove(&id);
    }

    async fn advance(&'static self, request: DbRequest) -> Result<(), AppError> {
        let Some(status) = request.request_status() else {
            return Err(AppError::bad_request(format!(
                "unknown request status {}",
                request.status
            )));
        };
        match status {
            RequestStatus::Pending => self.handle_pending(&request).await,
            RequestStatus::Approved => {
                self.transition(&request, RequestStatus::Searching, None).await
            }
            RequestStatus::Searching => self.handle_searching(&request).await,
            RequestStatus::Downloading => self.handle_downloading(&request).await,
            RequestStatus::Downloaded => self.handle_downloaded(&request).await,
            RequestStatus::Imported => self.handle_imported(&request).await,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::Failed => Ok(()),
        }
    }

    async fn transition(
        &self,
        request: &DbRequest,
        to: RequestStatus,
        reason: Option<&str>,
    ) -> Result<(), AppError> {
        let moved = self.db.update_request_status(request.id, to, reason).await?;
        if moved {
            tracing::info!(request = request.id, from = %request.status, to = %to, "Request transition");
        }
        Ok(())
    }

    async fn handle_pending(&self, request: &DbRequest) -> Result<(), AppError> {
        let auto_approve: config::AutoApprove = config::CONFIG.get_value();
        if auto_approve.0 {
            return self.transition(request, RequestStatus::Approved, None).await;
        }
        // waits for an admin
        Ok(())
    }

    async fn handle_searching(&self, request: &DbRequest) -> Result<(), AppError> {
        let kind = request
            .media_kind()
            .ok_or_else(|| AppError::bad_request("unknown media type"))?;
        match kind {
            MediaKind::Movie => self.search_movie(request).await,
            MediaKind::Show => self.search_show(request).await,
        }
    }

    async fn search_movie(&self, request: &DbRequest) -> Result<(), AppError> {
        let text = match request.year {
            Some(year) => format!("{} {year}", request.title),
            None => request.title.clone(),
        };
        let results = self.search.search(&SearchQuery::movie(text)).await;
        let candidate = results.into_iter().find(viable);
        match candidate {
            Some(result) => {
                let save_path = incoming_root_for(MediaKind::Movie)?;
                let hash = self
                    .torrent_client
                    .add(&result.magnet, &save_path, MOVIE_CATEGORY)
                    .await?;
                tracing::info!(
                    request = request.id,
                    release = result.title,
                    hash,
                    "Release chosen for movie request"
                );
                self.db.add_request_torrent(request.id, None, &hash).await?;
                self.transition(request, RequestStatus::Downloading, None).await
            }
            None => self.note_failed_search_attempt(request).await,
        }
    }

    async fn search_show(&self, request: &DbRequest) -> Result<(), AppError> {
        let seasons = request.season_numbers();
        if seasons.is_empty() {
            return Err(AppError::bad_request("show request without seasons"));
        }
        let already: HashSet<Option<i64>> = self
            .db
            .request_torrents(request.id)
            .await?
            .into_iter()
            .map(|t| t.season)
            .collect();
        let mut missing = 0;
        let mut added = 0;
        for season in &seasons {
            if already.contains(&Some(*season)) {
                continue;
            }
            let query = SearchQuery::show_season(request.title.clone(), *season);
            let results = self.search.search(&query).await;
            match results.into_iter().find(viable) {
                Some(result) => {
                    let save_path = incoming_root_for(MediaKind::Show)?;
                    let hash = self
                        .torrent_client
                        .add(&result.magnet, &save_path, SHOW_CATEGORY)
                        .await?;
                    tracing::info!(
                        request = request.id,
                        season,
                        release = result.title,
                        hash,
                        "Release chosen for season"
                    );
                    self.db
                        .add_request_torrent(request.id, Some(*season), &hash)
                        .await?;
                    added += 1;
                }
                None => {
                    tracing::debug!(request = request.id, season, "No viable release for season");
                    missing += 1;
                }
            }
        }
        if missing == 0 {
            self.transition(request, RequestStatus::Downloading, None).await
        } else if added == 0 {
            self.note_failed_search_attempt(request).await
        } else {
            // partially covered; stay in searching for the rest
            Ok(())
        }
    }

    async fn note_failed_search_attempt(&self, request: &DbRequest) -> Result<(), AppError> {
        let attempts = self.db.bump_search_attempts(request.id).await?;
        let max: config::SearchMaxAttempts = config::CONFIG.get_value();
        tracing::debug!(
            request = request.id,
            attempts,
            max = max.0,
            "Search produced no viable candidate"
        );
        if attempts >= max.0 as i64 {
            self.transition(request, RequestStatus::Failed, Some("no viable release found"))
                .await?;
        }
        Ok(())
    }

    async fn handle_downloading(&self, request: &DbRequest) -> Result<(), AppError> {
        let torrents = self.db.request_torrents(request.id).await?;
        if torrents.is_empty() {
            // hash got lost, go search again
            return self.transition(request, RequestStatus::Searching, None).await;
        }
        for torrent in &torrents {
            match self.torrent_client.status(&torrent.info_hash).await? {
                Some(status) if status.is_still_downloading() => {
                    tracing::trace!(
                        request = request.id,
                        hash = torrent.info_hash,
                        progress = status.progress,
                        "Torrent still downloading"
                    );
                    return Ok(());
                }
                Some(_) => {}
                None => {
                    tracing::warn!(
                        request = request.id,
                        hash = torrent.info_hash,
                        "Torrent daemon does not track this hash"
                    );
                    return Ok(());
                }
            }
        }
        self.transition(request, RequestStatus::Downloaded, None).await
    }

    async fn handle_downloaded(&'static self, request: &DbRequest) -> Result<(), AppError> {
        let kind = request
            .media_kind()
            .ok_or_else(|| AppError::bad_request("unknown media type"))?;
        match kind {
            MediaKind::Movie => {
                let Some(movie) = self.db.movie_by_tmdb_id(&request.external_id).await? else {
                    // the incoming scanner has not discovered or matched it yet
                    tracing::debug!(request = request.id, "Waiting for incoming scan to match movie");
                    return Ok(());
                };
                if movie.imported_at.is_none() {
                    self.importer.import_movie(movie.id).await?;
                }
                let torrents = self.db.request_torrents(request.id).await?;
                if let Some(torrent) = torrents.first() {
                    self.db
                        .set_movie_torrent_hash(movie.id, &torrent.info_hash)
                        .await?;
                }
                self.transition(request, RequestStatus::Imported, None).await
            }
            MediaKind::Show => {
                let Some(show) = self.find_requested_show(request).await? else {
                    tracing::debug!(request = request.id, "Waiting for incoming scan to match show");
                    return Ok(());
                };
                let seasons: HashSet<i64> = request.season_numbers().into_iter().collect();
                let incoming_root = incoming_root_for(MediaKind::Show)?;
                let pending: Vec<_> = self
                    .db
                    .episodes_pending_import()
                    .await?
                    .into_iter()
                    .filter(|e| e.show_id == show.id && seasons.contains(&e.season_number))
                    .filter(|e| Path::new(&e.file_path).starts_with(&incoming_root))
                    .collect();
                if pending.is_empty() {
                    tracing::debug!(request = request.id, "Waiting for incoming scan to find episodes");
                    return Ok(());
                }
                let torrents = self.db.request_torrents(request.id).await?;
                for episode in pending {
                    if let Err(e) = self.importer.import_episode(episode.id).await {
                        tracing::warn!(episode = episode.id, "Episode import failed: {e}");
                        continue;
                    }
                    let hash = torrents
                        .iter()
                        .find(|t| t.season == Some(episode.season_number))
                        .map(|t| t.info_hash.as_str());
                    if let Some(hash) = hash {
                        self.db.set_episode_torrent_hash(episode.id, hash).await?;
                    }
                }
                self.transition(request, RequestStatus::Imported, None).await
            }
        }
    }

    async fn handle_imported(&self, request: &DbRequest) -> Result<(), AppError> {
        let kind = request
            .media_kind()
            .ok_or_else(|| AppError::bad_request("unknown media type"))?;
        let settled = match kind {
            MediaKind::Movie => {
                let movies_path: config::MoviesPath = config::CONFIG.get_value();
                let root = movies_path.0.unwrap_or_default();
                self.db
                    .movie_by_tmdb_id(&request.external_id)
                    .await?
                    .map(|m| {
                        m.imported_at.is_some()
                            && m.status == MediaStatus::Matched.to_string()
                            && Path::new(&m.path).starts_with(&root)
                    })
                    .unwrap_or(false)
            }
            MediaKind::Show => {
                let Some(show) = self.find_requested_show(request).await? else {
                    return Ok(());
                };
                let episodes = self.db.episodes_for_show(show.id).await?;
                request.season_numbers().into_iter().all(|season| {
                    episodes
                        .iter()
                        .any(|e| e.season_number == season && e.imported_at.is_some())
                })
            }
        };
        if settled {
            self.transition(request, RequestStatus::Completed, None).await
        } else {
            Ok(())
        }
    }

    async fn find_requested_show(
        &self,
        request: &DbRequest,
    ) -> Result<Option<crate::db::DbShow>, AppError> {
        if let Some(show) = self.db.show_by_tvdb_id(&request.external_id).await? {
            return Ok(Some(show));
        }
        // metadata may have matched through another provider, fall back to
        // the title snapshot
        let shows = self.db.all_shows().await?;
        Ok(shows.into_iter().find(|s| {
            s.title.eq_ignore_ascii_case(&request.title)
                && (request.year.is_none() || s.year == request.year)
        }))
    }
}

fn viable(result: &crate::indexer::SearchResult) -> bool {
    result.seeders > 0 && !result.magnet.is_empty() && !result.info_hash.is_empty()
}

fn incoming_root_for(kind: MediaKind) -> Result<String, AppError> {
    let path = match kind {
        MediaKind::Movie => {
            let path: config::IncomingMoviesPath = config::CONFIG.get_value();
            path.0
        }
        MediaKind::Show => {
            let path: config::IncomingShowsPath = config::CONFIG.get_value();
            path.0
        }
    };
    path.map(|p| p.to_string_lossy().to_string())
        .ok_or_else(|| AppError::bad_request("incoming root is not configured"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::db::NewRequest;
    use crate::indexer::IndexerRegistry;

    async fn leaked_service() -> (&'static AutomationService, &'static Db) {
        let db: &'static Db = Box::leak(Box::new(test_db().await));
        crate::db::tests::seed_user(db).await;
        let registry: &'static IndexerRegistry = Box::leak(Box::new(IndexerRegistry::new(db)));
        let search: &'static FederatedSearch =
            Box::leak(Box::new(FederatedSearch::new(registry)));
        let torrent_client: &'static TorrentClient = Box::leak(Box::new(
            TorrentClient::new("http://127.0.0.1:1", "admin".into(), String::new()).unwrap(),
        ));
        let importer: &'static Importer = Box::leak(Box::new(Importer::new(db)));
        let service: &'static AutomationService = Box::leak(Box::new(AutomationService::new(
            db,
            search,
            torrent_client,
            importer,
        )));
        (service, db)
    }

    fn request(status: RequestStatus) -> NewRequest {
        NewRequest {
            user_id: 1,
            media_type: MediaKind::Movie,
            external_id: "12345".into(),
            title: "Example".into(),
            year: Some(2020),
            seasons: String::new(),
            status,
        }
    }

    #[test]
    fn claim_is_exclusive_per_request() {
        let in_progress = Mutex::new(HashSet::new());
        assert!(in_progress.lock().unwrap().insert(7));
        assert!(!in_progress.lock().unwrap().insert(7));
        in_progress.lock().unwrap().remove(&7);
        assert!(in_progress.lock().unwrap().insert(7));
    }

    #[tokio::test]
    async fn pending_waits_for_admin_by_default() {
        let (service, db) = leaked_service().await;
        let id = db.insert_request(&request(RequestStatus::Pending)).await.unwrap();
        service.tick().await;
        let row = db.request(id).await.unwrap();
        assert_eq!(row.request_status(), Some(RequestStatus::Pending));
    }

    #[tokio::test]
    async fn approved_moves_to_searching() {
        let (service, db) = leaked_service().await;
        let id = db.insert_request(&request(RequestStatus::Approved)).await.unwrap();
        service.tick().await;
        let row = db.request(id).await.unwrap();
        assert_eq!(row.request_status(), Some(RequestStatus::Searching));
    }

    #[tokio::test]
    async fn searching_without_indexers_eventually_fails() {
        let (service, db) = leaked_service().await;
        let id = db.insert_request(&request(RequestStatus::Searching)).await.unwrap();
        let max: config::SearchMaxAttempts = config::CONFIG.get_value();
        for _ in 0..max.0 {
            service.tick().await;
        }
        let row = db.request(id).await.unwrap();
        assert_eq!(row.request_status(), Some(RequestStatus::Failed));
        assert_eq!(row.reason.as_deref(), Some("no viable release found"));
        assert_eq!(row.search_attempts, max.0 as i64);
    }

    #[tokio::test]
    async fn terminal_requests_are_left_alone() {
        let (service, db) = leaked_service().await;
        let id = db.insert_request(&request(RequestStatus::Pending)).await.unwrap();
        db.update_request_status(id, RequestStatus::Cancelled, None)
            .await
            .unwrap();
        let before = db.request(id).await.unwrap().updated_at;
        service.tick().await;
        let row = db.request(id).await.unwrap();
        assert_eq!(row.request_status(), Some(RequestStatus::Cancelled));
        assert_eq!(row.updated_at, before);
    }
}
