use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    app_state::{AppError, AppState},
    config,
    db::{DbRequest, MediaKind, RequestStatus},
    importer::ImportReport,
    indexer::SearchResult,
    library::{self, ScanKind, ScanSummary},
    posters::PosterCache,
    requests::{self, AdminAction, CreateRequestPayload, LibraryStatus},
    search::SearchQuery,
};

use super::{AdminUser, CurrentUser};

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: i64,
}

pub async fn create_request(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<CreateRequestPayload>,
) -> Result<Json<CreatedResponse>, AppError> {
    let id = requests::create_request(state.db, state.automation, &user, payload).await?;
    Ok(Json(CreatedResponse { id }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<RequestStatus>,
}

pub async fn list_requests(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DbRequest>>, AppError> {
    // non admins only see their own queue
    let user_filter = (!user.is_admin).then_some(user.id);
    let requests = requests::list_requests(state.db, query.status, user_filter).await?;
    Ok(Json(requests))
}

pub async fn delete_request(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    requests::delete_request(state.db, state.torrent_client, &user, id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

#[derive(Debug, Deserialize)]
pub struct StatusPayload {
    pub action: AdminAction,
}

pub async fn update_request_status(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    Json(payload): Json<StatusPayload>,
) -> Result<Json<serde_json::Value>, AppError> {
    requests::update_request_status(state.db, &admin, id, payload.action).await?;
    state.automation.trigger_immediate();
    Ok(Json(serde_json::json!({ "updated": id })))
}

#[derive(Debug, Deserialize)]
pub struct LibraryStatusQuery {
    pub media_type: MediaKind,
    pub external_id: String,
}

pub async fn check_library_status(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(query): Query<LibraryStatusQuery>,
) -> Result<Json<LibraryStatus>, AppError> {
    let status =
        requests::check_library_status(state.db, query.media_type, &query.external_id).await?;
    Ok(Json(status))
}

#[derive(Debug, Deserialize)]
pub struct ScanPayload {
    pub kind: ScanKind,
}

/// Kick a scan of one root. Conflicts immediately when that scan kind is
/// already running; the scan itself continues in the background.
pub async fn start_scan(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Json(payload): Json<ScanPayload>,
) -> Result<Json<serde_json::Value>, AppError> {
    let kind = payload.kind;
    if state.scan_tracker.is_running(kind) {
        return Err(AppError::conflict(format!("{kind} scan already running")));
    }
    let root = scan_root(kind)?;
    let db = state.db;
    let tracker = state.scan_tracker;
    let metadata = state.metadata;
    tokio::spawn(async move {
        let result: Result<ScanSummary, AppError> = match kind {
            ScanKind::IncomingMovies | ScanKind::MovieLibrary => {
                library::scan_movie_root(db, tracker, kind, &root).await
            }
            ScanKind::IncomingShows | ScanKind::ShowLibrary => {
                library::scan_show_root(db, tracker, kind, &root).await
            }
        };
        match result {
            Ok(summary) => {
                if let Err(e) = library::match_discovered(db, metadata, PosterCache::new()).await {
                    tracing::error!("Matching after manual scan failed: {e}");
                }
                tracing::info!(?summary, %kind, "Manual scan finished");
            }
            Err(e) => tracing::error!(%kind, "Manual scan failed: {e}"),
        }
    });
    Ok(Json(serde_json::json!({ "started": kind })))
}

fn scan_root(kind: ScanKind) -> Result<std::path::PathBuf, AppError> {
    let root = match kind {
        ScanKind::IncomingMovies => config::CONFIG.get_value::<config::IncomingMoviesPath>().0,
        ScanKind::IncomingShows => config::CONFIG.get_value::<config::IncomingShowsPath>().0,
        ScanKind::MovieLibrary => config::CONFIG.get_value::<config::MoviesPath>().0,
        ScanKind::ShowLibrary => config::CONFIG.get_value::<config::ShowsPath>().0,
    };
    root.ok_or_else(|| AppError::bad_request(format!("{kind} root is not configured")))
}

/// What the progress indicators poll
pub async fn active_scans(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
) -> Json<Vec<ScanKind>> {
    Json(state.scan_tracker.active())
}

pub async fn import_all_movies(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<ImportReport>, AppError> {
    let report = state.importer.import_all_movies().await?;
    Ok(Json(report))
}

pub async fn import_all_shows(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<ImportReport>, AppError> {
    let report = state.importer.import_all_shows().await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct ManualSearchQuery {
    pub q: String,
    pub media_type: Option<MediaKind>,
    pub season: Option<i64>,
}

pub async fn search(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(query): Query<ManualSearchQuery>,
) -> Result<Json<Vec<SearchResult>>, AppError> {
    if query.q.trim().is_empty() {
        return Ok(Json(Vec::new()));
    }
    let results = state
        .search
        .search(&SearchQuery {
            text: query.q,
            kind: query.media_type.unwrap_or(MediaKind::Movie),
            season: query.season,
            episode: None,
        })
        .await;
    Ok(Json(results))
}

pub async fn list_indexers(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Vec<crate::db::DbIndexer>>, AppError> {
    Ok(Json(state.db.all_indexers().await?))
}

#[derive(Debug, Deserialize)]
pub struct EnabledPayload {
    pub enabled: bool,
}

pub async fn set_indexer_enabled(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<i64>,
    Json(payload): Json<EnabledPayload>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.db.set_indexer_enabled(id, payload.enabled).await?;
    Ok(Json(serde_json::json!({ "updated": id })))
}

/// Drop every media row and request in one transaction. The filesystem
/// is untouched; a rescan rebuilds the library.
pub async fn nuke(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
) -> Result<Json<serde_json::Value>, AppError> {
    state.db.nuke().await?;
    tracing::warn!(admin = admin.username, "Nuked all media and requests");
    Ok(Json(serde_json::json!({ "nuked": true })))
}
