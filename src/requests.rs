use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    app_state::AppError,
    automation::AutomationService,
    config,
    db::{Db, DbRequest, DbUser, MediaKind, MediaStatus, NewRequest, RequestStatus},
    torrent::TorrentClient,
};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequestPayload {
    pub media_type: MediaKind,
    pub external_id: String,
    pub title: String,
    pub year: Option<i64>,
    /// Comma joined season numbers, required for shows
    pub seasons: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LibraryStatus {
    pub exists: bool,
    pub local_id: Option<i64>,
    /// Season numbers present in the library (shows only)
    pub seasons: Vec<i64>,
    /// Season numbers an active request already covers
    pub requested_seasons: Vec<i64>,
    pub message: Option<String>,
}

/// Normalize a season list: numeric, deduplicated, ascending
fn normalize_seasons(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|s| s.trim().parse::<i64>().ok())
        .filter(|s| *s > 0)
        .collect::<BTreeSet<i64>>()
        .into_iter()
        .collect()
}

fn join_seasons(seasons: &[i64]) -> String {
    seasons
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Create a request, enforcing the dedupe contract: media already in the
/// library or an active request for the same media is a conflict. Kicks
/// the automation loop on success.
pub async fn create_request(
    db: &Db,
    automation: &AutomationService,
    user: &DbUser,
    payload: CreateRequestPayload,
) -> Result<i64, AppError> {
    if payload.title.trim().is_empty() || payload.external_id.trim().is_empty() {
        return Err(AppError::bad_request("title and external id are required"));
    }
    let seasons = match payload.media_type {
        MediaKind::Movie => Vec::new(),
        MediaKind::Show => {
            let seasons = normalize_seasons(payload.seasons.as_deref().unwrap_or_default());
            if seasons.is_empty() {
                return Err(AppError::bad_request("show requests need at least one season"));
            }
            seasons
        }
    };

    let status = check_library_status(db, payload.media_type, &payload.external_id).await?;
    if status.exists && covers(&status.seasons, &seasons, payload.media_type) {
        return Err(AppError::conflict("Already in library"));
    }
    for active in db
        .active_requests_for(payload.media_type, &payload.external_id)
        .await?
    {
        let clashes = match payload.media_type {
            MediaKind::Movie => true,
            // a disjoint season set is a new request, overlap is not
            MediaKind::Show => {
                let active_seasons = active.season_numbers();
                seasons.iter().any(|s| active_seasons.contains(s))
            }
        };
        if clashes {
            return Err(AppError::conflict("Already requested"));
        }
    }

    let auto_approve: config::AutoApprove = config::CONFIG.get_value();
    let initial_status = if auto_approve.0 {
        RequestStatus::Approved
    } else {
        RequestStatus::Pending
    };
    let id = db
        .insert_request(&NewRequest {
            user_id: user.id,
            media_type: payload.media_type,
            external_id: payload.external_id.trim().to_string(),
            title: payload.title.trim().to_string(),
            year: payload.year,
            seasons: join_seasons(&seasons),
            status: initial_status,
        })
        .await?;
    tracing::info!(
        request = id,
        user = user.username,
        title = payload.title,
        "Request created"
    );
    automation.trigger_immediate();
    Ok(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminAction {
    Approve,
    Deny,
}

/// Admin gate for the pending queue
pub async fn update_request_status(
    db: &Db,
    admin: &DbUser,
    id: i64,
    action: AdminAction,
) -> Result<(), AppError> {
    if !admin.is_admin {
        return Err(AppError::forbidden("admin required"));
    }
    let request = db.request(id).await?;
    match action {
        AdminAction::Approve => {
            if request.request_status() != Some(RequestStatus::Pending) {
                return Err(AppError::conflict("request is not waiting for approval"));
            }
            db.update_request_status(id, RequestStatus::Approved, None)
                .await?;
        }
        AdminAction::Deny => {
            if request.request_status().map(|s| s.is_terminal()).unwrap_or(true) {
                return Err(AppError::conflict("request already settled"));
            }
            db.update_request_status(id, RequestStatus::Cancelled, Some("denied"))
                .await?;
        }
    }
    Ok(())
}

/// Cancel a request and drop its row. The daemon is asked to forget the
/// torrents (keeping files); daemon errors are logged, never surfaced.
pub async fn delete_request(
    db: &Db,
    torrent_client: &TorrentClient,
    user: &DbUser,
    id: i64,
) -> Result<(), AppError> {
    let request = db.request(id).await?;
    if request.user_id != user.id && !user.is_admin {
        return Err(AppError::forbidden("not your request"));
    }
    for torrent in db.request_torrents(id).await? {
        if let Err(e) = torrent_client.delete(&torrent.info_hash, false).await {
            tracing::warn!(
                hash = torrent.info_hash,
                "Failed to remove torrent for deleted request: {e}"
            );
        }
    }
    db.update_request_status(id, RequestStatus::Cancelled, Some("deleted"))
        .await?;
    db.delete_request(id).await?;
    tracing::info!(request = id, user = user.username, "Request deleted");
    Ok(())
}

pub async fn list_requests(
    db: &Db,
    status: Option<RequestStatus>,
    user_id: Option<i64>,
) -> Result<Vec<DbRequest>, AppError> {
    Ok(db.list_requests(status, user_id).await?)
}

/// Powers the "Already in library / Already requested" badges
pub async fn check_library_status(
    db: &Db,
    kind: MediaKind,
    external_id: &str,
) -> Result<LibraryStatus, AppError> {
    let active = db.active_requests_for(kind, external_id).await?;
    let has_active = !active.is_empty();
    let requested_seasons: Vec<i64> = active
        .iter()
        .flat_map(|r| r.season_numbers())
        .collect::<BTreeSet<i64>>()
        .into_iter()
        .collect();
    match kind {
        MediaKind::Movie => {
            let movies_path: config::MoviesPath = config::CONFIG.get_value();
            let root = movies_path.0.unwrap_or_default();
            let movie = db.movie_by_tmdb_id(external_id).await?;
            let in_root = |path: &str| {
                !root.as_os_str().is_empty() && Path::new(path).starts_with(&root)
            };
            let exists = movie
                .as_ref()
                .map(|m| {
                    m.status == MediaStatus::Matched.to_string()
                        && (m.imported_at.is_some() || in_root(&m.path))
                })
                .unwrap_or(false);
            Ok(LibraryStatus {
                exists,
                local_id: movie.map(|m| m.id),
                seasons: Vec::new(),
                message: build_message(exists, has_active),
                requested_seasons,
            })
        }
        MediaKind::Show => {
            let show = db.show_by_tvdb_id(external_id).await?;
            let (local_id, seasons) = match &show {
                Some(show) => {
                    let episodes = db.episodes_for_show(show.id).await?;
                    let seasons: BTreeSet<i64> =
                        episodes.iter().map(|e| e.season_number).collect();
                    (Some(show.id), seasons.into_iter().collect())
                }
                None => (None, Vec::new()),
            };
            let exists = !seasons.is_empty();
            Ok(LibraryStatus {
                exists,
                local_id,
                message: build_message(exists, has_active),
                seasons,
                requested_seasons,
            })
        }
    }
}

fn build_message(exists: bool, has_active_request: bool) -> Option<String> {
    if exists {
        Some("In Library".to_string())
    } else if has_active_request {
        Some("Already requested".to_string())
    } else {
        None
    }
}

/// A movie request is covered by the library as soon as the movie exists;
/// a show request only when every asked-for season is present
fn covers(library_seasons: &[i64], wanted: &[i64], kind: MediaKind) -> bool {
    match kind {
        MediaKind::Movie => true,
        MediaKind::Show => wanted.iter().all(|s| library_seasons.contains(s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{seed_user, test_db};
    use crate::db::{Db, NewEpisode, NewShow};
    use crate::importer::Importer;
    use crate::indexer::IndexerRegistry;
    use crate::search::FederatedSearch;

    async fn fixture() -> (&'static Db, &'static AutomationService, DbUser) {
        let db: &'static Db = Box::leak(Box::new(test_db().await));
        let user_id = seed_user(db).await;
        let user = db.user(user_id).await.unwrap();
        let registry: &'static IndexerRegistry = Box::leak(Box::new(IndexerRegistry::new(db)));
        let search: &'static FederatedSearch =
            Box::leak(Box::new(FederatedSearch::new(registry)));
        let torrent_client: &'static TorrentClient = Box::leak(Box::new(
            TorrentClient::new("http://127.0.0.1:1", "admin".into(), String::new()).unwrap(),
        ));
        let importer: &'static Importer = Box::leak(Box::new(Importer::new(db)));
        let automation: &'static AutomationService = Box::leak(Box::new(AutomationService::new(
            db,
            search,
            torrent_client,
            importer,
        )));
        (db, automation, user)
    }

    fn movie_payload(external_id: &str) -> CreateRequestPayload {
        CreateRequestPayload {
            media_type: MediaKind::Movie,
            external_id: external_id.into(),
            title: "Example".into(),
            year: Some(2020),
            seasons: None,
        }
    }

    #[test]
    fn season_normalization() {
        assert_eq!(normalize_seasons("2, 1,2,x, 3"), vec![1, 2, 3]);
        assert_eq!(normalize_seasons(""), Vec::<i64>::new());
        assert_eq!(join_seasons(&[1, 2]), "1,2");
    }

    #[tokio::test]
    async fn duplicate_request_is_a_conflict() {
        let (db, automation, user) = fixture().await;
        create_request(db, automation, &user, movie_payload("12345"))
            .await
            .unwrap();
        let err = create_request(db, automation, &user, movie_payload("12345"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::app_state::AppErrorKind::Conflict);
        assert_eq!(err.message, "Already requested");
        assert_eq!(db.list_requests(None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn show_request_requires_seasons() {
        let (db, automation, user) = fixture().await;
        let payload = CreateRequestPayload {
            media_type: MediaKind::Show,
            external_id: "77".into(),
            title: "Example Show".into(),
            year: None,
            seasons: Some(" ,x".into()),
        };
        let err = create_request(db, automation, &user, payload).await.unwrap_err();
        assert_eq!(err.kind, crate::app_state::AppErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn admin_gate_on_approval() {
        let (db, automation, admin) = fixture().await;
        let mut plain = admin.clone();
        plain.is_admin = false;
        let id = create_request(db, automation, &admin, movie_payload("9"))
            .await
            .unwrap();
        let err = update_request_status(db, &plain, id, AdminAction::Approve)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::app_state::AppErrorKind::Forbidden);
        update_request_status(db, &admin, id, AdminAction::Approve)
            .await
            .unwrap();
        let row = db.request(id).await.unwrap();
        assert_eq!(row.request_status(), Some(RequestStatus::Approved));
        // approving twice is a conflict
        let err = update_request_status(db, &admin, id, AdminAction::Approve)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::app_state::AppErrorKind::Conflict);
    }

    #[tokio::test]
    async fn library_status_reports_show_seasons() {
        let (db, _automation, _user) = fixture().await;
        let show_id = db
            .upsert_show(&NewShow {
                title: "Example Show".into(),
                year: Some(2019),
                path: "/media/shows/Example Show (2019)".into(),
            })
            .await
            .unwrap();
        sqlx::query("UPDATE shows SET tvdb_id = '77', status = 'matched' WHERE id = ?")
            .bind(show_id)
            .execute(&db.pool)
            .await
            .unwrap();
        let season_id = db.upsert_season(show_id, 1).await.unwrap();
        db.upsert_episode(&NewEpisode {
            season_id,
            number: 1,
            title: String::new(),
            file_path: "/media/shows/Example Show (2019)/Season 01/e1.mkv".into(),
            quality: String::new(),
            size: 1,
        })
        .await
        .unwrap();

        let status = check_library_status(db, MediaKind::Show, "77").await.unwrap();
        assert!(status.exists);
        assert_eq!(status.local_id, Some(show_id));
        assert_eq!(status.seasons, vec![1]);
        assert_eq!(status.message.as_deref(), Some("In Library"));

        let missing = check_library_status(db, MediaKind::Show, "404").await.unwrap();
        assert!(!missing.exists);
        assert!(missing.message.is_none());
    }
}
