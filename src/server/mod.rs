use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    routing::{delete, get, post},
    Router,
};

use crate::app_state::{AppError, AppState};
use crate::db::DbUser;

pub mod request_api;
pub mod torznab_api;

/// The requester, resolved from the identity header the presentation
/// layer sets after validating the session cookie.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub DbUser);

/// A [CurrentUser] that passed the admin gate
#[derive(Debug, Clone)]
pub struct AdminUser(pub DbUser);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| AppError::unauthorized("authentication required"))?;
        let user = state
            .db
            .user(user_id)
            .await
            .map_err(|_| AppError::unauthorized("authentication required"))?;
        Ok(CurrentUser(user))
    }
}

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin {
            return Err(AppError::forbidden("admin required"));
        }
        Ok(AdminUser(user))
    }
}

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/requests", post(request_api::create_request))
        .route("/requests", get(request_api::list_requests))
        .route("/requests/{id}", delete(request_api::delete_request))
        .route(
            "/requests/{id}/status",
            post(request_api::update_request_status),
        )
        .route("/library/status", get(request_api::check_library_status))
        .route("/library/scan", post(request_api::start_scan))
        .route("/library/scans", get(request_api::active_scans))
        .route(
            "/library/import/movies",
            post(request_api::import_all_movies),
        )
        .route("/library/import/shows", post(request_api::import_all_shows))
        .route("/search", get(request_api::search))
        .route("/indexers", get(request_api::list_indexers))
        .route("/indexers/{id}/enabled", post(request_api::set_indexer_enabled))
        .route("/nuke", delete(request_api::nuke))
        .route("/torznab/api", get(torznab_api::torznab))
}
