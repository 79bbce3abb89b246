use std::{error::Error, fmt::Display, num::ParseIntError};

use axum::{http::StatusCode, response::IntoResponse, Json};
use tokio_util::sync::CancellationToken;

use crate::{
    automation::AutomationService,
    db::Db,
    importer::Importer,
    indexer::IndexerRegistry,
    library::ScanTracker,
    metadata::MetadataStack,
    search::FederatedSearch,
    torrent::TorrentClient,
};

#[derive(Debug, Clone)]
pub struct AppState {
    pub db: &'static Db,
    pub torrent_client: &'static TorrentClient,
    pub registry: &'static IndexerRegistry,
    pub search: &'static FederatedSearch,
    pub metadata: &'static MetadataStack,
    pub scan_tracker: &'static ScanTracker,
    pub importer: &'static Importer,
    pub automation: &'static AutomationService,
    pub cancellation_token: CancellationToken,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AppError {
    pub message: String,
    #[serde(skip)]
    pub kind: AppErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    InternalError,
}

impl Error for AppError {}

impl Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            AppErrorKind::BadRequest => write!(f, "Bad Request: {}", self.message),
            AppErrorKind::Unauthorized => write!(f, "Unauthorized: {}", self.message),
            AppErrorKind::Forbidden => write!(f, "Forbidden: {}", self.message),
            AppErrorKind::NotFound => write!(f, "Not Found: {}", self.message),
            AppErrorKind::Conflict => write!(f, "Conflict: {}", self.message),
            AppErrorKind::InternalError => write!(f, "Internal Error: {}", self.message),
        }
    }
}

impl From<AppErrorKind> for StatusCode {
    fn from(val: AppErrorKind) -> Self {
        match val {
            AppErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            AppErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            AppErrorKind::Forbidden => StatusCode::FORBIDDEN,
            AppErrorKind::NotFound => StatusCode::NOT_FOUND,
            AppErrorKind::Conflict => StatusCode::CONFLICT,
            AppErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            kind: AppErrorKind::InternalError,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::RowNotFound => AppError {
                message: "Database row not found".to_string(),
                kind: AppErrorKind::NotFound,
            },
            rest => AppError {
                message: rest.to_string(),
                kind: AppErrorKind::InternalError,
            },
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => AppError {
                message: value.to_string(),
                kind: AppErrorKind::NotFound,
            },
            _ => AppError {
                message: value.to_string(),
                kind: AppErrorKind::InternalError,
            },
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        AppError {
            message: value.to_string(),
            kind: AppErrorKind::InternalError,
        }
    }
}

impl From<ParseIntError> for AppError {
    fn from(value: ParseIntError) -> Self {
        AppError {
            message: value.to_string(),
            kind: AppErrorKind::BadRequest,
        }
    }
}

impl AppError {
    pub fn new(message: impl AsRef<str>, kind: AppErrorKind) -> Self {
        Self {
            message: message.as_ref().into(),
            kind,
        }
    }

    pub fn bad_request(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::BadRequest)
    }

    pub fn unauthorized(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::Unauthorized)
    }

    pub fn forbidden(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::Forbidden)
    }

    pub fn not_found(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::NotFound)
    }

    pub fn conflict(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::Conflict)
    }

    pub fn internal_error(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::InternalError)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status: StatusCode = self.kind.into();
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::{AppError, AppErrorKind};
    use axum::http::StatusCode;

    #[test]
    fn kinds_map_to_status_codes() {
        assert_eq!(StatusCode::from(AppErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(
            StatusCode::from(AppErrorKind::Unauthorized),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            StatusCode::from(AppErrorKind::InternalError),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn row_not_found_becomes_not_found() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind, AppErrorKind::NotFound);
    }
}
