use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    app_state::AppError,
    indexer::info_hash_from_magnet,
};

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Session with the external qBittorrent daemon.
///
/// Authentication rides on the cookie store; `login` is idempotent and
/// serialized, and any request bounced with 403 triggers one re-login.
/// Status is never cached: the daemon is the source of truth.
#[derive(Debug)]
pub struct TorrentClient {
    http: Client,
    base_url: Url,
    username: String,
    password: String,
    login_lock: Mutex<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentState {
    Downloading,
    Seeding,
    Paused,
    Error,
    Checking,
    Queued,
}

impl TorrentState {
    /// Collapse the daemon's detailed states onto the ones the pipeline
    /// cares about
    fn from_daemon(state: &str) -> Self {
        match state {
            "downloading" | "stalledDL" | "metaDL" | "forcedDL" | "allocating" | "moving" => {
                Self::Downloading
            }
            "uploading" | "stalledUP" | "forcedUP" => Self::Seeding,
            "pausedDL" | "pausedUP" | "stoppedDL" | "stoppedUP" => Self::Paused,
            "error" | "missingFiles" => Self::Error,
            "checkingDL" | "checkingUP" | "checkingResumeData" => Self::Checking,
            _ => Self::Queued,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TorrentStatus {
    pub hash: String,
    pub name: String,
    pub state: TorrentState,
    /// 0.0 to 1.0
    pub progress: f64,
    pub ratio: f64,
    pub save_path: String,
}

impl TorrentStatus {
    pub fn is_still_downloading(&self) -> bool {
        matches!(
            self.state,
            TorrentState::Downloading
                | TorrentState::Checking
                | TorrentState::Queued
                | TorrentState::Error
        ) || self.progress < 1.0
    }
}

#[derive(Debug, Deserialize)]
struct DaemonTorrent {
    hash: String,
    name: String,
    state: String,
    progress: f64,
    ratio: f64,
    save_path: String,
}

impl From<DaemonTorrent> for TorrentStatus {
    fn from(val: DaemonTorrent) -> Self {
        TorrentStatus {
            state: TorrentState::from_daemon(&val.state),
            hash: val.hash.to_lowercase(),
            name: val.name,
            progress: val.progress,
            ratio: val.ratio,
            save_path: val.save_path,
        }
    }
}

impl TorrentClient {
    pub fn new(base_url: &str, username: String, password: String) -> anyhow::Result<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            username,
            password,
            login_lock: Mutex::new(()),
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        self.base_url
            .join(path)
            .expect("api paths are well formed")
    }

    /// Authenticate against the daemon. Safe to call repeatedly; callers
    /// racing each other serialize on the login lock.
    pub async fn login(&self) -> Result<(), AppError> {
        let _guard = self.login_lock.lock().await;
        let response = self
            .http
            .post(self.endpoint("/api/v2/auth/login"))
            .timeout(LOGIN_TIMEOUT)
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() && body.trim() != "Fails." {
            Ok(())
        } else {
            Err(AppError::unauthorized(format!(
                "torrent daemon rejected login with status {status}"
            )))
        }
    }

    /// Run a request, re-authenticating once when the session expired
    async fn with_relogin<F>(&self, send: F) -> Result<reqwest::Response, AppError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let response = send().send().await?;
        if response.status() == StatusCode::FORBIDDEN {
            tracing::debug!("Torrent daemon session expired, logging in again");
            self.login().await?;
            let response = send().send().await?;
            return Ok(response);
        }
        Ok(response)
    }

    /// Hand a magnet to the daemon. Returns the info hash the download is
    /// tracked under.
    pub async fn add(
        &self,
        magnet: &str,
        save_path: &str,
        category: &str,
    ) -> Result<String, AppError> {
        let info_hash = info_hash_from_magnet(magnet)
            .ok_or_else(|| AppError::bad_request("magnet link carries no info hash"))?;
        let response = self
            .with_relogin(|| {
                self.http.post(self.endpoint("/api/v2/torrents/add")).form(&[
                    ("urls", magnet),
                    ("savepath", save_path),
                    ("category", category),
                ])
            })
            .await?;
        if !response.status().is_success() {
            return Err(AppError::internal_error(format!(
                "torrent daemon refused add with status {}",
                response.status()
            )));
        }
        Ok(info_hash)
    }

    pub async fn delete(&self, hash: &str, delete_files: bool) -> Result<(), AppError> {
        let response = self
            .with_relogin(|| {
                self.http
                    .post(self.endpoint("/api/v2/torrents/delete"))
                    .form(&[
                        ("hashes", hash),
                        ("deleteFiles", if delete_files { "true" } else { "false" }),
                    ])
            })
            .await?;
        if !response.status().is_success() {
            return Err(AppError::internal_error(format!(
                "torrent daemon refused delete with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// List torrents, optionally narrowed by the daemon's state filter
    /// (`downloading`, `seeding`, `completed`, ...)
    pub async fn list(&self, filter: Option<&str>) -> Result<Vec<TorrentStatus>, AppError> {
        let mut url = self.endpoint("/api/v2/torrents/info");
        if let Some(filter) = filter {
            url.query_pairs_mut().append_pair("filter", filter);
        }
        let response = self.with_relogin(|| self.http.get(url.clone())).await?;
        let torrents: Vec<DaemonTorrent> = response
            .json()
            .await
            .map_err(|e| AppError::internal_error(format!("daemon list decode failed: {e}")))?;
        Ok(torrents.into_iter().map(Into::into).collect())
    }

    pub async fn status(&self, hash: &str) -> Result<Option<TorrentStatus>, AppError> {
        let mut url = self.endpoint("/api/v2/torrents/info");
        url.query_pairs_mut().append_pair("hashes", hash);
        let response = self.with_relogin(|| self.http.get(url.clone())).await?;
        let torrents: Vec<DaemonTorrent> = response
            .json()
            .await
            .map_err(|e| AppError::internal_error(format!("daemon status decode failed: {e}")))?;
        Ok(torrents.into_iter().next().map(Into::into))
    }

    /// Whether the swarm still owes us bytes. A torrent the daemon does
    /// not know about reads as not found.
    pub async fn is_still_downloading(&self, hash: &str) -> Result<bool, AppError> {
        let status = self
            .status(hash)
            .await?
            .ok_or_else(|| AppError::not_found("torrent daemon does not track this hash"))?;
        Ok(status.is_still_downloading())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: TorrentState, progress: f64) -> TorrentStatus {
        TorrentStatus {
            hash: "aaaa".into(),
            name: "x".into(),
            state,
            progress,
            ratio: 0.0,
            save_path: String::new(),
        }
    }

    #[test]
    fn daemon_states_collapse() {
        assert_eq!(TorrentState::from_daemon("stalledDL"), TorrentState::Downloading);
        assert_eq!(TorrentState::from_daemon("stalledUP"), TorrentState::Seeding);
        assert_eq!(TorrentState::from_daemon("checkingResumeData"), TorrentState::Checking);
        assert_eq!(TorrentState::from_daemon("missingFiles"), TorrentState::Error);
        assert_eq!(TorrentState::from_daemon("somethingNew"), TorrentState::Queued);
    }

    #[test]
    fn still_downloading_is_state_or_progress() {
        assert!(status(TorrentState::Downloading, 1.0).is_still_downloading());
        assert!(status(TorrentState::Error, 1.0).is_still_downloading());
        assert!(status(TorrentState::Seeding, 0.99).is_still_downloading());
        assert!(!status(TorrentState::Seeding, 1.0).is_still_downloading());
        assert!(!status(TorrentState::Paused, 1.0).is_still_downloading());
    }
}
