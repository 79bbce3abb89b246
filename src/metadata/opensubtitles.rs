use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, Method, Request, Url,
};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::app_state::AppError;

use super::request_client::LimitedRequestClient;

/// OpenSubtitles REST client. Requests are rate limited hard because the
/// provider bans greedy consumers.
#[derive(Debug)]
pub struct OpenSubtitlesApi {
    client: LimitedRequestClient,
    base_url: Url,
    username: String,
    password: String,
    token: RwLock<Option<String>>,
}

impl OpenSubtitlesApi {
    const API_URL: &'static str = "https://api.opensubtitles.com/api/v1";
    const RATE_LIMIT: usize = 4;
    const RATE_WINDOW_SECS: u64 = 10;

    pub fn new(api_key: &str, username: String, password: String) -> Self {
        let mut headers = HeaderMap::with_capacity(2);
        headers.insert("Api-Key", HeaderValue::from_str(api_key).expect("key is ascii"));
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(concat!("quartermaster v", env!("CARGO_PKG_VERSION"))),
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("build to succeed");
        let limited_client = LimitedRequestClient::new(
            client,
            Self::RATE_LIMIT,
            std::time::Duration::from_secs(Self::RATE_WINDOW_SECS),
        );
        Self {
            client: limited_client,
            base_url: Url::parse(Self::API_URL).expect("url to parse"),
            username,
            password,
            token: RwLock::new(None),
        }
    }

    fn json_request(
        &self,
        method: Method,
        url: Url,
        body: &serde_json::Value,
    ) -> Request {
        let mut req = Request::new(method, url);
        req.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        *req.body_mut() = Some(body.to_string().into());
        req
    }

    async fn ensure_token(&self) -> Result<String, AppError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut().expect("base url").push("login");
        let body = serde_json::json!({
            "username": self.username,
            "password": self.password,
        });
        let req = self.json_request(Method::POST, url, &body);
        let res: LoginResponse = self.client.request(req).await?;
        *self.token.write().await = Some(res.token.clone());
        Ok(res.token)
    }

    pub async fn search(
        &self,
        imdb_id: &str,
        language: &str,
        episode: Option<(i64, i64)>,
    ) -> Result<Vec<SubtitleRecord>, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut().expect("base url").push("subtitles");
        let id = imdb_id.trim_start_matches("tt");
        match episode {
            Some((season, episode)) => {
                url.query_pairs_mut()
                    .append_pair("parent_imdb_id", id)
                    .append_pair("season_number", &season.to_string())
                    .append_pair("episode_number", &episode.to_string());
            }
            None => {
                url.query_pairs_mut().append_pair("imdb_id", id);
            }
        }
        url.query_pairs_mut()
            .append_pair("languages", language)
            .append_pair("order_by", "download_count");
        let req = Request::new(Method::GET, url);
        let res: SearchResponse = self.client.request(req).await?;
        Ok(res.data)
    }

    async fn download_link(&self, file_id: i64) -> Result<String, AppError> {
        let token = self.ensure_token().await?;
        let mut url = self.base_url.clone();
        url.path_segments_mut().expect("base url").push("download");
        let body = serde_json::json!({ "file_id": file_id });
        let mut req = self.json_request(Method::POST, url, &body);
        req.headers_mut().insert(
            reqwest::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).expect("token is ascii"),
        );
        let res: DownloadResponse = self.client.request(req).await?;
        Ok(res.link)
    }

    /// Best subtitle for the given imdb id, as (file name, contents)
    pub async fn fetch_best(
        &self,
        imdb_id: &str,
        language: &str,
        episode: Option<(i64, i64)>,
    ) -> Result<Option<(String, String)>, AppError> {
        let records = self.search(imdb_id, language, episode).await?;
        let Some(file) = records
            .into_iter()
            .flat_map(|r| r.attributes.files)
            .next()
        else {
            return Ok(None);
        };
        let link = self.download_link(file.file_id).await?;
        let req = Request::new(Method::GET, Url::parse(&link).map_err(|e| {
            AppError::internal_error(format!("bad subtitle download link: {e}"))
        })?);
        let res = self.client.request_raw(req).await?;
        let contents = res.text().await.map_err(|e| {
            AppError::internal_error(format!("failed to read subtitle body: {e}"))
        })?;
        let name = file.file_name.unwrap_or_else(|| format!("{}.srt", file.file_id));
        Ok(Some((name, contents)))
    }
}

/// Ask the ffsubsync sidecar to align a subtitle to its video. The sidecar
/// rewrites the subtitle file in place; on failure the unsynced file stays.
pub async fn sync_with_sidecar(
    sidecar_url: &str,
    video_path: &str,
    subtitle_path: &str,
) -> Result<(), AppError> {
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()
        .expect("build to succeed");
    let res = client
        .post(sidecar_url)
        .json(&serde_json::json!({
            "video": video_path,
            "subtitle": subtitle_path,
        }))
        .send()
        .await?;
    if !res.status().is_success() {
        return Err(AppError::internal_error(format!(
            "subsync sidecar responded with status {}",
            res.status()
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    data: Vec<SubtitleRecord>,
}

#[derive(Debug, Deserialize)]
pub struct SubtitleRecord {
    pub attributes: SubtitleAttributes,
}

#[derive(Debug, Deserialize)]
pub struct SubtitleAttributes {
    pub language: Option<String>,
    #[serde(default)]
    pub files: Vec<SubtitleFile>,
}

#[derive(Debug, Deserialize)]
pub struct SubtitleFile {
    pub file_id: i64,
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    link: String,
}
