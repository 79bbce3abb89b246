use reqwest::{Client, Method, Request, Url};
use serde::Deserialize;

use crate::{app_state::AppError, db::DbIndexer, metadata::request_client::LimitedRequestClient};

use super::{info_hash_from_magnet, SearchResult, TorrentIndex};

/// Movie-only json-api driver. Shows always resolve to an empty list.
#[derive(Debug)]
pub struct YtsDriver {
    name: String,
    priority: i64,
    base_url: Url,
    client: LimitedRequestClient,
}

impl YtsDriver {
    pub fn new(row: &DbIndexer) -> Self {
        let client = Client::new();
        let limited_client = LimitedRequestClient::new(client, 2, std::time::Duration::from_secs(1));
        let base_url = Url::parse(&row.base_url)
            .unwrap_or_else(|_| Url::parse("https://yts.mx/api/v2/list_movies.json").unwrap());
        Self {
            name: row.name.clone(),
            priority: row.priority,
            base_url,
            client: limited_client,
        }
    }
}

#[async_trait::async_trait]
impl TorrentIndex for YtsDriver {
    async fn search_movies(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair("query_term", query);
        let request = Request::new(Method::GET, url);
        let response: YtsResponse = self.client.request(request).await?;
        let movies = response.data.movies.unwrap_or_default();
        Ok(movies
            .into_iter()
            .flat_map(|movie| {
                let title = movie.title_long.clone();
                let source = self.name.clone();
                movie.torrents.into_iter().map(move |torrent| {
                    torrent.into_result(&title, &source).normalized()
                })
            })
            .collect())
    }

    async fn search_shows(&self, _query: &str) -> Result<Vec<SearchResult>, AppError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

#[derive(Debug, Deserialize)]
struct YtsResponse {
    data: YtsData,
}

#[derive(Debug, Deserialize)]
struct YtsData {
    movies: Option<Vec<YtsMovie>>,
}

#[derive(Debug, Deserialize)]
struct YtsMovie {
    title_long: String,
    #[serde(default)]
    torrents: Vec<YtsTorrent>,
}

#[derive(Debug, Deserialize)]
struct YtsTorrent {
    hash: String,
    quality: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    seeds: Option<u64>,
    peers: Option<u64>,
    size_bytes: Option<u64>,
}

impl YtsTorrent {
    fn into_result(self, title: &str, source: &str) -> SearchResult {
        let hash = self.hash.to_lowercase();
        let magnet = format!(
            "magnet:?xt=urn:btih:{hash}&dn={}",
            urlencode(&format!("{title} {}", self.quality))
        );
        SearchResult {
            title: format!("{title} {} {}", self.quality, self.kind.unwrap_or_default()),
            size: self.size_bytes.unwrap_or(0),
            seeders: self.seeds.unwrap_or(0),
            peers: self.peers.unwrap_or(0),
            info_hash: info_hash_from_magnet(&magnet).unwrap_or(hash),
            magnet,
            source: source.to_string(),
            resolution: self.quality.to_lowercase(),
            ..Default::default()
        }
    }
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
