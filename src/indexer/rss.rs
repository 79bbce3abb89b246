use std::{
    collections::HashMap,
    sync::{Arc, LazyLock, RwLock},
    time::{Duration, Instant},
};

use regex::Regex;
use reqwest::{Client, Method, Request, Url};
use serde::Deserialize;

use crate::{app_state::AppError, db::DbIndexer, metadata::request_client::LimitedRequestClient};

use super::{info_hash_from_magnet, parse_size, SearchResult, TorrentIndex};

const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

static SEEDERS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)seeders?\D{0,3}(\d+)").unwrap());
static LEECHERS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)leechers?\D{0,3}(\d+)").unwrap());

/// Feed results keyed by (query, category), expired lazily on read and by
/// the periodic sweep worker.
#[derive(Debug)]
pub struct RssCache {
    ttl: Duration,
    entries: RwLock<HashMap<(String, String), (Instant, Vec<SearchResult>)>>,
}

impl RssCache {
    pub fn new() -> Self {
        Self::with_ttl(CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, query: &str, category: &str) -> Option<Vec<SearchResult>> {
        let key = (query.to_string(), category.to_string());
        let expired = {
            let entries = self.entries.read().unwrap();
            match entries.get(&key) {
                Some((stored, results)) if stored.elapsed() < self.ttl => {
                    return Some(results.clone());
                }
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.entries.write().unwrap().remove(&key);
        }
        None
    }

    pub fn insert(&self, query: &str, category: &str, results: Vec<SearchResult>) {
        self.entries.write().unwrap().insert(
            (query.to_string(), category.to_string()),
            (Instant::now(), results),
        );
    }

    /// Drop every expired entry. Called by a background worker so the map
    /// does not grow on queries nobody repeats.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, (stored, _)| stored.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RssCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Generic RSS feed driver. Info hash, size and seeder counts frequently
/// hide in the item description, so parsing is regex based and forgiving.
#[derive(Debug)]
pub struct RssDriver {
    name: String,
    priority: i64,
    base_url: String,
    client: LimitedRequestClient,
    cache: Arc<RssCache>,
}

impl RssDriver {
    pub fn new(row: &DbIndexer, cache: Arc<RssCache>) -> Self {
        let client = Client::new();
        let limited_client = LimitedRequestClient::new(client, 2, std::time::Duration::from_secs(1));
        Self {
            name: row.name.clone(),
            priority: row.priority,
            base_url: row.base_url.clone(),
            client: limited_client,
            cache,
        }
    }

    async fn search(&self, query: &str, category: &str) -> Result<Vec<SearchResult>, AppError> {
        if let Some(cached) = self.cache.get(query, category) {
            tracing::debug!(indexer = self.name, query, "Feed cache hit");
            return Ok(cached);
        }
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| AppError::internal_error(format!("bad feed url: {e}")))?;
        url.query_pairs_mut().append_pair("q", query);
        if !category.is_empty() {
            url.query_pairs_mut().append_pair("c", category);
        }
        let request = Request::new(Method::GET, url);
        let response = self.client.request_raw(request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| AppError::internal_error(format!("failed to read feed body: {e}")))?;
        let results = parse_feed(&body, &self.name)?;
        self.cache.insert(query, category, results.clone());
        Ok(results)
    }
}

#[async_trait::async_trait]
impl TorrentIndex for RssDriver {
    async fn search_movies(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        self.search(query, "movies").await
    }

    async fn search_shows(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        self.search(query, "tv").await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

pub fn parse_feed(xml: &str, source: &str) -> Result<Vec<SearchResult>, AppError> {
    let feed: RssFeed = quick_xml::de::from_str(xml)
        .map_err(|e| AppError::internal_error(format!("feed decode failed: {e}")))?;
    let items = feed.channel.map(|c| c.items).unwrap_or_default();
    Ok(items
        .into_iter()
        .filter_map(|item| item.into_result(source))
        .collect())
}

#[derive(Debug, Deserialize)]
struct RssFeed {
    channel: Option<RssChannel>,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    /// Some feeds carry the hash in a namespaced sidecar tag
    #[serde(rename = "nyaa:infoHash", alias = "infoHash")]
    info_hash: Option<String>,
    #[serde(rename = "nyaa:seeders", alias = "seeders")]
    seeders: Option<String>,
    #[serde(rename = "nyaa:leechers", alias = "leechers")]
    leechers: Option<String>,
    #[serde(rename = "nyaa:size", alias = "size")]
    size: Option<String>,
}

impl RssItem {
    fn into_result(self, source: &str) -> Option<SearchResult> {
        let title = self.title.unwrap_or_default();
        if title.is_empty() {
            return None;
        }
        let description = self.description.unwrap_or_default();
        let link = self.link.unwrap_or_default();
        let magnet = if link.starts_with("magnet:") {
            link.clone()
        } else {
            String::new()
        };
        let info_hash = self
            .info_hash
            .map(|h| h.to_lowercase())
            .filter(|h| h.len() == 40)
            .or_else(|| info_hash_from_magnet(&magnet))
            .or_else(|| info_hash_from_magnet(&description))?;
        let seeders = self
            .seeders
            .and_then(|s| s.parse().ok())
            .or_else(|| capture_number(&SEEDERS_REGEX, &description))
            .unwrap_or(0);
        let peers = self
            .leechers
            .and_then(|s| s.parse().ok())
            .or_else(|| capture_number(&LEECHERS_REGEX, &description))
            .unwrap_or(0);
        let size = self
            .size
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| parse_size(&description));
        Some(
            SearchResult {
                title,
                size,
                seeders,
                peers,
                magnet,
                info_hash,
                source: source.to_string(),
                ..Default::default()
            }
            .normalized(),
        )
    }
}

fn capture_number(regex: &Regex, haystack: &str) -> Option<u64> {
    regex.captures(haystack).and_then(|c| c[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
 <channel>
  <title>index</title>
  <item>
   <title>Example S01E01 1080p WEB-DL</title>
   <link>magnet:?xt=urn:btih:AAAABBBBCCCCDDDDEEEEFFFF0000111122223333&amp;dn=Example</link>
   <description>Seeders: 42 | Leechers: 7 | Size: 1.4 GiB</description>
  </item>
  <item>
   <title>No hash anywhere</title>
   <link>https://example.test/details/17</link>
   <description>Seeders: 5</description>
  </item>
 </channel>
</rss>"#;

    #[test]
    fn feed_parsing_extracts_fields_from_description() {
        let results = parse_feed(FEED, "nyaa").unwrap();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.info_hash, "aaaabbbbccccddddeeeeffff0000111122223333");
        assert_eq!(result.seeders, 42);
        assert_eq!(result.peers, 7);
        assert_eq!(result.size, (1.4 * (1u64 << 30) as f64) as u64);
        assert_eq!(result.resolution, "1080p");
        assert_eq!(result.source, "nyaa");
    }

    #[test]
    fn cache_expires_and_sweeps() {
        let cache = RssCache::with_ttl(Duration::from_secs(0));
        cache.insert("query", "tv", vec![SearchResult::default()]);
        assert!(cache.get("query", "tv").is_none());
        cache.insert("other", "tv", Vec::new());
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_round_trip() {
        let cache = RssCache::new();
        cache.insert("query", "movies", vec![SearchResult::default()]);
        assert_eq!(cache.get("query", "movies").unwrap().len(), 1);
        assert!(cache.get("query", "tv").is_none());
        assert_eq!(cache.sweep(), 0);
    }
}
