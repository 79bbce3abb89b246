use reqwest::{Client, Method, Request, Url};
use serde::Deserialize;

use crate::{app_state::AppError, db::DbIndexer, metadata::request_client::LimitedRequestClient};

use super::{SearchResult, TorrentIndex};

/// Generic torznab protocol client. Result fields ride along in
/// `torznab:attr` sidecar tags next to the plain rss item.
#[derive(Debug)]
pub struct TorznabDriver {
    name: String,
    priority: i64,
    base_url: String,
    api_key: String,
    client: LimitedRequestClient,
}

impl TorznabDriver {
    pub fn new(row: &DbIndexer) -> Self {
        let client = Client::new();
        let limited_client = LimitedRequestClient::new(client, 3, std::time::Duration::from_secs(1));
        Self {
            name: row.name.clone(),
            priority: row.priority,
            base_url: row.base_url.clone(),
            api_key: row.api_key.clone(),
            client: limited_client,
        }
    }

    async fn search(&self, function: &str, query: &str) -> Result<Vec<SearchResult>, AppError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| AppError::internal_error(format!("bad torznab url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("t", function)
            .append_pair("q", query);
        if !self.api_key.is_empty() {
            url.query_pairs_mut().append_pair("apikey", &self.api_key);
        }
        let request = Request::new(Method::GET, url);
        let response = self.client.request_raw(request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| AppError::internal_error(format!("failed to read torznab body: {e}")))?;
        parse_torznab(&body, &self.name)
    }
}

#[async_trait::async_trait]
impl TorrentIndex for TorznabDriver {
    async fn search_movies(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        self.search("movie", query).await
    }

    async fn search_shows(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        self.search("tvsearch", query).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

pub fn parse_torznab(xml: &str, source: &str) -> Result<Vec<SearchResult>, AppError> {
    let feed: TorznabFeed = quick_xml::de::from_str(xml)
        .map_err(|e| AppError::internal_error(format!("torznab decode failed: {e}")))?;
    let items = feed.channel.map(|c| c.items).unwrap_or_default();
    Ok(items
        .into_iter()
        .filter_map(|item| item.into_result(source))
        .collect())
}

#[derive(Debug, Deserialize)]
struct TorznabFeed {
    channel: Option<TorznabChannel>,
}

#[derive(Debug, Deserialize)]
struct TorznabChannel {
    #[serde(rename = "item", default)]
    items: Vec<TorznabItem>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TorznabItem {
    title: Option<String>,
    link: Option<String>,
    size: Option<String>,
    enclosure: Option<TorznabEnclosure>,
    #[serde(rename = "torznab:attr", alias = "attr")]
    attrs: Vec<TorznabAttr>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TorznabEnclosure {
    #[serde(rename = "@url")]
    url: Option<String>,
    #[serde(rename = "@length")]
    length: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TorznabAttr {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@value")]
    value: String,
}

impl TorznabItem {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| a.value.as_str())
    }

    fn into_result(self, source: &str) -> Option<SearchResult> {
        let title = self.title.clone().unwrap_or_default();
        if title.is_empty() {
            return None;
        }
        let magnet = self
            .attr("magneturl")
            .map(str::to_string)
            .or_else(|| {
                self.link
                    .clone()
                    .filter(|link| link.starts_with("magnet:"))
            })
            .or_else(|| {
                self.enclosure
                    .as_ref()
                    .and_then(|e| e.url.clone())
                    .filter(|url| url.starts_with("magnet:"))
            })
            .unwrap_or_default();
        let size = self
            .attr("size")
            .and_then(|s| s.parse().ok())
            .or_else(|| self.size.as_deref().and_then(|s| s.parse().ok()))
            .or_else(|| {
                self.enclosure
                    .as_ref()
                    .and_then(|e| e.length.as_deref())
                    .and_then(|l| l.parse().ok())
            })
            .unwrap_or(0);
        let result = SearchResult {
            seeders: self.attr("seeders").and_then(|s| s.parse().ok()).unwrap_or(0),
            peers: self.attr("peers").and_then(|s| s.parse().ok()).unwrap_or(0),
            info_hash: self.attr("infohash").map(str::to_lowercase).unwrap_or_default(),
            resolution: self.attr("resolution").map(str::to_lowercase).unwrap_or_default(),
            quality: self.attr("video").map(str::to_lowercase).unwrap_or_default(),
            title,
            size,
            magnet,
            source: source.to_string(),
        }
        .normalized();
        if result.info_hash.is_empty() {
            return None;
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:torznab="http://torznab.com/schemas/2015/feed">
 <channel>
  <item>
   <title>Example S02E05 720p HDTV</title>
   <link>https://indexer.test/details/9</link>
   <enclosure url="https://indexer.test/dl/9.torrent" length="734003200" type="application/x-bittorrent"/>
   <torznab:attr name="seeders" value="33"/>
   <torznab:attr name="peers" value="11"/>
   <torznab:attr name="infohash" value="AAAABBBBCCCCDDDDEEEEFFFF0000111122223333"/>
   <torznab:attr name="resolution" value="720p"/>
  </item>
  <item>
   <title>Hashless release</title>
   <link>https://indexer.test/details/10</link>
  </item>
 </channel>
</rss>"#;

    #[test]
    fn torznab_attrs_take_precedence() {
        let results = parse_torznab(FEED, "jackett").unwrap();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.seeders, 33);
        assert_eq!(result.peers, 11);
        assert_eq!(result.info_hash, "aaaabbbbccccddddeeeeffff0000111122223333");
        assert_eq!(result.resolution, "720p");
        assert_eq!(result.size, 734003200);
        assert_eq!(result.source, "jackett");
    }

    #[test]
    fn undecodable_feed_is_an_error() {
        assert!(parse_torznab("not xml at all", "x").is_err());
    }
}
