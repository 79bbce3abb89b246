use std::time::Duration;

use reqwest::Client;
use scraper::{Html, Selector};

use crate::{app_state::AppError, db::DbIndexer};

use super::{
    parse_size, DriverSettings, SearchResult, TorrentIndex, BYPASS_DRIVER_TIMEOUT, DRIVER_TIMEOUT,
};

/// Html scraping driver configured per indexer row: search url pattern,
/// css selectors per field and an optional cloudflare bypass proxy.
#[derive(Debug)]
pub struct ScrapeDriver {
    name: String,
    priority: i64,
    settings: DriverSettings,
    bypass: Option<String>,
    client: Client,
}

impl ScrapeDriver {
    pub fn new(row: &DbIndexer, settings: DriverSettings, bypass: Option<String>) -> Self {
        let bypass = bypass.filter(|_| settings.use_bypass);
        let timeout = if bypass.is_some() {
            BYPASS_DRIVER_TIMEOUT
        } else {
            DRIVER_TIMEOUT
        };
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("build to succeed");
        Self {
            name: row.name.clone(),
            priority: row.priority,
            settings,
            bypass,
            client,
        }
    }

    async fn fetch_page(&self, url: &str) -> Result<String, AppError> {
        match &self.bypass {
            Some(bypass_url) => {
                let response = self
                    .client
                    .post(bypass_url)
                    .json(&serde_json::json!({
                        "cmd": "request.get",
                        "url": url,
                        "maxTimeout": BYPASS_DRIVER_TIMEOUT.as_millis() as u64,
                    }))
                    .send()
                    .await?
                    .error_for_status()?;
                let solved: BypassResponse = response.json().await.map_err(|e| {
                    AppError::internal_error(format!("bypass proxy decode failed: {e}"))
                })?;
                Ok(solved.solution.response)
            }
            None => {
                let response = self.client.get(url).send().await?.error_for_status()?;
                response
                    .text()
                    .await
                    .map_err(|e| AppError::internal_error(format!("failed to read page: {e}")))
            }
        }
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        let Some(pattern) = self.settings.search_url.as_deref() else {
            tracing::warn!(indexer = self.name, "Scrape driver has no search url");
            return Ok(Vec::new());
        };
        let url = pattern.replace("{query}", &urlencode(query));
        let html = self.fetch_page(&url).await?;
        Ok(parse_listing(&html, &self.settings, &self.name))
    }
}

#[async_trait::async_trait]
impl TorrentIndex for ScrapeDriver {
    async fn search_movies(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        self.search(query).await
    }

    async fn search_shows(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        self.search(query).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i64 {
        self.priority
    }

    fn request_timeout(&self) -> Duration {
        if self.bypass.is_some() {
            BYPASS_DRIVER_TIMEOUT
        } else {
            DRIVER_TIMEOUT
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct BypassResponse {
    solution: BypassSolution,
}

#[derive(Debug, serde::Deserialize)]
struct BypassSolution {
    response: String,
}

/// Pull search results out of a listing page. Rows that yield no magnet
/// link are dropped, everything else is best effort.
fn parse_listing(html: &str, settings: &DriverSettings, source: &str) -> Vec<SearchResult> {
    let parse_selector = |raw: Option<&str>, fallback: &str| {
        let raw = raw.unwrap_or(fallback);
        Selector::parse(raw).ok()
    };
    let Some(rows) = parse_selector(settings.row_selector.as_deref(), "table tbody tr") else {
        tracing::warn!(source, "Invalid row selector");
        return Vec::new();
    };
    let title = parse_selector(settings.title_selector.as_deref(), "a");
    let magnet = parse_selector(settings.magnet_selector.as_deref(), "a[href^=magnet]");
    let size = parse_selector(settings.size_selector.as_deref(), ".size");
    let seeders = parse_selector(settings.seeders_selector.as_deref(), ".seeds");

    let document = Html::parse_document(html);
    let mut results = Vec::new();
    for row in document.select(&rows) {
        let text_of = |selector: &Option<Selector>| {
            selector.as_ref().and_then(|s| {
                row.select(s)
                    .next()
                    .map(|el| el.text().collect::<String>().trim().to_string())
            })
        };
        let magnet_link = magnet.as_ref().and_then(|s| {
            row.select(s)
                .next()
                .and_then(|el| el.value().attr("href"))
                .map(str::to_string)
        });
        let Some(magnet_link) = magnet_link else {
            continue;
        };
        let result = SearchResult {
            title: text_of(&title).unwrap_or_default(),
            size: text_of(&size).map(|s| parse_size(&s)).unwrap_or(0),
            seeders: text_of(&seeders)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0),
            magnet: magnet_link,
            source: source.to_string(),
            ..Default::default()
        }
        .normalized();
        if result.info_hash.is_empty() {
            continue;
        }
        results.push(result);
    }
    results
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

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<html><body><table><tbody>
<tr>
 <td class="name"><a href="/torrent/1">ignored</a><a href="/torrent/1/x">Example (2020) 1080p</a></td>
 <td class="seeds">120</td>
 <td class="size">1.9 GiB</td>
 <td><a href="magnet:?xt=urn:btih:aaaabbbbccccddddeeeeffff0000111122223333&amp;dn=Example">magnet</a></td>
</tr>
<tr>
 <td class="name"><a href="/torrent/2">No magnet row</a></td>
 <td class="seeds">5</td>
 <td class="size">700 MB</td>
</tr>
</tbody></table></body></html>"#;

    #[test]
    fn listing_parse_drops_rows_without_magnets() {
        let settings = DriverSettings {
            row_selector: Some("table tbody tr".into()),
            title_selector: Some("td.name a:nth-child(2)".into()),
            magnet_selector: Some("a[href^=magnet]".into()),
            size_selector: Some("td.size".into()),
            seeders_selector: Some("td.seeds".into()),
            ..Default::default()
        };
        let results = parse_listing(LISTING, &settings, "1337x");
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.title, "Example (2020) 1080p");
        assert_eq!(result.seeders, 120);
        assert_eq!(result.info_hash, "aaaabbbbccccddddeeeeffff0000111122223333");
        assert_eq!(result.resolution, "1080p");
    }

    #[test]
    fn url_encoding_for_search_pattern() {
        assert_eq!(urlencode("the matrix"), "the+matrix");
        assert_eq!(urlencode("50/50"), "50%2F50");
    }
}
