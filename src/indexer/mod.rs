use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    app_state::AppError,
    config,
    db::{Db, DbIndexer},
};

pub mod apibay;
pub mod rss;
pub mod scrape;
pub mod torznab;
pub mod yts;

pub const DRIVER_TIMEOUT: Duration = Duration::from_secs(30);
pub const BYPASS_DRIVER_TIMEOUT: Duration = Duration::from_secs(90);

static INFO_HASH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"btih:([a-fA-F0-9]{40})").unwrap());
static SIZE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([\d]+(?:[.,]\d+)?)\s*(KiB|MiB|GiB|TiB|KB|MB|GB|TB|B)").unwrap());
static RESOLUTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(2160p|1080p|720p|576p|480p)\b").unwrap());
static QUALITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(blu-?ray|b[dr]rip|web-?dl|webrip|hdtv|dvdrip|cam|hdrip|remux)\b").unwrap()
});

/// One release candidate in the uniform shape all drivers produce.
/// Fields are best effort: anything a source does not expose stays zero
/// or empty and the consumers treat it that way.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub size: u64,
    pub seeders: u64,
    pub peers: u64,
    pub magnet: String,
    /// 40 hex chars, lowercase
    pub info_hash: String,
    /// Indexer name this result came from
    pub source: String,
    pub resolution: String,
    pub quality: String,
}

impl SearchResult {
    /// Fill hash/resolution/quality that can be derived from other fields
    pub fn normalized(mut self) -> Self {
        if self.info_hash.is_empty() {
            if let Some(hash) = info_hash_from_magnet(&self.magnet) {
                self.info_hash = hash;
            }
        } else {
            self.info_hash = self.info_hash.to_lowercase();
        }
        if self.resolution.is_empty() {
            self.resolution = extract_resolution(&self.title);
        }
        if self.quality.is_empty() {
            self.quality = extract_quality(&self.title);
        }
        self
    }
}

#[async_trait::async_trait]
pub trait TorrentIndex {
    async fn search_movies(&self, query: &str) -> Result<Vec<SearchResult>, AppError>;

    async fn search_shows(&self, query: &str) -> Result<Vec<SearchResult>, AppError>;

    fn name(&self) -> &str;

    fn priority(&self) -> i64;

    /// Budget the federated layer gives one call to this driver
    fn request_timeout(&self) -> Duration {
        DRIVER_TIMEOUT
    }
}

pub fn info_hash_from_magnet(magnet: &str) -> Option<String> {
    INFO_HASH_REGEX
        .captures(magnet)
        .map(|c| c[1].to_lowercase())
}

/// Parse sizes like "1.4 GiB" or "700 MB" into bytes
pub fn parse_size(text: &str) -> u64 {
    let Some(captures) = SIZE_REGEX.captures(text) else {
        return 0;
    };
    let number: f64 = captures[1].replace(',', ".").parse().unwrap_or(0.0);
    let multiplier: u64 = match captures[2].to_ascii_uppercase().as_str() {
        "KIB" | "KB" => 1 << 10,
        "MIB" | "MB" => 1 << 20,
        "GIB" | "GB" => 1 << 30,
        "TIB" | "TB" => 1 << 40,
        _ => 1,
    };
    (number * multiplier as f64) as u64
}

pub fn extract_resolution(title: &str) -> String {
    RESOLUTION_REGEX
        .captures(title)
        .map(|c| c[1].to_lowercase())
        .unwrap_or_default()
}

pub fn extract_quality(title: &str) -> String {
    QUALITY_REGEX
        .captures(title)
        .map(|c| c[1].to_lowercase())
        .unwrap_or_default()
}

/// Per-row driver settings stored in the indexer's opaque json config
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Builtin driver selector: json, yts, rss or scrape
    pub driver: Option<String>,
    /// Search page pattern with a `{query}` placeholder (scrape driver)
    pub search_url: Option<String>,
    pub row_selector: Option<String>,
    pub title_selector: Option<String>,
    pub magnet_selector: Option<String>,
    pub size_selector: Option<String>,
    pub seeders_selector: Option<String>,
    /// Route this indexer through the cloudflare bypass proxy
    pub use_bypass: bool,
}

impl DriverSettings {
    pub fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::warn!("Malformed indexer settings, using defaults: {e}");
            Self::default()
        })
    }
}

/// Loads enabled indexer rows and instantiates one driver per row,
/// ordered by (priority asc, name asc).
#[derive(Debug)]
pub struct IndexerRegistry {
    db: &'static Db,
    rss_cache: Arc<rss::RssCache>,
}

impl IndexerRegistry {
    pub fn new(db: &'static Db) -> Self {
        Self {
            db,
            rss_cache: Arc::new(rss::RssCache::new()),
        }
    }

    pub fn rss_cache(&self) -> Arc<rss::RssCache> {
        self.rss_cache.clone()
    }

    pub async fn drivers(&self) -> Vec<Box<dyn TorrentIndex + Send + Sync>> {
        let rows = match self.db.enabled_indexers().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("Failed to load indexers: {e}");
                return Vec::new();
            }
        };
        let bypass: config::CloudflareBypassUrl = config::CONFIG.get_value();
        let mut drivers: Vec<Box<dyn TorrentIndex + Send + Sync>> = Vec::with_capacity(rows.len());
        for row in rows {
            match self.instantiate(&row, bypass.0.as_deref()) {
                Some(driver) => drivers.push(driver),
                None => tracing::warn!(indexer = row.name, "No driver for indexer row"),
            }
        }
        drivers
    }

    fn instantiate(
        &self,
        row: &DbIndexer,
        bypass: Option<&str>,
    ) -> Option<Box<dyn TorrentIndex + Send + Sync>> {
        let settings = DriverSettings::parse(&row.settings);
        let driver_kind = settings.driver.clone();
        match row.kind.as_str() {
            "torznab" => Some(Box::new(torznab::TorznabDriver::new(row))),
            "builtin" => match driver_kind.as_deref() {
                Some("json") => Some(Box::new(apibay::ApibayDriver::new(row))),
                Some("yts") => Some(Box::new(yts::YtsDriver::new(row))),
                Some("rss") => Some(Box::new(rss::RssDriver::new(row, self.rss_cache.clone()))),
                Some("scrape") => Some(Box::new(scrape::ScrapeDriver::new(
                    row,
                    settings,
                    bypass.map(str::to_string),
                ))),
                _ => None,
            },
            _ => None,
        }
    }
}

/// The fixed set of builtin indexers seeded into the store on first
/// startup. Operators toggle/reprioritize them through the indexers table.
pub fn builtin_catalog() -> Vec<DbIndexer> {
    let row = |name: &str, priority: i64, base_url: &str, settings: serde_json::Value| DbIndexer {
        id: 0,
        name: name.to_string(),
        kind: "builtin".to_string(),
        enabled: true,
        base_url: base_url.to_string(),
        api_key: String::new(),
        priority,
        settings: settings.to_string(),
    };
    vec![
        row(
            "apibay",
            10,
            "https://apibay.org/q.php",
            serde_json::json!({ "driver": "json" }),
        ),
        row(
            "yts",
            20,
            "https://yts.mx/api/v2/list_movies.json",
            serde_json::json!({ "driver": "yts" }),
        ),
        row(
            "nyaa",
            30,
            "https://nyaa.si/?page=rss",
            serde_json::json!({ "driver": "rss" }),
        ),
        row(
            "1337x",
            40,
            "https://1337x.to",
            serde_json::json!({
                "driver": "scrape",
                "search_url": "https://1337x.to/search/{query}/1/",
                "row_selector": "table.table-list tbody tr",
                "title_selector": "td.name a:nth-child(2)",
                "magnet_selector": "a[href^=magnet]",
                "size_selector": "td.size",
                "seeders_selector": "td.seeds",
                "use_bypass": true,
            }),
        ),
    ]
}

pub async fn seed_builtin_indexers(db: &Db) -> Result<(), sqlx::Error> {
    for indexer in builtin_catalog() {
        db.seed_indexer(&indexer).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_extraction_lowercases() {
        let magnet = "magnet:?xt=urn:btih:AAAABBBBCCCCDDDDEEEEFFFF0000111122223333&dn=x";
        assert_eq!(
            info_hash_from_magnet(magnet).unwrap(),
            "aaaabbbbccccddddeeeeffff0000111122223333"
        );
        assert_eq!(info_hash_from_magnet("magnet:?xt=urn:btih:tooshort"), None);
    }

    #[test]
    fn size_parsing_known_units() {
        assert_eq!(parse_size("700 MB"), 700 * (1 << 20));
        assert_eq!(parse_size("Size: 1.5 GiB, Seeders: 3"), (1.5 * (1u64 << 30) as f64) as u64);
        assert_eq!(parse_size("no size here"), 0);
    }

    #[test]
    fn resolution_and_quality_extraction() {
        let title = "Example (2020) 1080p WEB-DL x264";
        assert_eq!(extract_resolution(title), "1080p");
        assert_eq!(extract_quality(title), "web-dl");
        assert_eq!(extract_resolution("Example DVDRip"), "");
    }

    #[test]
    fn normalization_fills_derived_fields() {
        let result = SearchResult {
            title: "Example S01E01 720p HDTV".into(),
            magnet: "magnet:?xt=urn:btih:AAAABBBBCCCCDDDDEEEEFFFF0000111122223333".into(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(result.info_hash, "aaaabbbbccccddddeeeeffff0000111122223333");
        assert_eq!(result.resolution, "720p");
        assert_eq!(result.quality, "hdtv");
    }

    #[test]
    fn catalog_settings_parse() {
        for row in builtin_catalog() {
            let settings = DriverSettings::parse(&row.settings);
            assert!(settings.driver.is_some(), "{} has a driver", row.name);
        }
    }
}
