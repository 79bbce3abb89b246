use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    path::PathBuf,
    sync::{LazyLock, RwLock},
};

use clap::Parser;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

fn camel_to_snake_case(input: &str) -> String {
    let mut snake = String::new();
    for (i, ch) in input.char_indices() {
        if i > 0 && ch.is_uppercase() {
            snake.push('_');
        }
        snake.push(ch.to_ascii_lowercase());
    }
    snake
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub trait ConfigValue:
    'static + Send + Sync + Default + Clone + Serialize + DeserializeOwned
{
    /// Environment variable that overrides this setting. Defaults to the
    /// upper snake case of the type name.
    const ENV_KEY: Option<&'static str> = None;

    fn parse_env(raw: &str) -> Option<Self> {
        match serde_plain::from_str(raw) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(
                    found = raw,
                    "Found env value but could not parse it as {}. {e}",
                    type_name::<Self>()
                );
                None
            }
        }
    }

    fn env_key() -> String {
        match Self::ENV_KEY {
            Some(key) => key.to_string(),
            None => {
                let name = type_name::<Self>().rsplit("::").next().unwrap();
                camel_to_snake_case(name).to_uppercase()
            }
        }
    }
}

#[derive(Debug)]
struct SettingValue<T> {
    default: T,
    env: Option<T>,
    cli: Option<T>,
}

impl<T: ConfigValue> SettingValue<T> {
    fn new(default: T) -> Self {
        let env = std::env::var(T::env_key())
            .ok()
            .and_then(|raw| T::parse_env(&raw));
        Self {
            default,
            env,
            cli: None,
        }
    }

    /// Setting value with respect to its source priority
    fn customized(&self) -> &T {
        self.cli
            .as_ref()
            .or(self.env.as_ref())
            .unwrap_or(&self.default)
    }
}

trait AnySettingValue: 'static + Send + Sync {
    fn customized_value(&self) -> &dyn Any;
    fn cli_mut(&mut self) -> &mut dyn Any;
}

impl<T: ConfigValue> AnySettingValue for SettingValue<T> {
    fn customized_value(&self) -> &dyn Any {
        self.customized()
    }

    fn cli_mut(&mut self) -> &mut dyn Any {
        &mut self.cli
    }
}

pub static CONFIG: LazyLock<ConfigStore> = LazyLock::new(ConfigStore::construct);

pub struct ConfigStore {
    settings: RwLock<HashMap<TypeId, Box<dyn AnySettingValue>>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore").finish()
    }
}

impl ConfigStore {
    pub fn construct() -> Self {
        let store = Self::new();

        store.register_value::<DatabaseUrl>();
        store.register_value::<SessionSecret>();
        store.register_value::<Port>();
        store.register_value::<Environment>();
        store.register_value::<Debug>();
        store.register_value::<MoviesPath>();
        store.register_value::<ShowsPath>();
        store.register_value::<IncomingMoviesPath>();
        store.register_value::<IncomingShowsPath>();
        store.register_value::<DataPath>();
        store.register_value::<TmdbApiKey>();
        store.register_value::<TvdbApiKey>();
        store.register_value::<OpensubtitlesApiKey>();
        store.register_value::<OpensubtitlesUser>();
        store.register_value::<OpensubtitlesPass>();
        store.register_value::<QbittorrentUrl>();
        store.register_value::<QbittorrentUser>();
        store.register_value::<QbittorrentPass>();
        store.register_value::<EnableSubsync>();
        store.register_value::<FfsubsyncUrl>();
        store.register_value::<AdminUsername>();
        store.register_value::<AdminPassword>();
        store.register_value::<AdminEmail>();
        store.register_value::<CloudflareBypassUrl>();
        store.register_value::<TorznabApiKey>();
        store.register_value::<AutoApprove>();
        store.register_value::<RequestRetentionDays>();
        store.register_value::<CancelledRetentionHours>();
        store.register_value::<SeedingRatioLimit>();
        store.register_value::<SearchMaxAttempts>();
        store.register_value::<PreferredResolutions>();

        store
    }

    pub fn new() -> Self {
        Self {
            settings: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_value<T: ConfigValue>(&self) {
        let default = T::default();
        self.settings
            .write()
            .unwrap()
            .insert(TypeId::of::<T>(), Box::new(SettingValue::new(default)));
    }

    pub fn get_value<T: ConfigValue>(&self) -> T {
        let settings = self.settings.read().unwrap();
        let setting = settings
            .get(&TypeId::of::<T>())
            .unwrap_or_else(|| panic!("unregistered setting type {}", type_name::<T>()));
        let t: &T = setting.customized_value().downcast_ref().unwrap();
        t.clone()
    }

    pub fn apply_cli_value<T: ConfigValue>(&self, value: T) {
        let mut settings = self.settings.write().unwrap();
        let setting = settings
            .get_mut(&TypeId::of::<T>())
            .unwrap_or_else(|| panic!("unregistered setting type {}", type_name::<T>()));
        let val = setting.cli_mut().downcast_mut().unwrap();
        *val = Some(value);
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

// Settings

/// Store DSN. The process refuses to start without it.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DatabaseUrl(pub Option<String>);
impl ConfigValue for DatabaseUrl {}

/// Signing key the presentation layer uses for session cookies
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SessionSecret(pub Option<String>);
impl ConfigValue for SessionSecret {}

/// The network port on which the server listens for incoming connections
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct Port(pub u16);
impl ConfigValue for Port {}
impl Default for Port {
    fn default() -> Self {
        Self(5003)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvKind {
    #[default]
    Development,
    Production,
}

/// Deployment environment, gates log verbosity
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Environment(pub EnvKind);
impl ConfigValue for Environment {
    const ENV_KEY: Option<&'static str> = Some("ENV");
}

/// Force debug level logs regardless of environment
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct Debug(pub bool);
impl ConfigValue for Debug {
    fn parse_env(raw: &str) -> Option<Self> {
        parse_bool(raw).map(Self)
    }
}

/// Movie library root
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct MoviesPath(pub Option<PathBuf>);
impl ConfigValue for MoviesPath {}

/// Show library root
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ShowsPath(pub Option<PathBuf>);
impl ConfigValue for ShowsPath {}

/// Staging root the torrent daemon downloads movies into
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct IncomingMoviesPath(pub Option<PathBuf>);
impl ConfigValue for IncomingMoviesPath {}

/// Staging root the torrent daemon downloads show seasons into
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct IncomingShowsPath(pub Option<PathBuf>);
impl ConfigValue for IncomingShowsPath {}

/// Directory for poster/image caches
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DataPath(pub PathBuf);
impl ConfigValue for DataPath {}
impl Default for DataPath {
    fn default() -> Self {
        Self(PathBuf::from("data"))
    }
}

/// API key for TMDB. Missing key disables the client
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TmdbApiKey(pub Option<String>);
impl ConfigValue for TmdbApiKey {}

/// API key for TVDB. Missing key disables the client
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TvdbApiKey(pub Option<String>);
impl ConfigValue for TvdbApiKey {}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct OpensubtitlesApiKey(pub Option<String>);
impl ConfigValue for OpensubtitlesApiKey {}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct OpensubtitlesUser(pub Option<String>);
impl ConfigValue for OpensubtitlesUser {}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct OpensubtitlesPass(pub Option<String>);
impl ConfigValue for OpensubtitlesPass {}

/// Base url of the qBittorrent web api
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct QbittorrentUrl(pub Option<String>);
impl ConfigValue for QbittorrentUrl {}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QbittorrentUser(pub String);
impl ConfigValue for QbittorrentUser {}
impl Default for QbittorrentUser {
    fn default() -> Self {
        Self("admin".to_string())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct QbittorrentPass(pub String);
impl ConfigValue for QbittorrentPass {}

/// Route fresh subtitles through the ffsubsync sidecar
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct EnableSubsync(pub bool);
impl ConfigValue for EnableSubsync {
    fn parse_env(raw: &str) -> Option<Self> {
        parse_bool(raw).map(Self)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FfsubsyncUrl(pub Option<String>);
impl ConfigValue for FfsubsyncUrl {}

/// Seed admin account created at first startup. No password, no seeding
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AdminUsername(pub Option<String>);
impl ConfigValue for AdminUsername {}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AdminPassword(pub Option<String>);
impl ConfigValue for AdminPassword {}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AdminEmail(pub Option<String>);
impl ConfigValue for AdminEmail {}

/// Proxy that solves Cloudflare challenges for scraped indexers
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CloudflareBypassUrl(pub Option<String>);
impl ConfigValue for CloudflareBypassUrl {}

/// Key protecting the torznab re-export endpoint
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TorznabApiKey(pub Option<String>);
impl ConfigValue for TorznabApiKey {}

/// Put new requests straight into `approved` instead of waiting for an admin
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct AutoApprove(pub bool);
impl ConfigValue for AutoApprove {
    fn parse_env(raw: &str) -> Option<Self> {
        parse_bool(raw).map(Self)
    }
}

/// Days a terminal request is kept before cleanup
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct RequestRetentionDays(pub u64);
impl ConfigValue for RequestRetentionDays {}
impl Default for RequestRetentionDays {
    fn default() -> Self {
        Self(7)
    }
}

/// Hours a cancelled request is kept before cleanup
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct CancelledRetentionHours(pub u64);
impl ConfigValue for CancelledRetentionHours {}
impl Default for CancelledRetentionHours {
    fn default() -> Self {
        Self(24)
    }
}

/// Share ratio after which imported torrents are removed from the daemon
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct SeedingRatioLimit(pub f64);
impl ConfigValue for SeedingRatioLimit {}
impl Default for SeedingRatioLimit {
    fn default() -> Self {
        Self(2.0)
    }
}

/// Search ticks before a request without a viable candidate fails
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct SearchMaxAttempts(pub u32);
impl ConfigValue for SearchMaxAttempts {}
impl Default for SearchMaxAttempts {
    fn default() -> Self {
        Self(5)
    }
}

/// Resolution preference order used by release ranking
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PreferredResolutions(pub Vec<String>);
impl ConfigValue for PreferredResolutions {
    fn parse_env(raw: &str) -> Option<Self> {
        let list: Vec<String> = raw
            .split(',')
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty())
            .collect();
        (!list.is_empty()).then_some(Self(list))
    }
}
impl Default for PreferredResolutions {
    fn default() -> Self {
        Self(
            ["1080p", "720p", "2160p", "480p"]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// Override port
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Override store DSN
    #[arg(long)]
    pub database_url: Option<String>,
    /// Override tmdb api key
    #[arg(long)]
    pub tmdb_api_key: Option<String>,
}

impl Args {
    pub fn apply_configuration(self) {
        if let Some(port) = self.port {
            CONFIG.apply_cli_value(Port(port));
        }
        if let Some(url) = self.database_url {
            CONFIG.apply_cli_value(DatabaseUrl(Some(url)));
        }
        if let Some(key) = self.tmdb_api_key {
            CONFIG.apply_cli_value(TmdbApiKey(Some(key)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigStore, Port, PreferredResolutions, SearchMaxAttempts};
    use crate::config::ConfigValue;

    #[test]
    fn setting_store() {
        let store = ConfigStore::construct();
        let port: Port = store.get_value();
        assert_eq!(port, Port::default());
        store.apply_cli_value(Port(8000));
        let port: Port = store.get_value();
        assert_eq!(port, Port(8000));
    }

    #[test]
    fn cli_beats_default() {
        let store = ConfigStore::construct();
        store.apply_cli_value(SearchMaxAttempts(9));
        let attempts: SearchMaxAttempts = store.get_value();
        assert_eq!(attempts.0, 9);
    }

    #[test]
    fn env_key_derivation() {
        assert_eq!(Port::env_key(), "PORT");
        assert_eq!(SearchMaxAttempts::env_key(), "SEARCH_MAX_ATTEMPTS");
    }

    #[test]
    fn resolution_list_parsing() {
        let parsed = PreferredResolutions::parse_env("720p, 1080p").unwrap();
        assert_eq!(parsed.0, vec!["720p".to_string(), "1080p".to_string()]);
        assert!(PreferredResolutions::parse_env(" , ").is_none());
    }
}
