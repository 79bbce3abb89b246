use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::app_state::AppError;

pub mod opensubtitles;
pub mod request_client;
pub mod tmdb;
pub mod tvdb;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MovieMetadata {
    pub external_id: String,
    pub title: String,
    pub year: Option<i64>,
    pub overview: Option<String>,
    pub poster: Option<String>,
    pub genres: Vec<String>,
    pub imdb_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShowMetadata {
    pub external_id: String,
    pub title: String,
    pub year: Option<i64>,
    pub overview: Option<String>,
    pub poster: Option<String>,
    pub genres: Vec<String>,
    pub imdb_id: Option<String>,
    /// Available season numbers, when the provider exposes them
    pub seasons: Vec<i64>,
}

#[async_trait::async_trait]
pub trait MovieMetadataProvider {
    /// Query for movie by the provider's own id
    async fn movie(&self, external_id: &str) -> Result<MovieMetadata, AppError>;

    /// Free text movie search
    async fn movie_search(&self, query: &str, year: Option<i64>)
        -> Result<Vec<MovieMetadata>, AppError>;

    /// Provider identifier
    fn provider_identifier(&self) -> &'static str;
}

#[async_trait::async_trait]
pub trait ShowMetadataProvider {
    /// Query for show by the provider's own id
    async fn show(&self, external_id: &str) -> Result<ShowMetadata, AppError>;

    /// Free text show search
    async fn show_search(&self, query: &str, year: Option<i64>)
        -> Result<Vec<ShowMetadata>, AppError>;

    /// Provider identifier
    fn provider_identifier(&self) -> &'static str;
}

/// Ordered collection of the configured metadata clients.
///
/// Clients whose api key is missing are simply never registered, so lookups
/// against an empty stack resolve to "no match" instead of an error.
#[derive(Default)]
pub struct MetadataStack {
    movie_providers: Mutex<Vec<&'static (dyn MovieMetadataProvider + Send + Sync)>>,
    show_providers: Mutex<Vec<&'static (dyn ShowMetadataProvider + Send + Sync)>>,
}

impl std::fmt::Debug for MetadataStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let movies: Vec<_> = self
            .movie_providers()
            .into_iter()
            .map(|p| p.provider_identifier())
            .collect();
        let shows: Vec<_> = self
            .show_providers()
            .into_iter()
            .map(|p| p.provider_identifier())
            .collect();
        f.debug_struct("MetadataStack")
            .field("movie_providers", &movies)
            .field("show_providers", &shows)
            .finish()
    }
}

impl MetadataStack {
    pub fn add_movie_provider(
        &self,
        provider: &'static (dyn MovieMetadataProvider + Send + Sync),
    ) {
        self.movie_providers.lock().unwrap().push(provider);
    }

    pub fn add_show_provider(&self, provider: &'static (dyn ShowMetadataProvider + Send + Sync)) {
        self.show_providers.lock().unwrap().push(provider);
    }

    pub fn movie_providers(&self) -> Vec<&'static (dyn MovieMetadataProvider + Send + Sync)> {
        self.movie_providers.lock().unwrap().clone()
    }

    pub fn show_providers(&self) -> Vec<&'static (dyn ShowMetadataProvider + Send + Sync)> {
        self.show_providers.lock().unwrap().clone()
    }

    /// Walk providers in registration order and return the first match.
    /// Provider failures degrade to the next provider in the chain.
    pub async fn identify_movie(
        &self,
        query: &str,
        year: Option<i64>,
    ) -> Option<MovieMetadata> {
        for provider in self.movie_providers() {
            match provider.movie_search(query, year).await {
                Ok(results) => {
                    if let Some(first) = results.into_iter().next() {
                        return Some(first);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        provider = provider.provider_identifier(),
                        "Movie lookup failed: {e}"
                    );
                }
            }
        }
        None
    }

    pub async fn identify_show(&self, query: &str, year: Option<i64>) -> Option<ShowMetadata> {
        for provider in self.show_providers() {
            match provider.show_search(query, year).await {
                Ok(results) => {
                    if let Some(first) = results.into_iter().next() {
                        return Some(first);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        provider = provider.provider_identifier(),
                        "Show lookup failed: {e}"
                    );
                }
            }
        }
        None
    }

    pub async fn movie_by_external_id(&self, external_id: &str) -> Option<MovieMetadata> {
        for provider in self.movie_providers() {
            match provider.movie(external_id).await {
                Ok(movie) => return Some(movie),
                Err(e) => tracing::warn!(
                    provider = provider.provider_identifier(),
                    "Movie fetch failed: {e}"
                ),
            }
        }
        None
    }

    pub async fn show_by_external_id(&self, external_id: &str) -> Option<ShowMetadata> {
        for provider in self.show_providers() {
            match provider.show(external_id).await {
                Ok(show) => return Some(show),
                Err(e) => tracing::warn!(
                    provider = provider.provider_identifier(),
                    "Show fetch failed: {e}"
                ),
            }
        }
        None
    }
}

/// Release year out of a `YYYY-MM-DD` date
pub(crate) fn year_of(release_date: Option<&str>) -> Option<i64> {
    release_date
        .and_then(|d| d.split('-').next())
        .and_then(|y| y.parse().ok())
        .filter(|y| (1880..=2100).contains(y))
}

#[cfg(test)]
mod tests {
    use super::year_of;

    #[test]
    fn year_extraction() {
        assert_eq!(year_of(Some("2020-05-01")), Some(2020));
        assert_eq!(year_of(Some("1999")), Some(1999));
        assert_eq!(year_of(Some("")), None);
        assert_eq!(year_of(None), None);
        assert_eq!(year_of(Some("0000-01-01")), None);
    }
}
