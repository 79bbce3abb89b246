use reqwest::{Client, Method, Request, Url};
use serde::Deserialize;

use crate::app_state::AppError;

use super::{
    request_client::LimitedRequestClient, year_of, MovieMetadata, MovieMetadataProvider,
    ShowMetadata, ShowMetadataProvider,
};

const IMAGE_BASE_URL: &str = "https://image.tmdb.org/t/p/w500";

fn poster_url(path: Option<&str>) -> Option<String> {
    path.map(|p| format!("{IMAGE_BASE_URL}{p}"))
}

#[derive(Debug)]
pub struct TmdbApi {
    client: LimitedRequestClient,
    base_url: Url,
}

impl TmdbApi {
    const API_URL: &'static str = "https://api.themoviedb.org/3";
    const RATE_LIMIT: usize = 40;

    pub fn new(api_key: String) -> Self {
        let params = [("api_key", api_key)];
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("build to succeed");
        let limited_client =
            LimitedRequestClient::new(client, Self::RATE_LIMIT, std::time::Duration::from_secs(1));
        let base_url = Url::parse_with_params(Self::API_URL, params).expect("url to parse");
        Self {
            client: limited_client,
            base_url,
        }
    }

    async fn search(&self, kind: &str, query: &str, year: Option<i64>)
        -> Result<TmdbSearch, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut().unwrap().push("search").push(kind);
        url.query_pairs_mut().append_pair("query", query);
        if let Some(year) = year {
            let param = if kind == "tv" { "first_air_date_year" } else { "year" };
            url.query_pairs_mut().append_pair(param, &year.to_string());
        }
        let req = Request::new(Method::GET, url);
        self.client.request(req).await
    }

    async fn movie_details(&self, id: &str) -> Result<TmdbMovieDetails, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut().unwrap().push("movie").push(id);
        let req = Request::new(Method::GET, url);
        self.client.request(req).await
    }

    async fn show_details(&self, id: &str) -> Result<TmdbShowDetails, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut().unwrap().push("tv").push(id);
        url.query_pairs_mut()
            .append_pair("append_to_response", "external_ids");
        let req = Request::new(Method::GET, url);
        self.client.request(req).await
    }
}

#[async_trait::async_trait]
impl MovieMetadataProvider for TmdbApi {
    async fn movie(&self, external_id: &str) -> Result<MovieMetadata, AppError> {
        let details = self.movie_details(external_id).await?;
        Ok(details.into())
    }

    async fn movie_search(
        &self,
        query: &str,
        year: Option<i64>,
    ) -> Result<Vec<MovieMetadata>, AppError> {
        let search = self.search("movie", query, year).await?;
        Ok(search.results.into_iter().map(Into::into).collect())
    }

    fn provider_identifier(&self) -> &'static str {
        "tmdb"
    }
}

#[async_trait::async_trait]
impl ShowMetadataProvider for TmdbApi {
    async fn show(&self, external_id: &str) -> Result<ShowMetadata, AppError> {
        let details = self.show_details(external_id).await?;
        Ok(details.into())
    }

    async fn show_search(
        &self,
        query: &str,
        year: Option<i64>,
    ) -> Result<Vec<ShowMetadata>, AppError> {
        let search = self.search("tv", query, year).await?;
        Ok(search
            .results
            .into_iter()
            .map(TmdbSearchResult::into_show)
            .collect())
    }

    fn provider_identifier(&self) -> &'static str {
        "tmdb"
    }
}

#[derive(Debug, Deserialize)]
pub struct TmdbSearch {
    pub results: Vec<TmdbSearchResult>,
}

#[derive(Debug, Deserialize)]
pub struct TmdbSearchResult {
    pub id: i64,
    /// Movie search results carry `title`, tv results `name`
    pub title: Option<String>,
    pub name: Option<String>,
    pub release_date: Option<String>,
    pub first_air_date: Option<String>,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
}

impl TmdbSearchResult {
    fn into_show(self) -> ShowMetadata {
        ShowMetadata {
            external_id: self.id.to_string(),
            title: self.name.or(self.title).unwrap_or_default(),
            year: year_of(self.first_air_date.as_deref()),
            overview: self.overview,
            poster: poster_url(self.poster_path.as_deref()),
            ..Default::default()
        }
    }
}

impl From<TmdbSearchResult> for MovieMetadata {
    fn from(val: TmdbSearchResult) -> Self {
        MovieMetadata {
            external_id: val.id.to_string(),
            title: val.title.or(val.name).unwrap_or_default(),
            year: year_of(val.release_date.as_deref()),
            overview: val.overview,
            poster: poster_url(val.poster_path.as_deref()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TmdbGenre {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct TmdbMovieDetails {
    pub id: i64,
    pub title: String,
    pub release_date: Option<String>,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
    #[serde(default)]
    pub genres: Vec<TmdbGenre>,
    pub imdb_id: Option<String>,
}

impl From<TmdbMovieDetails> for MovieMetadata {
    fn from(val: TmdbMovieDetails) -> Self {
        MovieMetadata {
            external_id: val.id.to_string(),
            title: val.title,
            year: year_of(val.release_date.as_deref()),
            overview: val.overview,
            poster: poster_url(val.poster_path.as_deref()),
            genres: val.genres.into_iter().map(|g| g.name).collect(),
            imdb_id: val.imdb_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TmdbShowSeason {
    pub season_number: i64,
}

#[derive(Debug, Deserialize)]
pub struct TmdbExternalIds {
    pub imdb_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TmdbShowDetails {
    pub id: i64,
    pub name: String,
    pub first_air_date: Option<String>,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
    #[serde(default)]
    pub genres: Vec<TmdbGenre>,
    #[serde(default)]
    pub seasons: Vec<TmdbShowSeason>,
    pub external_ids: Option<TmdbExternalIds>,
}

impl From<TmdbShowDetails> for ShowMetadata {
    fn from(val: TmdbShowDetails) -> Self {
        ShowMetadata {
            external_id: val.id.to_string(),
            title: val.name,
            year: year_of(val.first_air_date.as_deref()),
            overview: val.overview,
            poster: poster_url(val.poster_path.as_deref()),
            genres: val.genres.into_iter().map(|g| g.name).collect(),
            imdb_id: val.external_ids.and_then(|ids| ids.imdb_id),
            seasons: val
                .seasons
                .into_iter()
                .map(|s| s.season_number)
                .filter(|n| *n > 0)
                .collect(),
        }
    }
}
