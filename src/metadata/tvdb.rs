use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Client, Method, Request, Url,
};
use serde::Deserialize;

use crate::app_state::AppError;

use super::{
    request_client::LimitedRequestClient, year_of, ShowMetadata, ShowMetadataProvider,
};

#[derive(Debug)]
pub struct TvdbApi {
    client: LimitedRequestClient,
    base_url: Url,
}

impl TvdbApi {
    const API_URL: &'static str = "https://api4.thetvdb.com/v4";
    const RATE_LIMIT: usize = 10;

    pub fn new(api_key: &str) -> Self {
        let mut headers = HeaderMap::with_capacity(1);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}")).expect("key is ascii"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("build to succeed");
        let limited_client =
            LimitedRequestClient::new(client, Self::RATE_LIMIT, std::time::Duration::from_secs(1));
        Self {
            client: limited_client,
            base_url: Url::parse(Self::API_URL).expect("url to parse"),
        }
    }

    // https://api4.thetvdb.com/v4/search?query=halo&type=series
    async fn search_series(&self, query: &str, year: Option<i64>)
        -> Result<Vec<TvdbSearchResult>, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut().expect("base url").push("search");
        url.query_pairs_mut()
            .append_pair("query", query)
            .append_pair("type", "series");
        if let Some(year) = year {
            url.query_pairs_mut().append_pair("year", &year.to_string());
        }
        let request = Request::new(Method::GET, url);
        let res: TvdbResponse<Vec<TvdbSearchResult>> = self.client.request(request).await?;
        Ok(res.data)
    }

    async fn series_extended(&self, id: &str) -> Result<TvdbSeriesRecord, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .expect("base url")
            .push("series")
            .push(id)
            .push("extended");
        let request = Request::new(Method::GET, url);
        let res: TvdbResponse<TvdbSeriesRecord> = self.client.request(request).await?;
        Ok(res.data)
    }
}

#[async_trait::async_trait]
impl ShowMetadataProvider for TvdbApi {
    async fn show(&self, external_id: &str) -> Result<ShowMetadata, AppError> {
        let record = self.series_extended(external_id).await?;
        Ok(record.into())
    }

    async fn show_search(
        &self,
        query: &str,
        year: Option<i64>,
    ) -> Result<Vec<ShowMetadata>, AppError> {
        let results = self.search_series(query, year).await?;
        Ok(results.into_iter().map(Into::into).collect())
    }

    fn provider_identifier(&self) -> &'static str {
        "tvdb"
    }
}

#[derive(Debug, Deserialize)]
pub struct TvdbResponse<T> {
    pub data: T,
}

// search results come back snake_cased, unlike the extended records
#[derive(Debug, Deserialize)]
pub struct TvdbSearchResult {
    pub tvdb_id: String,
    pub name: String,
    pub year: Option<String>,
    pub overview: Option<String>,
    pub image_url: Option<String>,
}

impl From<TvdbSearchResult> for ShowMetadata {
    fn from(val: TvdbSearchResult) -> Self {
        ShowMetadata {
            external_id: val.tvdb_id,
            title: val.name,
            year: val.year.and_then(|y| y.parse().ok()),
            overview: val.overview,
            poster: val.image_url,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TvdbSeason {
    pub number: i64,
    #[serde(rename = "type")]
    pub kind: TvdbSeasonType,
}

#[derive(Debug, Deserialize)]
pub struct TvdbSeasonType {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TvdbGenre {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TvdbRemoteId {
    pub id: String,
    pub source_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TvdbSeriesRecord {
    pub id: i64,
    pub name: String,
    pub first_aired: Option<String>,
    pub overview: Option<String>,
    pub image: Option<String>,
    #[serde(default)]
    pub genres: Vec<TvdbGenre>,
    #[serde(default)]
    pub seasons: Vec<TvdbSeason>,
    #[serde(default)]
    pub remote_ids: Vec<TvdbRemoteId>,
}

impl From<TvdbSeriesRecord> for ShowMetadata {
    fn from(val: TvdbSeriesRecord) -> Self {
        let imdb_id = val
            .remote_ids
            .iter()
            .find(|id| id.source_name.eq_ignore_ascii_case("imdb"))
            .map(|id| id.id.clone());
        ShowMetadata {
            external_id: val.id.to_string(),
            title: val.name,
            year: year_of(val.first_aired.as_deref()),
            overview: val.overview,
            poster: val.image,
            genres: val.genres.into_iter().map(|g| g.name).collect(),
            imdb_id,
            seasons: val
                .seasons
                .into_iter()
                .filter(|s| s.kind.kind == "official" && s.number > 0)
                .map(|s| s.number)
                .collect(),
        }
    }
}
