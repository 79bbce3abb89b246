use axum::{
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::{
    app_state::AppState,
    config,
    db::MediaKind,
    indexer::SearchResult,
    search::SearchQuery,
};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct TorznabParams {
    pub t: Option<String>,
    pub q: Option<String>,
    pub apikey: Option<String>,
    pub tvdbid: Option<String>,
    pub imdbid: Option<String>,
    pub season: Option<i64>,
    pub ep: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub cat: Option<String>,
    #[allow(unused)]
    pub extended: Option<u8>,
}

/// Torznab re-export: the aggregated indexers presented as one torznab
/// source. Errors are the protocol's `<error/>` document with HTTP 200.
pub async fn torznab(
    State(state): State<AppState>,
    Query(params): Query<TorznabParams>,
) -> Response {
    let configured: config::TorznabApiKey = config::CONFIG.get_value();
    let Some(expected_key) = configured.0 else {
        return xml_response(error_xml(910, "This function is disabled"));
    };
    if params.apikey.as_deref() != Some(expected_key.as_str()) {
        return xml_response(error_xml(100, "Incorrect user credentials"));
    }
    match params.t.as_deref() {
        Some("caps") => xml_response(caps_xml()),
        Some("search") | Some("tvsearch") | Some("movie") => search_response(state, params).await,
        Some(_) => xml_response(error_xml(203, "Function not available")),
        None => xml_response(error_xml(200, "Missing parameter (t)")),
    }
}

async fn search_response(state: AppState, params: TorznabParams) -> Response {
    let kind = match params.t.as_deref() {
        Some("movie") => MediaKind::Movie,
        Some("tvsearch") => MediaKind::Show,
        _ => match params.cat.as_deref() {
            Some(cat) if cat.starts_with('5') => MediaKind::Show,
            _ => MediaKind::Movie,
        },
    };
    let text = match &params.q {
        Some(q) if !q.trim().is_empty() => q.trim().to_string(),
        _ => {
            // resolve an id-only query through the metadata stack
            let resolved = match (&params.tvdbid, &params.imdbid) {
                (Some(tvdb_id), _) => state
                    .metadata
                    .show_by_external_id(tvdb_id)
                    .await
                    .map(|s| s.title),
                (None, Some(imdb_id)) => state
                    .metadata
                    .movie_by_external_id(imdb_id)
                    .await
                    .map(|m| m.title),
                (None, None) => None,
            };
            match resolved {
                Some(title) => title,
                None => return xml_response(error_xml(200, "Missing parameter (q)")),
            }
        }
    };
    let results = state
        .search
        .search(&SearchQuery {
            text,
            kind,
            season: params.season,
            episode: params.ep,
        })
        .await;
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let page: Vec<&SearchResult> = results.iter().skip(offset).take(limit).collect();
    xml_response(results_xml(&page, offset, results.len()))
}

fn xml_response(body: String) -> Response {
    (
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

fn escape(raw: &str) -> String {
    quick_xml::escape::escape(raw).into_owned()
}

fn error_xml(code: u16, description: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<error code="{code}" description="{}"/>"#,
        escape(description)
    )
}

fn caps_xml() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<caps>
  <server title="quartermaster" version="{version}"/>
  <limits max="{MAX_LIMIT}" default="{DEFAULT_LIMIT}"/>
  <searching>
    <search available="yes" supportedParams="q"/>
    <tv-search available="yes" supportedParams="q,tvdbid,season,ep"/>
    <movie-search available="yes" supportedParams="q,imdbid"/>
  </searching>
  <categories>
    <category id="2000" name="Movies"/>
    <category id="5000" name="TV"/>
  </categories>
</caps>"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}

fn results_xml(results: &[&SearchResult], offset: usize, total: usize) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:torznab="http://torznab.com/schemas/2015/feed">
<channel>
<title>quartermaster</title>
"#,
    );
    out.push_str(&format!(
        "<torznab:response offset=\"{offset}\" total=\"{total}\"/>\n"
    ));
    for result in results {
        out.push_str("<item>\n");
        out.push_str(&format!("  <title>{}</title>\n", escape(&result.title)));
        out.push_str(&format!("  <guid>{}</guid>\n", escape(&result.info_hash)));
        if !result.magnet.is_empty() {
            out.push_str(&format!("  <link>{}</link>\n", escape(&result.magnet)));
            out.push_str(&format!(
                "  <enclosure url=\"{}\" length=\"{}\" type=\"application/x-bittorrent;x-scheme-handler/magnet\"/>\n",
                escape(&result.magnet),
                result.size
            ));
        }
        out.push_str(&format!(
            "  <torznab:attr name=\"seeders\" value=\"{}\"/>\n",
            result.seeders
        ));
        out.push_str(&format!(
            "  <torznab:attr name=\"peers\" value=\"{}\"/>\n",
            result.peers
        ));
        out.push_str(&format!(
            "  <torznab:attr name=\"size\" value=\"{}\"/>\n",
            result.size
        ));
        out.push_str(&format!(
            "  <torznab:attr name=\"infohash\" value=\"{}\"/>\n",
            escape(&result.info_hash)
        ));
        if !result.resolution.is_empty() {
            out.push_str(&format!(
                "  <torznab:attr name=\"resolution\" value=\"{}\"/>\n",
                escape(&result.resolution)
            ));
        }
        out.push_str("</item>\n");
    }
    out.push_str("</channel>\n</rss>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_document_shape() {
        let xml = error_xml(100, "Incorrect user credentials");
        assert!(xml.contains(r#"<error code="100" description="Incorrect user credentials"/>"#));
    }

    #[test]
    fn results_document_round_trips_through_the_driver_parser() {
        let result = SearchResult {
            title: "Example S01E01 1080p <grp>".into(),
            size: 1024,
            seeders: 7,
            peers: 3,
            magnet: "magnet:?xt=urn:btih:aaaabbbbccccddddeeeeffff0000111122223333&dn=Example"
                .into(),
            info_hash: "aaaabbbbccccddddeeeeffff0000111122223333".into(),
            source: "apibay".into(),
            resolution: "1080p".into(),
            quality: String::new(),
        };
        let xml = results_xml(&[&result], 0, 1);
        let parsed = crate::indexer::torznab::parse_torznab(&xml, "self").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].title, "Example S01E01 1080p <grp>");
        assert_eq!(parsed[0].seeders, 7);
        assert_eq!(parsed[0].info_hash, "aaaabbbbccccddddeeeeffff0000111122223333");
    }

    #[test]
    fn caps_document_lists_functions() {
        let xml = caps_xml();
        assert!(xml.contains("tv-search"));
        assert!(xml.contains("movie-search"));
        assert!(xml.contains(r#"<limits max="100" default="50"/>"#));
    }
}
