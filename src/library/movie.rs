use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static TITLE_YEAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<title>.+?)[ ._]*\((?P<year>(?:19|20)\d{2})\)").unwrap());

/// Release tokens that mean the title is over when scanning dotted names
const NAME_NOISE: &[&str] = &[
    "2160p", "1080p", "720p", "576p", "480p", "bluray", "blu-ray", "brrip", "bdrip", "web-dl",
    "webdl", "webrip", "hdtv", "hdrip", "dvdrip", "remux", "proper", "repack", "x264", "x265",
    "h264", "h265", "hevc", "xvid", "aac", "dts", "ac3", "uhd", "4k", "hdr",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovieIdentifier {
    pub title: String,
    pub year: Option<i64>,
}

impl MovieIdentifier {
    /// Parse a movie directory or file name. `Title (YEAR)` is the
    /// canonical shape; dotted release names fall back to token scanning.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(captures) = TITLE_YEAR_REGEX.captures(name) {
            let title = normalize_title(&captures["title"]);
            if !title.is_empty() {
                return Some(Self {
                    title,
                    year: captures["year"].parse().ok(),
                });
            }
        }
        Self::parse_tokens(name)
    }

    fn parse_tokens(name: &str) -> Option<Self> {
        let mut title_tokens: Vec<&str> = Vec::new();
        let mut year = None;
        for token in name.split(['.', '_', ' ']).filter(|t| !t.is_empty()) {
            let bare = token.trim_matches(['(', ')', '[', ']']);
            if is_year(bare) {
                year = bare.parse().ok();
                break;
            }
            if NAME_NOISE.contains(&bare.to_lowercase().as_str()) {
                break;
            }
            title_tokens.push(bare);
        }
        if title_tokens.is_empty() {
            return None;
        }
        Some(Self {
            title: title_tokens.join(" "),
            year,
        })
    }
}

fn is_year(token: &str) -> bool {
    token.len() == 4
        && token.chars().all(|c| c.is_ascii_digit())
        && (token.starts_with("19") || token.starts_with("20"))
}

fn normalize_title(raw: &str) -> String {
    raw.split(['.', '_', ' '])
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::MovieIdentifier;

    #[test]
    fn canonical_title_year_shape() {
        let id = MovieIdentifier::parse("Example (2020)").unwrap();
        assert_eq!(id.title, "Example");
        assert_eq!(id.year, Some(2020));
    }

    #[test]
    fn dotted_release_name() {
        let id = MovieIdentifier::parse("Some.Example.2019.1080p.BluRay.x264-GRP").unwrap();
        assert_eq!(id.title, "Some Example");
        assert_eq!(id.year, Some(2019));
    }

    #[test]
    fn quality_token_ends_title_without_year() {
        let id = MovieIdentifier::parse("Another Example 720p WEBRip").unwrap();
        assert_eq!(id.title, "Another Example");
        assert_eq!(id.year, None);
    }

    #[test]
    fn dotted_title_inside_parens_shape() {
        let id = MovieIdentifier::parse("Dotted.Title (1999)").unwrap();
        assert_eq!(id.title, "Dotted Title");
        assert_eq!(id.year, Some(1999));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(MovieIdentifier::parse("").is_none());
        assert!(MovieIdentifier::parse("...").is_none());
    }
}
