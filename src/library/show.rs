use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::movie::MovieIdentifier;

static EPISODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bs(?P<season>\d{1,2})[ ._-]?e(?P<episode>\d{1,2})\b").unwrap());
static SEASON_DIR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^season[ ._-]*(?P<number>\d{1,3})$").unwrap());

/// A show directory name parses exactly like a movie directory name
pub type ShowIdentifier = MovieIdentifier;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeIdentifier {
    pub season: i64,
    pub episode: i64,
}

impl EpisodeIdentifier {
    /// Pull the `SxxEyy` token out of an episode file name
    pub fn parse(file_name: &str) -> Option<Self> {
        let captures = EPISODE_REGEX.captures(file_name)?;
        Some(Self {
            season: captures["season"].parse().ok()?,
            episode: captures["episode"].parse().ok()?,
        })
    }
}

/// Season number of a `Season NN` directory name
pub fn parse_season_dir(name: &str) -> Option<i64> {
    SEASON_DIR_REGEX
        .captures(name.trim())
        .and_then(|c| c["number"].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episode_token_variants() {
        assert_eq!(
            EpisodeIdentifier::parse("Example.S02E05.720p.mkv"),
            Some(EpisodeIdentifier { season: 2, episode: 5 })
        );
        assert_eq!(
            EpisodeIdentifier::parse("example s1e9 final.mkv"),
            Some(EpisodeIdentifier { season: 1, episode: 9 })
        );
        assert_eq!(
            EpisodeIdentifier::parse("Example - S03 E07.mkv"),
            Some(EpisodeIdentifier { season: 3, episode: 7 })
        );
        assert_eq!(EpisodeIdentifier::parse("Example 1080p.mkv"), None);
    }

    #[test]
    fn season_directories() {
        assert_eq!(parse_season_dir("Season 01"), Some(1));
        assert_eq!(parse_season_dir("season.2"), Some(2));
        assert_eq!(parse_season_dir("Specials"), None);
        assert_eq!(parse_season_dir("Season one"), None);
    }
}
