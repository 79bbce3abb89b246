use std::{cmp::Ordering, collections::HashSet};

use tokio::task::JoinSet;

use crate::{
    config,
    db::MediaKind,
    indexer::{IndexerRegistry, SearchResult},
};

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub kind: MediaKind,
    pub season: Option<i64>,
    pub episode: Option<i64>,
}

impl SearchQuery {
    pub fn movie(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: MediaKind::Movie,
            season: None,
            episode: None,
        }
    }

    pub fn show_season(text: impl Into<String>, season: i64) -> Self {
        Self {
            text: text.into(),
            kind: MediaKind::Show,
            season: Some(season),
            episode: None,
        }
    }
}

/// A search result together with the priority of the indexer it came from
#[derive(Debug, Clone)]
pub struct Candidate {
    pub result: SearchResult,
    pub indexer_priority: i64,
}

/// Fans a query out over every enabled indexer, then normalizes, dedupes
/// and ranks the union. Driver failures and timeouts degrade to a warning.
#[derive(Debug)]
pub struct FederatedSearch {
    registry: &'static IndexerRegistry,
}

impl FederatedSearch {
    pub fn new(registry: &'static IndexerRegistry) -> Self {
        Self { registry }
    }

    pub async fn search(&self, query: &SearchQuery) -> Vec<SearchResult> {
        let drivers = self.registry.drivers().await;
        let driver_count = drivers.len();
        let mut priorities = Vec::with_capacity(driver_count);
        let mut join_set = JoinSet::new();
        for (slot, driver) in drivers.into_iter().enumerate() {
            priorities.push(driver.priority());
            let text = query.text.clone();
            let kind = query.kind;
            join_set.spawn(async move {
                let timeout = driver.request_timeout();
                let name = driver.name().to_string();
                let search = async {
                    match kind {
                        MediaKind::Movie => driver.search_movies(&text).await,
                        MediaKind::Show => driver.search_shows(&text).await,
                    }
                };
                (slot, name, tokio::time::timeout(timeout, search).await)
            });
        }

        // slots keep indexer priority order stable no matter which driver
        // finishes first
        let mut slots: Vec<Option<Vec<SearchResult>>> = vec![None; driver_count];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((slot, _, Ok(Ok(results)))) => slots[slot] = Some(results),
                Ok((_, name, Ok(Err(e)))) => {
                    tracing::warn!(indexer = name, "Indexer search failed: {e}")
                }
                Ok((_, name, Err(_))) => {
                    tracing::warn!(indexer = name, "Indexer search timed out")
                }
                Err(e) => tracing::warn!("Indexer search task panicked: {e}"),
            }
        }

        let mut candidates = Vec::new();
        for (slot, results) in slots.into_iter().enumerate() {
            for result in results.into_iter().flatten() {
                candidates.push(Candidate {
                    result,
                    indexer_priority: priorities[slot],
                });
            }
        }
        let mut deduped = dedupe_by_info_hash(candidates);

        let preferred: config::PreferredResolutions = config::CONFIG.get_value();
        rank(&mut deduped, &preferred.0, query.season, query.episode);
        deduped.into_iter().map(|c| c.result).collect()
    }
}

/// Collapse duplicate releases case-insensitively by info hash. The input
/// arrives in indexer priority order, so the kept record is always the one
/// from the earliest source.
pub fn dedupe_by_info_hash(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let hash = candidate.result.info_hash.to_lowercase();
        if hash.is_empty() || seen.insert(hash) {
            out.push(candidate);
        }
    }
    out
}

fn season_token(season: i64, episode: Option<i64>) -> String {
    match episode {
        Some(episode) => format!("s{season:02}e{episode:02}"),
        None => format!("s{season:02}"),
    }
}

fn resolution_rank(resolution: &str, preferred: &[String]) -> usize {
    preferred
        .iter()
        .position(|p| p.eq_ignore_ascii_case(resolution))
        .unwrap_or(preferred.len())
}

/// Order candidates by the release quality function:
/// season/episode token match, preferred resolution, seeders, then smaller
/// size within 25% below the best-seeded release, with indexer priority as
/// the final tie break. Pure and deterministic.
pub fn rank(
    candidates: &mut [Candidate],
    preferred_resolutions: &[String],
    season: Option<i64>,
    episode: Option<i64>,
) {
    let token = season.map(|s| season_token(s, episode));
    let has_token = |c: &Candidate| -> bool {
        match &token {
            Some(token) => c.result.title.to_lowercase().contains(token),
            None => false,
        }
    };
    let class_of = |c: &Candidate| -> (bool, usize) {
        (
            !has_token(c),
            resolution_rank(&c.result.resolution, preferred_resolutions),
        )
    };
    let tie_break = |a: &Candidate, b: &Candidate| -> Ordering {
        a.indexer_priority
            .cmp(&b.indexer_priority)
            .then_with(|| a.result.info_hash.cmp(&b.result.info_hash))
    };

    candidates.sort_by(|a, b| {
        class_of(a)
            .cmp(&class_of(b))
            .then_with(|| b.result.seeders.cmp(&a.result.seeders))
            .then_with(|| tie_break(a, b))
    });

    // Within each (token, resolution) class the best seeded release
    // anchors a size band: releases up to 25% smaller beat it, smallest
    // first. Everything outside the band keeps its seeder order.
    let mut start = 0;
    while start < candidates.len() {
        let class = class_of(&candidates[start]);
        let mut end = start + 1;
        while end < candidates.len() && class_of(&candidates[end]) == class {
            end += 1;
        }
        let anchor = candidates[start].result.size;
        if anchor > 0 {
            let in_band = |c: &Candidate| -> bool {
                c.result.size > 0
                    && c.result.size <= anchor
                    && (anchor - c.result.size) * 4 <= anchor
            };
            candidates[start..end].sort_by(|a, b| match (in_band(a), in_band(b)) {
                (true, true) => a
                    .result
                    .size
                    .cmp(&b.result.size)
                    .then_with(|| tie_break(a, b)),
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => b
                    .result
                    .seeders
                    .cmp(&a.result.seeders)
                    .then_with(|| tie_break(a, b)),
            });
        }
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        title: &str,
        resolution: &str,
        seeders: u64,
        size: u64,
        hash: &str,
        priority: i64,
    ) -> Candidate {
        Candidate {
            result: SearchResult {
                title: title.to_string(),
                resolution: resolution.to_string(),
                seeders,
                size,
                info_hash: hash.to_string(),
                ..Default::default()
            },
            indexer_priority: priority,
        }
    }

    fn preferred() -> Vec<String> {
        ["1080p", "720p", "2160p", "480p"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn dedupe_is_case_insensitive_and_keeps_first_source() {
        let candidates = vec![
            candidate("a", "", 1, 0, "AAAABBBBCCCCDDDDEEEEFFFF0000111122223333", 10),
            candidate("b", "", 9, 0, "aaaabbbbccccddddeeeeffff0000111122223333", 20),
            candidate("c", "", 2, 0, "bbbbccccddddeeeeffff0000111122223333aaaa", 30),
        ];
        let deduped = dedupe_by_info_hash(candidates);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].result.title, "a");
        assert_eq!(deduped[1].result.title, "c");
    }

    #[test]
    fn season_token_beats_resolution() {
        let mut candidates = vec![
            candidate("Example 1080p", "1080p", 500, 0, "a1", 10),
            candidate("Example S02 complete 480p", "480p", 3, 0, "a2", 10),
        ];
        rank(&mut candidates, &preferred(), Some(2), None);
        assert_eq!(candidates[0].result.title, "Example S02 complete 480p");
    }

    #[test]
    fn episode_token_is_exact() {
        let mut candidates = vec![
            candidate("Example S02E04 720p", "720p", 100, 0, "a1", 10),
            candidate("Example S02E05 720p", "720p", 10, 0, "a2", 10),
        ];
        rank(&mut candidates, &preferred(), Some(2), Some(5));
        assert_eq!(candidates[0].result.title, "Example S02E05 720p");
    }

    #[test]
    fn preferred_resolution_order_applies() {
        let mut candidates = vec![
            candidate("a 2160p", "2160p", 900, 0, "a1", 10),
            candidate("b 720p", "720p", 50, 0, "a2", 10),
            candidate("c 1080p", "1080p", 10, 0, "a3", 10),
            candidate("d unknown", "", 9999, 0, "a4", 10),
        ];
        rank(&mut candidates, &preferred(), None, None);
        let order: Vec<_> = candidates
            .iter()
            .map(|c| c.result.resolution.as_str())
            .collect();
        assert_eq!(order, vec!["1080p", "720p", "2160p", ""]);
    }

    #[test]
    fn smaller_release_within_band_wins() {
        let gib = 1u64 << 30;
        let mut candidates = vec![
            // best seeded release anchors the band at 2 GiB
            candidate("anchor", "1080p", 100, 2 * gib, "a1", 10),
            // 12% smaller, inside the band: preferred despite fewer seeders
            candidate("lean", "1080p", 40, 2 * gib - gib / 4, "a2", 10),
            // less than 75% of the anchor: out of band
            candidate("tiny", "1080p", 90, gib, "a3", 10),
        ];
        rank(&mut candidates, &preferred(), None, None);
        let order: Vec<_> = candidates.iter().map(|c| c.result.title.as_str()).collect();
        assert_eq!(order, vec!["lean", "anchor", "tiny"]);
    }

    #[test]
    fn indexer_priority_breaks_ties() {
        let mut candidates = vec![
            candidate("from slow indexer", "1080p", 10, 0, "same-everything", 40),
            candidate("from fast indexer", "1080p", 10, 0, "same-everything", 10),
        ];
        rank(&mut candidates, &preferred(), None, None);
        assert_eq!(candidates[0].result.title, "from fast indexer");
    }

    #[test]
    fn ranking_is_deterministic_for_any_input_order() {
        let base = vec![
            candidate("Example S01E01 1080p", "1080p", 120, 1 << 30, "aa01", 10),
            candidate("Example S01E01 720p", "720p", 300, 1 << 29, "aa02", 20),
            candidate("Example 2160p", "2160p", 80, 3 << 30, "aa03", 10),
            candidate("Example S01 pack", "", 55, 9 << 30, "aa04", 30),
            candidate("Example S01E01 1080p repack", "1080p", 119, (1 << 30) - 1024, "aa05", 20),
        ];
        let reference = {
            let mut c = base.clone();
            rank(&mut c, &preferred(), Some(1), Some(1));
            c.iter().map(|x| x.result.info_hash.clone()).collect::<Vec<_>>()
        };
        // every rotation ranks identically
        for rotation in 0..base.len() {
            let mut candidates = base.clone();
            candidates.rotate_left(rotation);
            rank(&mut candidates, &preferred(), Some(1), Some(1));
            let order: Vec<_> = candidates
                .iter()
                .map(|x| x.result.info_hash.clone())
                .collect();
            assert_eq!(order, reference, "rotation {rotation} diverged");
        }
    }
}
