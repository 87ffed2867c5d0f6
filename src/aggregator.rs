//! Fans a keyword out to every enabled source in parallel, merges, dedups,
//! and scores the results. Grounded in the teacher's multi-source `updater`
//! loop (which iterates sources sequentially for a single book update) and
//! generalized to a `tokio::join`-style concurrent fan-out bounded by a
//! shared deadline, the pattern `rust_mdex_dl` uses for its own multi-plugin
//! search.

use crate::source::{NovelHit, SourceRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceError {
    pub source_id: u32,
    pub source_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedSearch {
    pub hits: Vec<NovelHit>,
    pub errors: Vec<SourceError>,
}

const DEFAULT_PER_SOURCE_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn search_all(
    sources: &SourceRegistry,
    keyword: &str,
    deadline: Duration,
    per_source_timeout: Duration,
    max_results: u32,
) -> AggregatedSearch {
    let per_source_timeout = per_source_timeout.min(deadline).max(Duration::from_millis(1));

    let handles: Vec<_> = sources
        .enabled()
        .map(|adapter| {
            let adapter = adapter.clone();
            let keyword = keyword.to_owned();
            let id = adapter.rule().id;
            let name = adapter.rule().name.clone();
            let handle = tokio::spawn(async move {
                tokio::time::timeout(per_source_timeout, adapter.search(&keyword)).await
            });
            (id, name, handle)
        })
        .collect();

    let deadline_at = tokio::time::Instant::now() + deadline;
    let mut all_hits = Vec::new();
    let mut errors = Vec::new();

    for (source_id, source_name, handle) in handles {
        let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
        let outcome = match tokio::time::timeout(remaining, handle).await {
            Ok(join_result) => join_result,
            Err(_) => {
                errors.push(SourceError {
                    source_id,
                    source_name,
                    message: "aggregate deadline exceeded".to_owned(),
                });
                continue;
            }
        };
        let Ok(outcome) = outcome else {
            continue;
        };
        match outcome {
            Ok(Ok(hits)) => all_hits.extend(hits),
            Ok(Err(e)) => errors.push(SourceError { source_id, source_name, message: e.to_string() }),
            Err(_) => errors.push(SourceError {
                source_id,
                source_name,
                message: "timed out".to_owned(),
            }),
        }
    }

    let tokens = tokenize(keyword);
    for hit in &mut all_hits {
        hit.score = score_hit(hit, &tokens) + jitter();
    }

    let deduped = dedup_by_title_author(all_hits);
    let mut sorted = deduped;
    sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    sorted.truncate(max_results as usize);

    AggregatedSearch { hits: sorted, errors }
}

fn tokenize(keyword: &str) -> Vec<String> {
    keyword
        .split(|c: char| c.is_whitespace() || (!c.is_alphanumeric() && !is_cjk(c)))
        .filter(|t| !t.is_empty())
        .filter(|t| t.chars().count() >= 2 || t.chars().any(is_cjk))
        .map(str::to_lowercase)
        .collect()
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0xAC00..=0xD7A3)
}

fn score_hit(hit: &NovelHit, tokens: &[String]) -> f64 {
    let title = hit.title.to_lowercase();
    let author = hit.author.as_deref().unwrap_or_default().to_lowercase();
    let latest = hit.latest_chapter.as_deref().unwrap_or_default().to_lowercase();

    let mut score = 0.0;
    for token in tokens {
        if title == *token {
            score += 100.0;
        } else if title.contains(token.as_str()) {
            let title_len = title.chars().count().max(1) as f64;
            score += 50.0 * (token.chars().count() as f64 / title_len);
        }

        if author == *token {
            score += 30.0;
        } else if author.contains(token.as_str()) {
            score += 20.0;
        }

        if latest.contains(token.as_str()) {
            score += 10.0;
        }
    }
    score
}

fn jitter() -> f64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0.0..0.1)
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || is_cjk(*c))
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn dedup_by_title_author(hits: Vec<NovelHit>) -> Vec<NovelHit> {
    let mut best: HashMap<(String, String), (usize, NovelHit)> = HashMap::new();
    for (arrival_index, hit) in hits.into_iter().enumerate() {
        let key = (normalize(&hit.title), normalize(hit.author.as_deref().unwrap_or_default()));
        match best.get(&key) {
            None => {
                best.insert(key, (arrival_index, hit));
            }
            Some((_, existing)) if hit.score > existing.score => {
                best.insert(key, (arrival_index, hit));
            }
            _ => {}
        }
    }
    let mut entries: Vec<_> = best.into_values().collect();
    entries.sort_by_key(|(idx, _)| *idx);
    entries.into_iter().map(|(_, hit)| hit).collect()
}

#[must_use]
pub fn default_per_source_timeout() -> Duration {
    DEFAULT_PER_SOURCE_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(title: &str, author: &str, score: f64) -> NovelHit {
        NovelHit {
            source_id: 1,
            source_name: "s".to_owned(),
            detail_url: "https://x.example.com/1".to_owned(),
            title: title.to_owned(),
            author: Some(author.to_owned()),
            latest_chapter: None,
            score,
        }
    }

    #[test]
    fn tokenize_keeps_cjk_single_chars_but_drops_short_latin() {
        let tokens = tokenize("a 龙 dragon");
        assert!(tokens.contains(&"dragon".to_owned()));
        assert!(tokens.contains(&"龙".to_owned()));
        assert!(!tokens.contains(&"a".to_owned()));
    }

    #[test]
    fn score_hit_rewards_exact_title_match() {
        let h = hit("Dragon King", "Jin Yong", 0.0);
        let tokens = tokenize("dragon king");
        let score = score_hit(&h, &tokens);
        assert!(score > 0.0);
    }

    #[test]
    fn dedup_keeps_higher_scoring_duplicate() {
        let low = hit("Same Title", "Same Author", 10.0);
        let high = hit("Same Title", "Same Author", 90.0);
        let deduped = dedup_by_title_author(vec![low, high]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].score, 90.0);
    }

    #[test]
    fn dedup_keeps_distinct_title_author_pairs() {
        let a = hit("Title A", "Author A", 10.0);
        let b = hit("Title B", "Author B", 20.0);
        let deduped = dedup_by_title_author(vec![a, b]);
        assert_eq!(deduped.len(), 2);
    }
}
