//! Turns a [`RawTocEntry`] list into the canonical, gap-free chapter order:
//! drop junk, dedup by three independent signals, sort by detected chapter
//! number, then renumber. Grounded in the teacher's chapter-list handling in
//! `updater/native/book.rs` (`RoyalRoadChapter::to_chapter`), generalized
//! from "trust the site's own ordering" (RoyalRoad's API already returns a
//! clean list) to the noisy, scraped lists this crate's other sources
//! produce.

use crate::source::RawTocEntry;
use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone)]
pub struct Chapter {
    pub order: u32,
    pub title: String,
    pub url: String,
    pub content: Option<String>,
}

static NOISE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^第$",
        r"^章$",
        r"目录",
        r"返回",
        r"上一页",
        r"下一页",
        r"^\d+$",
        r"^[[:punct:]]+$",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static CHAPTER_NUMBER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"第\s*(\d+)\s*章", r"卷\s*(\d+)", r"^(\d+)[.、]"]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

#[must_use]
pub fn normalize(raw: Vec<RawTocEntry>) -> Vec<Chapter> {
    let filtered = drop_invalid_and_noisy(raw);
    let deduped = dedup(filtered);
    let sorted = sort_chapters(deduped);
    renumber(sorted)
}

fn drop_invalid_and_noisy(raw: Vec<RawTocEntry>) -> Vec<RawTocEntry> {
    raw.into_iter()
        .filter(|entry| {
            let title = entry.title.trim();
            if title.is_empty() || entry.url.trim().is_empty() {
                return false;
            }
            !NOISE_PATTERNS.iter().any(|re| re.is_match(title))
        })
        .collect()
}

fn detect_chapter_number(title: &str) -> Option<u32> {
    CHAPTER_NUMBER_PATTERNS.iter().find_map(|re| {
        re.captures(title)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

fn canonical_score(title: &str) -> (bool, usize, usize) {
    let has_number = detect_chapter_number(title).is_some();
    let len = title.chars().count();
    let non_word = title.chars().filter(|c| !c.is_alphanumeric() && !c.is_whitespace()).count();
    (has_number, len, non_word)
}

fn is_more_canonical(a: &str, b: &str) -> bool {
    let (a_num, a_len, a_noise) = canonical_score(a);
    let (b_num, b_len, b_noise) = canonical_score(b);
    if a_num != b_num {
        return a_num;
    }
    if a_len != b_len {
        return a_len > b_len;
    }
    a_noise < b_noise
}

fn dedup(entries: Vec<RawTocEntry>) -> Vec<RawTocEntry> {
    let by_url = dedup_by_url(entries);
    let by_number = dedup_by_chapter_number(by_url);
    dedup_by_similarity(by_number)
}

fn dedup_by_url(entries: Vec<RawTocEntry>) -> Vec<RawTocEntry> {
    let mut kept: Vec<RawTocEntry> = Vec::new();
    for entry in entries {
        if let Some(existing) = kept.iter_mut().find(|e| e.url == entry.url) {
            if is_more_canonical(&entry.title, &existing.title) {
                *existing = entry;
            }
        } else {
            kept.push(entry);
        }
    }
    kept
}

fn dedup_by_chapter_number(entries: Vec<RawTocEntry>) -> Vec<RawTocEntry> {
    let mut kept: Vec<(Option<u32>, RawTocEntry)> = Vec::new();
    for entry in entries {
        let number = detect_chapter_number(&entry.title);
        if number.is_none() {
            kept.push((number, entry));
            continue;
        }
        if let Some(slot) = kept.iter_mut().find(|(n, _)| *n == number) {
            if is_more_canonical(&entry.title, &slot.1.title) {
                slot.1 = entry;
            }
        } else {
            kept.push((number, entry));
        }
    }
    kept.into_iter().map(|(_, e)| e).collect()
}

fn dedup_by_similarity(entries: Vec<RawTocEntry>) -> Vec<RawTocEntry> {
    let mut kept: Vec<RawTocEntry> = Vec::new();
    'outer: for entry in entries {
        for existing in &kept {
            if title_similarity(&entry.title, &existing.title) >= 0.9 {
                continue 'outer;
            }
        }
        kept.push(entry);
    }
    kept
}

/// Normalized similarity in `[0, 1]`, `1.0` meaning identical, derived from
/// Levenshtein edit distance divided by the longer string's length.
fn title_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let distance = levenshtein(&a, &b);
    let max_len = a.len().max(b.len()).max(1) as f64;
    1.0 - (distance as f64 / max_len)
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn sort_chapters(entries: Vec<RawTocEntry>) -> Vec<RawTocEntry> {
    let mut indexed: Vec<(usize, Option<u32>, RawTocEntry)> = entries
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| {
            let number = detect_chapter_number(&entry.title);
            (idx, number, entry)
        })
        .collect();

    indexed.sort_by(|a, b| match (a.1, b.1) {
        (Some(x), Some(y)) => x.cmp(&y).then(a.0.cmp(&b.0)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.0.cmp(&b.0),
    });

    indexed.into_iter().map(|(_, _, entry)| entry).collect()
}

fn renumber(entries: Vec<RawTocEntry>) -> Vec<Chapter> {
    entries
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| Chapter {
            order: idx as u32 + 1,
            title: entry.title,
            url: entry.url,
            content: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, url: &str) -> RawTocEntry {
        RawTocEntry { title: title.to_owned(), url: url.to_owned() }
    }

    #[test]
    fn drops_noise_titles_and_empty_fields() {
        let raw = vec![
            entry("目录", "https://x.example.com/1"),
            entry("", "https://x.example.com/2"),
            entry("第1章 开始", "https://x.example.com/3"),
        ];
        let chapters = normalize(raw);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "第1章 开始");
    }

    #[test]
    fn dedups_by_url_keeping_more_canonical_title() {
        let raw = vec![
            entry("Chapter", "https://x.example.com/c/1"),
            entry("第1章 风暴将至", "https://x.example.com/c/1"),
        ];
        let chapters = normalize(raw);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "第1章 风暴将至");
    }

    #[test]
    fn dedups_by_chapter_number_across_different_urls() {
        let raw = vec![
            entry("第1章 风暴将至", "https://x.example.com/old/1"),
            entry("第1章 风暴将至", "https://x.example.com/new/1"),
        ];
        let chapters = normalize(raw);
        assert_eq!(chapters.len(), 1);
    }

    #[test]
    fn sorts_by_detected_chapter_number() {
        let raw = vec![
            entry("第2章 二", "https://x.example.com/2"),
            entry("第1章 一", "https://x.example.com/1"),
        ];
        let chapters = normalize(raw);
        assert_eq!(chapters[0].title, "第1章 一");
        assert_eq!(chapters[1].title, "第2章 二");
        assert_eq!(chapters[0].order, 1);
        assert_eq!(chapters[1].order, 2);
    }

    #[test]
    fn title_similarity_rejects_near_duplicate_titles() {
        let raw = vec![
            entry("The Storm Arrives Chapter", "https://x.example.com/a"),
            entry("The Storm Arrives Chaptr", "https://x.example.com/b"),
        ];
        let chapters = normalize(raw);
        assert_eq!(chapters.len(), 1);
    }
}
