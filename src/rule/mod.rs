//! The canonical Rule schema and the normalization pass that turns
//! loosely-typed, legacy-shaped JSON into it ("Dynamic typing in the
//! source").
//!
//! Rules are immutable once loaded and shared read-only across every adapter
//! built from them.

pub mod provider;

use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct SearchRule {
    pub url_template: String,
    pub method: HttpMethod,
    pub body_template: Option<String>,
    pub list_selector: String,
    pub title_selector: String,
    pub author_selector: Option<String>,
    pub link_selector: String,
    pub latest_selector: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BookRule {
    pub title_selector: String,
    pub author_selector: String,
    pub intro_selector: Option<String>,
    pub cover_selector: Option<String>,
    pub category_selector: Option<String>,
    pub status_selector: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UrlTransform {
    pub from_regex: String,
    pub to_template: String,
}

#[derive(Debug, Clone)]
pub struct TocRule {
    /// Pipe-joined fallback list, e.g. `"#chapters a|.toc li a"`.
    pub list_selector: String,
    pub title_extractor: String,
    pub url_extractor: String,
    pub has_pages: bool,
    pub next_page_selector: Option<String>,
    pub url_transform: Option<UrlTransform>,
}

#[derive(Debug, Clone)]
pub struct ChapterRule {
    pub title_selector: String,
    pub content_selector: String,
    pub ad_patterns: Vec<String>,
    pub remove_selectors: Vec<String>,
}

/// A single book source, fully normalized. Every selector string that is
/// reachable per the enabled sub-rules is guaranteed non-empty by
/// [`Rule::normalize`].
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: u32,
    pub name: String,
    pub base_url: String,
    pub enabled: bool,
    pub encoding: String,
    pub search: SearchRule,
    pub book: BookRule,
    pub toc: TocRule,
    pub chapter: ChapterRule,
}

/// The loosely-typed shape rule files actually arrive in: multiple legacy
/// field names coexist (`url` vs `baseUrl`, `search.result` vs
/// `searchRule.list`, ...). This is deserialized once and immediately
/// discarded by [`Rule::normalize`] — downstream components never see it.
#[derive(Debug, Deserialize)]
pub struct RawRule {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "url", alias = "baseUrl")]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub encoding: Option<String>,

    #[serde(alias = "searchRule", default)]
    pub search: Option<RawSearchRule>,
    #[serde(alias = "bookRule", default)]
    pub book: Option<RawBookRule>,
    #[serde(alias = "tocRule", default)]
    pub toc: Option<RawTocRule>,
    #[serde(alias = "chapterRule", default)]
    pub chapter: Option<RawChapterRule>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
pub struct RawSearchRule {
    #[serde(alias = "url")]
    pub url_template: Option<String>,
    pub method: Option<String>,
    #[serde(alias = "body")]
    pub body_template: Option<String>,
    #[serde(alias = "result", alias = "list")]
    pub list_selector: Option<String>,
    pub title_selector: Option<String>,
    pub author_selector: Option<String>,
    #[serde(alias = "link")]
    pub link_selector: Option<String>,
    pub latest_selector: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawBookRule {
    pub title_selector: Option<String>,
    pub author_selector: Option<String>,
    pub intro_selector: Option<String>,
    pub cover_selector: Option<String>,
    pub category_selector: Option<String>,
    pub status_selector: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawUrlTransform {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawTocRule {
    #[serde(alias = "selector")]
    pub list_selector: Option<String>,
    pub title_extractor: Option<String>,
    pub url_extractor: Option<String>,
    #[serde(default)]
    pub has_pages: bool,
    pub next_page_selector: Option<String>,
    pub url_transform: Option<RawUrlTransform>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawChapterRule {
    pub title_selector: Option<String>,
    pub content_selector: Option<String>,
    #[serde(default)]
    pub ad_patterns: Vec<String>,
    #[serde(default)]
    pub remove_selectors: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuleLoadError {
    #[error("rule {id}: {message}")]
    Invalid { id: u32, message: String },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Rule {
    /// Rewrites the legacy `%s` placeholder to `{keyword}` anywhere it
    /// appears in URL strings, for backward compatibility with old rule
    /// files.
    fn rewrite_legacy_placeholder(s: &str) -> String {
        s.replace("%s", "{keyword}")
    }

    /// Normalizes a [`RawRule`] into the canonical [`Rule`], or rejects it.
    ///
    /// Invariants enforced here: `id > 0`, `base_url` is absolute, and every
    /// selector string that is *reachable* (i.e. the sub-rule is present and
    /// relevant fields are used) is non-empty.
    pub fn normalize(raw: RawRule) -> Result<Self, RuleLoadError> {
        let id = raw.id;
        let fail = |message: &str| RuleLoadError::Invalid {
            id,
            message: message.to_owned(),
        };

        if id == 0 {
            return Err(fail("id must be > 0"));
        }
        if Url::parse(&raw.base_url).is_err() {
            return Err(fail("baseUrl is not an absolute URL"));
        }

        let search_raw = raw.search.ok_or_else(|| fail("missing search rule"))?;
        let book_raw = raw.book.ok_or_else(|| fail("missing book rule"))?;
        let toc_raw = raw.toc.ok_or_else(|| fail("missing toc rule"))?;
        let chapter_raw = raw.chapter.ok_or_else(|| fail("missing chapter rule"))?;

        let url_template = search_raw
            .url_template
            .ok_or_else(|| fail("search.urlTemplate missing"))?;
        let url_template = Self::rewrite_legacy_placeholder(&url_template);
        if !url_template.contains("{keyword}") {
            return Err(fail("search.urlTemplate must contain {keyword}"));
        }

        let method = match search_raw.method.as_deref() {
            None | Some("GET") | Some("get") => HttpMethod::Get,
            Some("POST") | Some("post") => HttpMethod::Post,
            Some(other) => return Err(fail(&format!("unknown search method {other}"))),
        };

        let search = SearchRule {
            url_template,
            method,
            body_template: search_raw.body_template,
            list_selector: non_empty(search_raw.list_selector, "search.listSelector", &fail)?,
            title_selector: non_empty(search_raw.title_selector, "search.titleSelector", &fail)?,
            author_selector: search_raw.author_selector,
            link_selector: non_empty(search_raw.link_selector, "search.linkSelector", &fail)?,
            latest_selector: search_raw.latest_selector,
        };

        let book = BookRule {
            title_selector: non_empty(book_raw.title_selector, "book.titleSelector", &fail)?,
            author_selector: non_empty(book_raw.author_selector, "book.authorSelector", &fail)?,
            intro_selector: book_raw.intro_selector,
            cover_selector: book_raw.cover_selector,
            category_selector: book_raw.category_selector,
            status_selector: book_raw.status_selector,
        };

        let toc = TocRule {
            list_selector: non_empty(toc_raw.list_selector, "toc.listSelector", &fail)?,
            title_extractor: toc_raw
                .title_extractor
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "text".to_owned()),
            url_extractor: toc_raw
                .url_extractor
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "href".to_owned()),
            has_pages: toc_raw.has_pages,
            next_page_selector: toc_raw.next_page_selector,
            url_transform: toc_raw.url_transform.map(|t| UrlTransform {
                from_regex: t.from,
                to_template: t.to,
            }),
        };
        if toc.has_pages && toc.next_page_selector.is_none() {
            return Err(fail("toc.hasPages is set but nextPageSelector is missing"));
        }

        let chapter = ChapterRule {
            title_selector: non_empty(chapter_raw.title_selector, "chapter.titleSelector", &fail)?,
            content_selector: non_empty(
                chapter_raw.content_selector,
                "chapter.contentSelector",
                &fail,
            )?,
            ad_patterns: chapter_raw.ad_patterns,
            remove_selectors: chapter_raw.remove_selectors,
        };

        Ok(Self {
            id,
            name: raw.name.unwrap_or_else(|| format!("source-{id}")),
            base_url: raw.base_url,
            enabled: raw.enabled,
            encoding: raw.encoding.unwrap_or_else(|| "UTF-8".to_owned()),
            search,
            book,
            toc,
            chapter,
        })
    }
}

fn non_empty(
    value: Option<String>,
    field: &str,
    fail: &impl Fn(&str) -> RuleLoadError,
) -> Result<String, RuleLoadError> {
    match value {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(fail(&format!("{field} must be non-empty"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raw(id: u32) -> RawRule {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": "Test Source",
            "url": "https://example.com",
            "search": {
                "url": "https://example.com/search?q=%s",
                "result": ".item",
                "title_selector": ".title",
                "link": ".title@href",
            },
            "book": {
                "title_selector": "h1",
                "author_selector": ".author",
            },
            "toc": {
                "selector": "#chapters a",
            },
            "chapter": {
                "title_selector": "h1",
                "content_selector": ".content",
            },
        }))
        .unwrap()
    }

    #[test]
    fn normalizes_legacy_field_names_and_placeholder() {
        let rule = Rule::normalize(sample_raw(1)).unwrap();
        assert_eq!(rule.id, 1);
        assert!(rule.search.url_template.contains("{keyword}"));
        assert!(!rule.search.url_template.contains("%s"));
        assert_eq!(rule.search.list_selector, ".item");
        assert_eq!(rule.toc.title_extractor, "text");
        assert_eq!(rule.toc.url_extractor, "href");
    }

    #[test]
    fn rejects_id_zero() {
        let mut raw = sample_raw(0);
        raw.id = 0;
        assert!(Rule::normalize(raw).is_err());
    }

    #[test]
    fn rejects_non_absolute_base_url() {
        let mut raw = sample_raw(2);
        raw.base_url = "/relative/path".to_owned();
        assert!(Rule::normalize(raw).is_err());
    }

    #[test]
    fn rejects_missing_keyword_placeholder() {
        let mut raw = sample_raw(3);
        raw.search.as_mut().unwrap().url_template = Some("https://example.com/search".to_owned());
        assert!(Rule::normalize(raw).is_err());
    }
}
