//! One [`SourceAdapter`] per enabled rule. Grounded in the teacher's
//! `source::royalroad::RoyalRoad::{search,fetch_without_chapter_content}` and
//! `updater/native/book.rs`'s `Chapter` fetch, generalized from hardcoded
//! selectors to the rule's selector expressions via
//! [`crate::html::SelectorExpr`].

use crate::cache::{Cache, CacheKey, CHAPTER_TTL, DETAIL_TTL, SEARCH_TTL, TOC_TTL};
use crate::error::{EngineError, Result};
use crate::html::SelectorExpr;
use crate::http::HttpClientPool;
use crate::rule::{HttpMethod, Rule};
use scraper::Html;
use serde::{Deserialize, Serialize};
use url::Url;

/// Per-source search hit. `score` is set later by the aggregator; adapters
/// always produce `0.0` here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NovelHit {
    pub source_id: u32,
    pub source_name: String,
    pub detail_url: String,
    pub title: String,
    pub author: Option<String>,
    pub latest_chapter: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NovelDetail {
    pub detail_url: String,
    pub title: String,
    pub author: String,
    pub intro: Option<String>,
    pub cover: Option<String>,
    pub category: Option<String>,
    pub status: Option<String>,
}

/// One raw TOC row, not yet normalized (no `order`, no dedup/sort applied).
#[derive(Debug, Clone)]
pub struct RawTocEntry {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ChapterContent {
    pub title: String,
    pub content: String,
}

const MAX_SEARCH_HITS_PER_SOURCE: usize = 2;
const MAX_TOC_PAGES: usize = 50;

#[derive(Clone)]
pub struct SourceAdapter {
    rule: Rule,
    http: HttpClientPool,
    cache: Cache,
}

impl SourceAdapter {
    #[must_use]
    pub fn new(rule: Rule, http: HttpClientPool, cache: Cache) -> Self {
        Self { rule, http, cache }
    }

    #[must_use]
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub async fn search(&self, keyword: &str) -> Result<Vec<NovelHit>> {
        let key = CacheKey::search(self.rule.id, keyword);
        let encoded = urlencoding_encode(keyword);
        let url_template = self.rule.search.url_template.replace("{keyword}", &encoded);
        let body = self
            .rule
            .search
            .body_template
            .as_ref()
            .map(|t| t.replace("{keyword}", &encoded));

        let bytes = self
            .cache
            .get_or_fetch(key, SEARCH_TTL, || async {
                self.perform_search_request(&url_template, body.as_deref()).await
            })
            .await?;
        let html = String::from_utf8_lossy(&bytes).into_owned();
        self.parse_search(&html)
    }

    /// Fetches `url` and decodes it with the rule's declared encoding
    /// (GBK/Big5/etc. via `encoding_rs`), returning the decoded text as
    /// UTF-8 bytes so every cache tier only ever stores UTF-8.
    async fn fetch_decoded(&self, url: &str) -> Result<bytes::Bytes> {
        let text = self.http.get_text(url, Some(&self.rule.encoding)).await?;
        Ok(bytes::Bytes::from(text.into_bytes()))
    }

    fn parse_search(&self, html: &str) -> Result<Vec<NovelHit>> {
        let doc = Html::parse_document(html);
        let base = Url::parse(&self.rule.base_url).ok();

        let list_selector = SelectorExpr::parse(&self.rule.search.list_selector)
            .map_err(|e| EngineError::Parse { what: e.to_string(), url: self.rule.base_url.clone() })?;
        let title_selector = SelectorExpr::parse(&self.rule.search.title_selector)
            .map_err(|e| EngineError::Parse { what: e.to_string(), url: self.rule.base_url.clone() })?;
        let link_selector = SelectorExpr::parse(&self.rule.search.link_selector)
            .map_err(|e| EngineError::Parse { what: e.to_string(), url: self.rule.base_url.clone() })?;
        let author_selector = self
            .rule
            .search
            .author_selector
            .as_ref()
            .and_then(|s| SelectorExpr::parse(s).ok());
        let latest_selector = self
            .rule
            .search
            .latest_selector
            .as_ref()
            .and_then(|s| SelectorExpr::parse(s).ok());

        let mut hits = Vec::new();
        for node in list_selector.select_nodes(&doc) {
            let fragment = Html::parse_fragment(&node.html());
            let Some(title) = title_selector.extract_first(&fragment, base.as_ref()) else {
                continue;
            };
            let Some(link) = link_selector.extract_first(&fragment, base.as_ref()) else {
                continue;
            };

            hits.push(NovelHit {
                source_id: self.rule.id,
                source_name: self.rule.name.clone(),
                detail_url: link,
                title,
                author: author_selector.as_ref().and_then(|s| s.extract_first(&fragment, base.as_ref())),
                latest_chapter: latest_selector.as_ref().and_then(|s| s.extract_first(&fragment, base.as_ref())),
                score: 0.0,
            });
            if hits.len() >= MAX_SEARCH_HITS_PER_SOURCE {
                break;
            }
        }
        Ok(hits)
    }

    pub async fn detail(&self, url: &str) -> Result<NovelDetail> {
        let key = CacheKey::detail(url);
        let bytes = self
            .cache
            .get_or_fetch(key, DETAIL_TTL, || async { self.fetch_decoded(url).await })
            .await?;
        let html = String::from_utf8_lossy(&bytes).into_owned();
        self.parse_detail(url, &html)
    }

    fn parse_detail(&self, url: &str, html: &str) -> Result<NovelDetail> {
        let doc = Html::parse_document(html);
        let base = Url::parse(url).ok();

        let title_selector = SelectorExpr::parse(&self.rule.book.title_selector)
            .map_err(|e| EngineError::Parse { what: e.to_string(), url: url.to_owned() })?;
        let author_selector = SelectorExpr::parse(&self.rule.book.author_selector)
            .map_err(|e| EngineError::Parse { what: e.to_string(), url: url.to_owned() })?;

        let title = title_selector
            .extract_first(&doc, base.as_ref())
            .ok_or_else(|| EngineError::Parse { what: "no title found".to_owned(), url: url.to_owned() })?;
        let author = author_selector.extract_first(&doc, base.as_ref()).unwrap_or_default();

        let optional = |sel: &Option<String>| -> Option<String> {
            sel.as_ref()
                .and_then(|s| SelectorExpr::parse(s).ok())
                .and_then(|s| s.extract_first(&doc, base.as_ref()))
        };

        Ok(NovelDetail {
            detail_url: url.to_owned(),
            title,
            author,
            intro: optional(&self.rule.book.intro_selector),
            cover: optional(&self.rule.book.cover_selector),
            category: optional(&self.rule.book.category_selector),
            status: optional(&self.rule.book.status_selector),
        })
    }

    pub async fn toc(&self, url: &str) -> Result<Vec<RawTocEntry>> {
        let key = CacheKey::toc(url);
        let bytes = self
            .cache
            .get_or_fetch(key, TOC_TTL, || async { self.fetch_decoded(url).await })
            .await?;
        let html = String::from_utf8_lossy(&bytes).into_owned();
        self.collect_toc_pages(url, html).await
    }

    async fn collect_toc_pages(&self, start_url: &str, first_page_html: String) -> Result<Vec<RawTocEntry>> {
        let mut entries = Vec::new();
        let mut page_html = first_page_html;
        let mut current_url = start_url.to_owned();

        for _ in 0..MAX_TOC_PAGES {
            let (mut page_entries, next_url) = self.parse_toc_page(&current_url, &page_html)?;
            entries.append(&mut page_entries);

            if !self.rule.toc.has_pages {
                break;
            }
            let Some(next_url) = next_url else { break };
            if next_url == current_url {
                break;
            }

            let key = CacheKey::toc(&next_url);
            let next_url_owned = next_url.clone();
            let bytes = self
                .cache
                .get_or_fetch(key, TOC_TTL, || async { self.fetch_decoded(&next_url_owned).await })
                .await?;
            page_html = String::from_utf8_lossy(&bytes).into_owned();
            current_url = next_url;
        }
        Ok(entries)
    }

    fn parse_toc_page(&self, url: &str, html: &str) -> Result<(Vec<RawTocEntry>, Option<String>)> {
        let doc = Html::parse_document(html);
        let base = Url::parse(url).ok();

        let list_selector = SelectorExpr::parse(&self.rule.toc.list_selector)
            .map_err(|e| EngineError::Parse { what: e.to_string(), url: url.to_owned() })?;

        let mut entries = Vec::new();
        for node in list_selector.select_nodes(&doc) {
            let title = extract_toc_title(node, &self.rule.toc.title_extractor);
            let Some(raw_url) = extract_toc_url(node, &self.rule.toc.url_extractor, base.as_ref()) else {
                continue;
            };
            let transformed = self.apply_url_transform(&raw_url);
            entries.push(RawTocEntry { title, url: transformed });
        }

        let next_url = self
            .rule
            .toc
            .next_page_selector
            .as_ref()
            .and_then(|s| SelectorExpr::parse(s).ok())
            .and_then(|s| s.extract_first(&doc, base.as_ref()));

        Ok((entries, next_url))
    }

    fn apply_url_transform(&self, url: &str) -> String {
        let Some(transform) = &self.rule.toc.url_transform else {
            return url.to_owned();
        };
        let Ok(re) = regex::Regex::new(&transform.from_regex) else {
            return url.to_owned();
        };
        re.replace(url, transform.to_template.as_str()).into_owned()
    }

    pub async fn chapter(&self, url: &str) -> Result<ChapterContent> {
        let key = CacheKey::chapter(url);
        let bytes = self
            .cache
            .get_or_fetch(key, CHAPTER_TTL, || async { self.fetch_decoded(url).await })
            .await?;
        let html = String::from_utf8_lossy(&bytes).into_owned();
        self.parse_chapter(url, &html)
    }

    fn parse_chapter(&self, url: &str, html: &str) -> Result<ChapterContent> {
        let doc = Html::parse_document(html);
        let base = Url::parse(url).ok();

        let title_selector = SelectorExpr::parse(&self.rule.chapter.title_selector)
            .map_err(|e| EngineError::Parse { what: e.to_string(), url: url.to_owned() })?;
        let content_selector = SelectorExpr::parse(&self.rule.chapter.content_selector)
            .map_err(|e| EngineError::Parse { what: e.to_string(), url: url.to_owned() })?;

        let title = title_selector.extract_first(&doc, base.as_ref()).unwrap_or_default();

        let cleaned = crate::html::remove_nodes(doc, &self.rule.chapter.remove_selectors);
        let raw_content = content_selector
            .extract_first(&cleaned, base.as_ref())
            .ok_or_else(|| EngineError::Parse { what: "no chapter content found".to_owned(), url: url.to_owned() })?;

        let mut content = crate::html::html_to_paragraphs(&raw_content);
        for pattern in &self.rule.chapter.ad_patterns {
            if let Ok(re) = regex::Regex::new(pattern) {
                content = re.replace_all(&content, "").into_owned();
            }
        }

        Ok(ChapterContent { title, content })
    }

    async fn perform_search_request(&self, url: &str, body: Option<&str>) -> Result<bytes::Bytes> {
        match self.rule.search.method {
            HttpMethod::Get => self.fetch_decoded(url).await,
            HttpMethod::Post => {
                let text = self
                    .http
                    .post_text(url, body, Some(&self.rule.encoding))
                    .await?;
                Ok(bytes::Bytes::from(text.into_bytes()))
            }
        }
    }
}

/// `titleExtractor` is either the literal `text` (the matched node's own
/// text) or a CSS selector for a descendant whose text is taken instead.
fn extract_toc_title(node: scraper::ElementRef, extractor: &str) -> String {
    if extractor.eq_ignore_ascii_case("text") {
        return crate::html::collapse_whitespace(&node.text().collect::<String>());
    }
    scraper::Selector::parse(extractor)
        .ok()
        .and_then(|selector| node.select(&selector).next())
        .map(|el| crate::html::collapse_whitespace(&el.text().collect::<String>()))
        .unwrap_or_default()
}

/// `urlExtractor` is either the literal `href` (the matched node's own
/// attribute) or a CSS selector for a descendant `<a>` whose `href` is taken.
fn extract_toc_url(node: scraper::ElementRef, extractor: &str, base: Option<&Url>) -> Option<String> {
    let raw = if extractor.eq_ignore_ascii_case("href") || extractor.eq_ignore_ascii_case("src") {
        node.value().attr(extractor)?.to_owned()
    } else {
        let selector = scraper::Selector::parse(extractor).ok()?;
        let descendant = node.select(&selector).next()?;
        descendant.value().attr("href").or_else(|| descendant.value().attr("src"))?.to_owned()
    };
    match base {
        Some(base) => Some(base.join(&raw).map(|u| u.to_string()).unwrap_or(raw)),
        None => Some(raw),
    }
}

fn urlencoding_encode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoding_encode_preserves_unreserved_and_escapes_rest() {
        assert_eq!(urlencoding_encode("a b"), "a+b");
        assert_eq!(urlencoding_encode("foo-bar_1.2"), "foo-bar_1.2");
        assert_eq!(urlencoding_encode("龙王"), "%E9%BE%99%E7%8E%8B");
    }
}
