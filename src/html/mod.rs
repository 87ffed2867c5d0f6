//! Selector Engine: evaluates a rule-supplied selector expression
//! against a parsed HTML document.
//!
//! Grounded in the teacher's `parsing_utils::QuickSelect` trait and
//! `lazy_selectors!` macro — the same "select, then post-process" shape, but
//! generalized from hardcoded `static Selector`s known at compile time to
//! selector *strings* parsed at evaluation time, since rules are loaded data,
//! not code.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("invalid CSS selector: {0}")]
    InvalidCss(String),
    #[error("invalid regex in selector suffix: {0}")]
    InvalidRegex(#[from] regex::Error),
}

/// One parsed alternative out of a possibly pipe-joined selector expression.
struct Alternative {
    css: String,
    extractor: Extractor,
    regex_replace: Option<(Regex, String)>,
}

enum Extractor {
    /// Literal `text` — the node's collapsed text content.
    Text,
    /// `@attr` suffix — the named attribute.
    Attr(String),
    /// No suffix and not `meta[name=...]` — the node's inner HTML.
    InnerHtml,
    /// Selector matches a `meta[name="..."]` tag — its `content` attribute.
    MetaContent,
}

/// A compiled selector expression, ready to evaluate against any document.
pub struct SelectorExpr {
    alternatives: Vec<Alternative>,
}

impl SelectorExpr {
    /// Parses a selector expression of the form:
    /// `alt1|alt2|...`, each `alt` being `css[@attr|text]##regex##replacement`.
    pub fn parse(expr: &str) -> Result<Self, SelectorError> {
        let alternatives = expr
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse_alternative)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { alternatives })
    }

    fn parse_alternative(part: &str) -> Result<Alternative, SelectorError> {
        let (body, regex_replace) = match part.split_once("##") {
            Some((body, rest)) => {
                let (pattern, replacement) = rest.split_once("##").unwrap_or((rest, ""));
                let regex = Regex::new(pattern)?;
                (body, Some((regex, replacement.to_owned())))
            }
            None => (part, None),
        };

        let (css, extractor) = if let Some(css) = body.strip_suffix("@text") {
            (css, Extractor::Text)
        } else if body == "text" {
            (body, Extractor::Text)
        } else if let Some((css, attr)) = body.rsplit_once('@') {
            (css, Extractor::Attr(attr.to_owned()))
        } else if is_meta_name_selector(body) {
            (body, Extractor::MetaContent)
        } else {
            (body, Extractor::InnerHtml)
        };

        Ok(Alternative {
            css: css.trim().to_owned(),
            extractor,
            regex_replace,
        })
    }

    /// Evaluates against a document, returning the first non-empty result
    /// across alternatives (pipe-fallback semantics).
    #[must_use]
    pub fn extract_first(&self, doc: &Html, base: Option<&Url>) -> Option<String> {
        for alt in &self.alternatives {
            if let Some(value) = alt.extract_first(doc, base) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Evaluates every alternative in order and returns every non-empty
    /// extraction from the *first* alternative that yields anything, as a
    /// list (used by the TOC/search list selectors).
    #[must_use]
    pub fn extract_all(&self, doc: &Html, base: Option<&Url>) -> Vec<String> {
        for alt in &self.alternatives {
            let values = alt.extract_all(doc, base);
            if !values.is_empty() {
                return values;
            }
        }
        Vec::new()
    }

    /// Returns the matched element nodes of the first alternative that
    /// matches anything (used when a caller needs to re-scope selection to
    /// each matched node, e.g. one list item at a time).
    #[must_use]
    pub fn select_nodes<'d>(&self, doc: &'d Html) -> Vec<ElementRef<'d>> {
        for alt in &self.alternatives {
            let Ok(selector) = Selector::parse(&alt.css) else {
                continue;
            };
            let nodes: Vec<_> = doc.select(&selector).collect();
            if !nodes.is_empty() {
                return nodes;
            }
        }
        Vec::new()
    }
}

impl Alternative {
    fn extract_first(&self, doc: &Html, base: Option<&Url>) -> Option<String> {
        self.extract_all(doc, base).into_iter().next()
    }

    fn extract_all(&self, doc: &Html, base: Option<&Url>) -> Vec<String> {
        let Ok(selector) = Selector::parse(&self.css) else {
            return Vec::new();
        };
        doc.select(&selector)
            .filter_map(|el| self.extract_from_element(el, base))
            .collect()
    }

    fn extract_from_element(&self, el: ElementRef, base: Option<&Url>) -> Option<String> {
        let raw = match &self.extractor {
            Extractor::Text => Some(collapse_whitespace(&el.text().collect::<String>())),
            Extractor::Attr(name) => el.value().attr(name).map(|v| absolutize_if_url(name, v, base)),
            Extractor::InnerHtml => {
                let html = el.inner_html();
                let trimmed = html.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_owned())
                }
            }
            Extractor::MetaContent => el.value().attr("content").map(str::to_owned),
        }?;

        let value = match &self.regex_replace {
            Some((re, replacement)) => re.replace_all(&raw, replacement.as_str()).into_owned(),
            None => raw,
        };
        Some(value).filter(|v| !v.is_empty())
    }
}

fn is_meta_name_selector(css: &str) -> bool {
    css.starts_with("meta[name")
}

fn absolutize_if_url(attr: &str, value: &str, base: Option<&Url>) -> String {
    if (attr == "href" || attr == "src") && !value.starts_with("data:") {
        if let Some(base) = base {
            if let Ok(joined) = base.join(value) {
                return joined.into();
            }
        }
    }
    value.to_owned()
}

/// Trims whitespace and collapses interior whitespace runs to single spaces.
#[must_use]
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

static BR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static BLOCK_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</(p|div|li|blockquote|h[1-6]|section|article|tr|table)>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static NUMERIC_ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"&#x?[0-9a-fA-F]+;").unwrap());

/// Converts a chapter-content inner-HTML fragment to plain text, preserving
/// paragraph breaks as blank lines and `<br>` as single newlines, instead of
/// flattening every node to one line. Applied before `ad_patterns` cleanup.
#[must_use]
pub fn html_to_paragraphs(html: &str) -> String {
    let with_breaks = BR_RE.replace_all(html, "\n");
    let with_blocks = BLOCK_CLOSE_RE.replace_all(&with_breaks, "\n\n");
    let stripped = TAG_RE.replace_all(&with_blocks, "");
    let decoded = decode_entities(&stripped);
    normalize_paragraphs(&decoded)
}

/// Decodes the handful of HTML entities likely to appear in scraped prose.
/// `&amp;` is decoded last so it cannot turn e.g. `&amp;lt;` into `<`.
fn decode_entities(s: &str) -> String {
    let s = s.replace("&nbsp;", " ");
    let s = s.replace("&lt;", "<");
    let s = s.replace("&gt;", ">");
    let s = s.replace("&quot;", "\"");
    let s = s.replace("&apos;", "'").replace("&#39;", "'");
    let s = NUMERIC_ENTITY_RE.replace_all(&s, |caps: &regex::Captures| {
        let body = &caps[0][2..caps[0].len() - 1];
        let code = if body.starts_with('x') || body.starts_with('X') {
            u32::from_str_radix(&body[1..], 16).ok()
        } else {
            body.parse().ok()
        };
        code.and_then(char::from_u32).map(String::from).unwrap_or_default()
    });
    s.replace("&amp;", "&")
}

/// Collapses whitespace within each line, drops blank lines down to paragraph
/// separators, and joins the result with a blank line between paragraphs.
fn normalize_paragraphs(raw: &str) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current_lines: Vec<String> = Vec::new();
    for line in raw.split('\n') {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            if !current_lines.is_empty() {
                paragraphs.push(current_lines.join("\n"));
                current_lines.clear();
            }
        } else {
            current_lines.push(collapsed);
        }
    }
    if !current_lines.is_empty() {
        paragraphs.push(current_lines.join("\n"));
    }
    paragraphs.join("\n\n")
}

/// Removes every node matching `selectors` (pipe-joined, reused as a list of
/// independent CSS selectors here rather than fallback alternatives) from a
/// parsed document, returning the mutated document. Used before content
/// extraction.
#[must_use]
pub fn remove_nodes(mut doc: Html, selectors: &[String]) -> Html {
    for css in selectors {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        let ids: Vec<_> = doc.select(&selector).map(|e| e.id()).collect();
        for id in ids {
            if let Some(mut node) = doc.tree.get_mut(id) {
                node.detach();
            }
        }
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html(s: &str) -> Html {
        Html::parse_document(s)
    }

    #[test]
    fn plain_css_extracts_inner_html() {
        let doc = html("<div><h1>Hello <b>World</b></h1></div>");
        let expr = SelectorExpr::parse("h1").unwrap();
        assert_eq!(expr.extract_first(&doc, None).unwrap(), "Hello <b>World</b>");
    }

    #[test]
    fn attr_suffix_extracts_attribute_and_absolutizes() {
        let doc = html(r#"<a class="link" href="/chapter/1">Next</a>"#);
        let expr = SelectorExpr::parse(".link@href").unwrap();
        let base = Url::parse("https://example.com/book/1").unwrap();
        assert_eq!(
            expr.extract_first(&doc, Some(&base)).unwrap(),
            "https://example.com/chapter/1"
        );
    }

    #[test]
    fn text_literal_collapses_whitespace() {
        let doc = html("<p>  Hello   \n   World  </p>");
        let expr = SelectorExpr::parse("p@text").unwrap();
        assert_eq!(expr.extract_first(&doc, None).unwrap(), "Hello World");
    }

    #[test]
    fn meta_name_selector_extracts_content_attribute() {
        let doc = html(r#"<meta name="chapterurl" content="https://x.example.com/c/9">"#);
        let expr = SelectorExpr::parse(r#"meta[name="chapterurl"]"#).unwrap();
        assert_eq!(
            expr.extract_first(&doc, None).unwrap(),
            "https://x.example.com/c/9"
        );
    }

    #[test]
    fn pipe_fallback_uses_first_non_empty() {
        let doc = html("<div class='b'>Found</div>");
        let expr = SelectorExpr::parse(".a|.b").unwrap();
        assert_eq!(expr.extract_first(&doc, None).unwrap(), "Found");
    }

    #[test]
    fn regex_replace_suffix_strips_noise() {
        let doc = html("<h1>Chapter 12: The Storm</h1>");
        let expr = SelectorExpr::parse(r"h1##^Chapter \d+: ##").unwrap();
        assert_eq!(expr.extract_first(&doc, None).unwrap(), "The Storm");
    }

    #[test]
    fn html_to_paragraphs_preserves_block_breaks() {
        let text = html_to_paragraphs("<p>Para1</p><p>Para2</p>");
        assert_eq!(text, "Para1\n\nPara2");
    }

    #[test]
    fn html_to_paragraphs_turns_br_into_single_newline() {
        let text = html_to_paragraphs("<p>Line1<br>Line2</p>");
        assert_eq!(text, "Line1\nLine2");
    }

    #[test]
    fn html_to_paragraphs_decodes_entities_without_corrupting_amp() {
        let text = html_to_paragraphs("<p>Smith &amp;amp; Co &lt;ok&gt;</p>");
        assert_eq!(text, "Smith &amp; Co <ok>");
    }

    #[test]
    fn remove_nodes_strips_matching_subtrees() {
        let doc = html("<div><p class='ad'>buy now</p><p>real content</p></div>");
        let cleaned = remove_nodes(doc, &[".ad".to_owned()]);
        let expr = SelectorExpr::parse("div@text").unwrap();
        assert_eq!(expr.extract_first(&cleaned, None).unwrap(), "real content");
    }
}
