//! Rule loading is treated as an opaque "rule provider": the engine
//! depends only on [`RuleProvider`], never on the
//! filesystem directly. [`FsRuleProvider`] is the default, swappable
//! implementation, grounded in the teacher's habit of reading everything
//! needed at startup rather than lazily.

use super::{RawRule, Rule, RuleLoadError};
use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};

pub trait RuleProvider {
    /// Returns every rule this provider can produce, already normalized.
    /// Rules that fail normalization are dropped with a logged warning, not
    /// propagated — one bad rule file must not prevent the others from
    /// loading.
    fn load_all(&self) -> Result<Vec<Rule>>;
}

pub struct FsRuleProvider {
    dir: PathBuf,
}

impl FsRuleProvider {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Files with `template` or `unavailable` in the filename are ignored
    /// so partial test fixtures and WIP rule drafts can sit alongside real ones.
    fn is_ignored_filename(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(str::to_lowercase)
            .is_some_and(|n| n.contains("template") || n.contains("unavailable"))
    }
}

impl RuleProvider for FsRuleProvider {
    fn load_all(&self) -> Result<Vec<Rule>> {
        if !self.dir.exists() {
            tracing::warn!(dir = ?self.dir, "rules directory does not exist, loading zero rules");
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| EngineError::internal(format!("could not read rules dir: {e}")))?;

        let mut rules = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| EngineError::internal(format!("bad rules dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if Self::is_ignored_filename(&path) {
                continue;
            }

            match load_rule_file(&path) {
                Ok(mut file_rules) => rules.append(&mut file_rules),
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "skipping unreadable rule file");
                }
            }
        }
        Ok(rules)
    }
}

fn load_rule_file(path: &Path) -> std::result::Result<Vec<Rule>, RuleLoadError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| RuleLoadError::Invalid { id: 0, message: e.to_string() })?;
    let raw_rules: Vec<RawRule> = serde_json::from_str(&contents)?;

    let mut rules = Vec::with_capacity(raw_rules.len());
    for raw in raw_rules {
        let id = raw.id;
        match Rule::normalize(raw) {
            Ok(rule) => rules.push(rule),
            Err(e) => tracing::warn!(rule_id = id, error = %e, "skipping invalid rule"),
        }
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_template_and_unavailable_filenames() {
        assert!(FsRuleProvider::is_ignored_filename(Path::new(
            "foo.template.json"
        )));
        assert!(FsRuleProvider::is_ignored_filename(Path::new(
            "bar-unavailable.json"
        )));
        assert!(!FsRuleProvider::is_ignored_filename(Path::new(
            "real-source.json"
        )));
    }

    #[test]
    fn missing_dir_yields_empty_rule_set() {
        let provider = FsRuleProvider::new("/definitely/not/a/real/dir");
        let rules = provider.load_all().unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn loads_and_normalizes_multiple_rules_from_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sources.json");
        std::fs::write(
            &file,
            serde_json::json!([
                {
                    "id": 1,
                    "name": "A",
                    "url": "https://a.example.com",
                    "search": {"url": "https://a.example.com/s?q=%s", "result": ".i", "title_selector": ".t", "link": ".t@href"},
                    "book": {"title_selector": "h1", "author_selector": ".a"},
                    "toc": {"selector": ".c a"},
                    "chapter": {"title_selector": "h1", "content_selector": ".content"},
                },
                {
                    "id": 0,
                    "name": "Bad",
                    "url": "https://b.example.com",
                    "search": {"url": "https://b.example.com/s?q={keyword}", "result": ".i", "title_selector": ".t", "link": ".t@href"},
                    "book": {"title_selector": "h1", "author_selector": ".a"},
                    "toc": {"selector": ".c a"},
                    "chapter": {"title_selector": "h1", "content_selector": ".content"},
                }
            ])
            .to_string(),
        )
        .unwrap();

        let provider = FsRuleProvider::new(dir.path());
        let rules = provider.load_all().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, 1);
    }
}
