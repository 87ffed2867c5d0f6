//! Binds a [`crate::rule::Rule`] to the HTTP pool, the selector engine, and
//! the cache, exposing `search`/`detail`/`toc`/`chapter` as the four
//! operations everything above this layer calls. Grounded in the teacher's
//! `source::royalroad::RoyalRoad` (one hardcoded host behind a fixed trait),
//! generalized to data-driven rules instead of one struct per website.

pub mod adapter;

pub use adapter::{ChapterContent, NovelDetail, NovelHit, RawTocEntry, SourceAdapter};

use crate::cache::Cache;
use crate::error::{EngineError, Result};
use crate::http::HttpClientPool;
use crate::rule::Rule;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable registry of every enabled source, built once at startup.
#[derive(Clone)]
pub struct SourceRegistry {
    adapters: Arc<HashMap<u32, SourceAdapter>>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new(rules: Vec<Rule>, http: HttpClientPool, cache: Cache) -> Self {
        let adapters = rules
            .into_iter()
            .filter(|rule| rule.enabled)
            .map(|rule| (rule.id, SourceAdapter::new(rule, http.clone(), cache.clone())))
            .collect();
        Self {
            adapters: Arc::new(adapters),
        }
    }

    #[must_use]
    pub fn get(&self, source_id: u32) -> Option<&SourceAdapter> {
        self.adapters.get(&source_id)
    }

    pub fn get_or_err(&self, source_id: u32) -> Result<&SourceAdapter> {
        self.get(source_id).ok_or_else(|| EngineError::SourceUnknown {
            source_id: source_id.to_string(),
        })
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceAdapter> {
        self.adapters.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
