//! Core aggregation and download engine for web novel sources.
//!
//! The crate is organized leaf-first, the way the components are listed in
//! the design doc: HTTP client pool and selector engine at the bottom, the
//! task registry and REST façade at the top. Everything above the rule model
//! treats a [`rule::Rule`] as the only thing that varies between sources.

pub mod aggregator;
pub mod api;
pub mod assemble;
pub mod blobstore;
pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod html;
pub mod http;
pub mod logging;
pub mod rule;
pub mod source;
pub mod task;
pub mod toc;

pub use error::{EngineError, Result};

/// Wires every component together behind the shared handles the REST façade needs.
///
/// Constructed once at startup (see `main.rs`); cheap to clone, since every
/// field is itself a cheap-to-clone handle (`Arc`-backed or `Clone` by value).
#[derive(Clone)]
pub struct AppState {
    pub config: std::sync::Arc<config::Config>,
    pub sources: source::SourceRegistry,
    pub cache: cache::Cache,
    pub http: http::HttpClientPool,
    pub tasks: task::TaskRegistry,
    pub blobs: blobstore::BlobStore,
    pub epub_writer: std::sync::Arc<dyn assemble::epub_writer::EpubWriter + Send + Sync>,
}

impl AppState {
    /// Builds the full dependency graph from a loaded [`config::Config`].
    ///
    /// Mirrors the shutdown order in reverse: cache first (innermost
    /// dependency), then the HTTP pool, then the sources that bind to both,
    /// then the task registry that drives them all.
    pub async fn new(config: config::Config) -> Result<Self> {
        let config = std::sync::Arc::new(config);
        let blobs = blobstore::BlobStore::new(&config.cache_dir, &config.downloads_dir)?;
        let cache = cache::Cache::new(blobs.clone());
        let http = http::HttpClientPool::new(config.http_concurrency);
        let rules = rule::provider::FsRuleProvider::new(&config.rules_dir).load_all()?;
        let sources = source::SourceRegistry::new(rules, http.clone(), cache.clone());
        let tasks = task::TaskRegistry::new();
        let epub_writer: std::sync::Arc<dyn assemble::epub_writer::EpubWriter + Send + Sync> =
            std::sync::Arc::new(assemble::epub_writer::ZipEpubWriter);

        Ok(Self {
            config,
            sources,
            cache,
            http,
            tasks,
            blobs,
            epub_writer,
        })
    }
}
