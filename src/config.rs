//! Typed startup configuration: an optional `config.toml` plus `NOVEL_`-prefixed
//! environment overrides, loaded once at process start.
//!
//! Grounded in the shape of the pack's `rust_mdex_dl::config` loader: missing
//! file falls back to defaults rather than refusing to start, malformed file
//! is a startup error, never a panic.

use crate::error::{EngineError, Result};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: String,
    pub rules_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub http_concurrency: usize,
    pub download_batch_size: usize,
    pub search_deadline_ms: u64,
    pub per_source_timeout_ms: u64,
    pub max_results_default: u32,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_owned(),
            rules_dir: PathBuf::from("rules"),
            cache_dir: default_cache_dir(),
            downloads_dir: default_downloads_dir(),
            http_concurrency: 5,
            download_batch_size: 10,
            search_deadline_ms: 15_000,
            per_source_timeout_ms: 15_000,
            max_results_default: 30,
            log_filter: "info".to_owned(),
        }
    }
}

/// Falls back to the user's platform cache dir (like the teacher's own
/// `dirs::home_dir()`-rooted cache) when nothing more specific is configured;
/// a relative `cache/` is used only if the platform has no such directory.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("novel-aggregator"))
        .unwrap_or_else(|| PathBuf::from("cache"))
}

fn default_downloads_dir() -> PathBuf {
    dirs::download_dir()
        .map(|d| d.join("novel-aggregator"))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

impl Config {
    /// Loads `path` if it exists, falls back to defaults otherwise, then
    /// applies any `NOVEL_*` environment variable overrides on top.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                EngineError::internal(format!("could not read config file {path:?}: {e}"))
            })?;
            toml::de::from_str(&raw)
                .map_err(|e| EngineError::internal(format!("invalid config file {path:?}: {e}")))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NOVEL_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("NOVEL_RULES_DIR") {
            self.rules_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NOVEL_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NOVEL_DOWNLOADS_DIR") {
            self.downloads_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NOVEL_HTTP_CONCURRENCY").and_then(|s| {
            s.parse().map_err(|_| std::env::VarError::NotPresent)
        }) {
            self.http_concurrency = v;
        }
        if let Ok(v) = std::env::var("NOVEL_DOWNLOAD_BATCH_SIZE").and_then(|s| {
            s.parse().map_err(|_| std::env::VarError::NotPresent)
        }) {
            self.download_batch_size = v;
        }
        if let Ok(v) = std::env::var("NOVEL_LOG_FILTER") {
            self.log_filter = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(std::path::Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.http_concurrency, 5);
    }
}
