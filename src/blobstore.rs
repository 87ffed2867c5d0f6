//! Blob store: a narrow filesystem trait over
//! `downloads/` (final artifacts) and `cache/` (disk cache tier), grounded in
//! the teacher's `cache.rs`/`updater/native/cache.rs` read/write-to-`~/.cache`
//! pattern but generalized to an injected root directory instead of
//! `dirs::home_dir()`, so tests can point it at a temp dir.

use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Clone)]
pub struct BlobStore {
    cache_dir: PathBuf,
    downloads_dir: PathBuf,
}

impl BlobStore {
    pub fn new(cache_dir: impl Into<PathBuf>, downloads_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let downloads_dir = downloads_dir.into();
        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| EngineError::internal(format!("could not create cache dir: {e}")))?;
        std::fs::create_dir_all(&downloads_dir)
            .map_err(|e| EngineError::internal(format!("could not create downloads dir: {e}")))?;
        Ok(Self {
            cache_dir,
            downloads_dir,
        })
    }

    #[must_use]
    pub fn cache_path(&self, hashed_key: &str) -> PathBuf {
        self.cache_dir.join(hashed_key)
    }

    #[must_use]
    pub fn cache_meta_path(&self, hashed_key: &str) -> PathBuf {
        self.cache_dir.join(format!("{hashed_key}.meta"))
    }

    /// The path a final artifact with this filename would live at
    /// (`downloads/{sanitize(title)}_{sanitize(author)}.{ext}`).
    #[must_use]
    pub fn download_path(&self, filename: &str) -> PathBuf {
        self.downloads_dir.join(filename)
    }

    pub fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::internal(format!("could not create dir: {e}")))?;
        }
        std::fs::write(path, bytes)
            .map_err(|e| EngineError::internal(format!("could not write {path:?}: {e}")))
    }

    pub fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read(path)
            .map(Some)
            .map_err(|e| EngineError::internal(format!("could not read {path:?}: {e}")))
    }

    #[must_use]
    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// File size, used by the Task Registry's "fully materialized" check.
    #[must_use]
    pub fn size(&self, path: &Path) -> Option<u64> {
        std::fs::metadata(path).ok().map(|m| m.len())
    }

    #[must_use]
    pub fn modified(&self, path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
    }

    /// Removes every file directly under the cache dir, returning the count
    /// removed. Used by `POST /cache/clear`.
    pub fn clear_cache_dir(&self) -> Result<usize> {
        let mut cleared = 0;
        let entries = std::fs::read_dir(&self.cache_dir)
            .map_err(|e| EngineError::internal(format!("could not read cache dir: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::internal(format!("bad cache dir entry: {e}")))?;
            let path = entry.path();
            if path.is_file() && std::fs::remove_file(&path).is_ok() {
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

/// Replaces any character in `\ / : * ? " < > |` with `_`; an empty result
/// defaults to `_`.
#[must_use]
pub fn sanitize(component: &str) -> String {
    const FORBIDDEN: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
    let sanitized: String = component
        .chars()
        .map(|c| if FORBIDDEN.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        "_".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_forbidden_characters() {
        assert_eq!(sanitize("Tales: Of / Fire?"), "Tales_ Of _ Fire_");
    }

    #[test]
    fn sanitize_empty_defaults_to_underscore() {
        assert_eq!(sanitize("   "), "_");
        assert_eq!(sanitize("///"), "___");
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("cache"), dir.path().join("downloads")).unwrap();
        let path = store.download_path("book_author.txt");
        store.write(&path, b"hello world").unwrap();
        assert_eq!(store.read(&path).unwrap().unwrap(), b"hello world");
        assert_eq!(store.size(&path), Some(11));
    }
}
