//! Cache Layer: two-tier (memory LRU + on-disk) TTL'd blob cache
//! with per-key in-flight coalescing.
//!
//! Grounded in the teacher's `cache.rs`/`updater/native/cache.rs`
//! read/write-to-disk pattern, with an LRU front tier and TTL sidecars added
//! (the teacher's cache never expired — it was keyed by book id for a single
//! user's library, not shared across concurrent readers).

use crate::blobstore::BlobStore;
use crate::error::Result;
use bytes::Bytes;
use lru::LruCache;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, OnceCell};

pub const SEARCH_TTL: Duration = Duration::from_secs(30 * 60);
pub const DETAIL_TTL: Duration = Duration::from_secs(2 * 60 * 60);
pub const TOC_TTL: Duration = Duration::from_secs(2 * 60 * 60);
pub const CHAPTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Minimum accepted length, in bytes, for a cached chapter body to be served
/// Below this a cached chapter body is treated as a miss rather than served.
/// 200 bytes is short enough not to reject a genuinely
/// short chapter but long enough to catch a truncated read (an empty body or
/// a bare error page).
pub const MIN_CHAPTER_VALID_LEN: usize = 200;

const MEMORY_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Search { source_id: u32, keyword: String },
    Detail { url: String },
    Toc { url: String },
    Chapter { url: String },
}

impl CacheKey {
    #[must_use]
    pub fn search(source_id: u32, keyword: &str) -> Self {
        Self::Search {
            source_id,
            keyword: normalize_keyword(keyword),
        }
    }

    #[must_use]
    pub fn detail(url: &str) -> Self {
        Self::Detail { url: url.to_owned() }
    }

    #[must_use]
    pub fn toc(url: &str) -> Self {
        Self::Toc { url: url.to_owned() }
    }

    #[must_use]
    pub fn chapter(url: &str) -> Self {
        Self::Chapter { url: url.to_owned() }
    }

    fn as_string(&self) -> String {
        match self {
            Self::Search { source_id, keyword } => format!("search:{source_id}:{keyword}"),
            Self::Detail { url } => format!("detail:{url}"),
            Self::Toc { url } => format!("toc:{url}"),
            Self::Chapter { url } => format!("chapter:{url}"),
        }
    }

    fn is_chapter(&self) -> bool {
        matches!(self, Self::Chapter { .. })
    }

    fn hashed(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.as_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[must_use]
pub fn normalize_keyword(keyword: &str) -> String {
    keyword.trim().to_lowercase()
}

struct MemoryEntry {
    bytes: Bytes,
    inserted_at: SystemTime,
    ttl: Duration,
}

struct Inner {
    memory: Mutex<LruCache<String, MemoryEntry>>,
    blobs: BlobStore,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<Result<Bytes>>>>>,
}

#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl Cache {
    #[must_use]
    pub fn new(blobs: BlobStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                memory: Mutex::new(LruCache::new(
                    NonZeroUsize::new(MEMORY_CAPACITY).unwrap_or(NonZeroUsize::MIN),
                )),
                blobs,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns a cached value only if both tiers' entries are unexpired, and
    /// (for chapter keys) long enough to pass the minimum-validity check.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let string_key = key.as_string();

        if let Some(bytes) = self.get_from_memory(&string_key).await {
            if self.accept(key, &bytes) {
                return Some(bytes);
            }
            return None;
        }

        let bytes = self.get_from_disk(key)?;
        if !self.accept(key, &bytes) {
            return None;
        }
        self.put_memory(string_key, bytes.clone(), ttl_for(key)).await;
        Some(bytes)
    }

    fn accept(&self, key: &CacheKey, bytes: &Bytes) -> bool {
        !key.is_chapter() || bytes.len() >= MIN_CHAPTER_VALID_LEN
    }

    async fn get_from_memory(&self, string_key: &str) -> Option<Bytes> {
        let mut memory = self.inner.memory.lock().await;
        let entry = memory.get(string_key)?;
        if is_expired(entry.inserted_at, entry.ttl) {
            memory.pop(string_key);
            return None;
        }
        Some(entry.bytes.clone())
    }

    fn get_from_disk(&self, key: &CacheKey) -> Option<Bytes> {
        let hashed = key.hashed();
        let meta_path = self.inner.blobs.cache_meta_path(&hashed);
        let meta = self.inner.blobs.read(&meta_path).ok()??;
        let (inserted_at, ttl) = parse_meta(&meta)?;
        if is_expired(inserted_at, ttl) {
            return None;
        }
        let data_path = self.inner.blobs.cache_path(&hashed);
        self.inner.blobs.read(&data_path).ok()?.map(Bytes::from)
    }

    pub async fn put(&self, key: &CacheKey, value: Bytes, ttl: Duration) {
        let string_key = key.as_string();
        self.put_memory(string_key, value.clone(), ttl).await;
        self.put_disk(key, &value, ttl);
    }

    async fn put_memory(&self, string_key: String, value: Bytes, ttl: Duration) {
        let mut memory = self.inner.memory.lock().await;
        memory.put(
            string_key,
            MemoryEntry {
                bytes: value,
                inserted_at: SystemTime::now(),
                ttl,
            },
        );
    }

    fn put_disk(&self, key: &CacheKey, value: &Bytes, ttl: Duration) {
        let hashed = key.hashed();
        let data_path = self.inner.blobs.cache_path(&hashed);
        let meta_path = self.inner.blobs.cache_meta_path(&hashed);
        let _ = self.inner.blobs.write(&data_path, value);
        let _ = self.inner.blobs.write(&meta_path, format_meta(SystemTime::now(), ttl).as_bytes());
    }

    /// Cache-consulted, cache-populated fetch with single-flight coalescing:
    /// concurrent callers for the same key share one upstream fetch (spec
    /// §4.3, §8 scenario 5).
    pub async fn get_or_fetch<F, Fut>(&self, key: CacheKey, ttl: Duration, fetch: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        if let Some(cached) = self.get(&key).await {
            return Ok(cached);
        }

        let string_key = key.as_string();
        let cell = {
            let mut in_flight = self.inner.in_flight.lock().await;
            in_flight
                .entry(string_key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell.get_or_try_init(fetch).await.cloned();

        {
            let mut in_flight = self.inner.in_flight.lock().await;
            in_flight.remove(&string_key);
        }

        if let Ok(ref bytes) = result {
            self.put(&key, bytes.clone(), ttl).await;
        }
        result
    }

    /// Empties both tiers, returning the number of entries cleared (memory
    /// entries plus disk files). `POST /cache/clear`'s only job.
    pub async fn clear(&self) -> usize {
        let memory_cleared = {
            let mut memory = self.inner.memory.lock().await;
            let len = memory.len();
            memory.clear();
            len
        };
        let disk_cleared = self.inner.blobs.clear_cache_dir().unwrap_or(0);
        memory_cleared + disk_cleared
    }
}

fn ttl_for(key: &CacheKey) -> Duration {
    match key {
        CacheKey::Search { .. } => SEARCH_TTL,
        CacheKey::Detail { .. } => DETAIL_TTL,
        CacheKey::Toc { .. } => TOC_TTL,
        CacheKey::Chapter { .. } => CHAPTER_TTL,
    }
}

fn is_expired(inserted_at: SystemTime, ttl: Duration) -> bool {
    SystemTime::now()
        .duration_since(inserted_at)
        .map(|elapsed| elapsed > ttl)
        .unwrap_or(false)
}

fn format_meta(inserted_at: SystemTime, ttl: Duration) -> String {
    let epoch = inserted_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{epoch}:{}", ttl.as_secs())
}

fn parse_meta(bytes: &[u8]) -> Option<(SystemTime, Duration)> {
    let text = std::str::from_utf8(bytes).ok()?;
    let (epoch, ttl_secs) = text.split_once(':')?;
    let epoch: u64 = epoch.parse().ok()?;
    let ttl_secs: u64 = ttl_secs.parse().ok()?;
    Some((UNIX_EPOCH + Duration::from_secs(epoch), Duration::from_secs(ttl_secs)))
}

/// Tiny `hex` shim so the cache doesn't need a separate dependency purely for
/// encoding a 20-byte digest.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_cache() -> (Cache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let blobs =
            BlobStore::new(dir.path().join("cache"), dir.path().join("downloads")).unwrap();
        (Cache::new(blobs), dir)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (cache, _dir) = test_cache();
        let key = CacheKey::detail("https://example.com/book/1");
        cache.put(&key, Bytes::from_static(b"hello"), DETAIL_TTL).await;
        assert_eq!(cache.get(&key).await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn expired_entry_is_not_served() {
        let (cache, _dir) = test_cache();
        let key = CacheKey::toc("https://example.com/book/1/toc");
        cache
            .put(&key, Bytes::from_static(b"stale"), Duration::from_secs(0))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn short_chapter_body_fails_minimum_validity_check() {
        let (cache, _dir) = test_cache();
        let key = CacheKey::chapter("https://example.com/c/1");
        cache.put(&key, Bytes::from_static(b"too short"), CHAPTER_TTL).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_fetch() {
        let (cache, _dir) = test_cache();
        let key = CacheKey::chapter("https://example.com/c/42");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let key = key.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(key, CHAPTER_TTL, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Bytes::from(vec![b'x'; 256]))
                    })
                    .await
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
