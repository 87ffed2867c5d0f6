//! Batches chapter fetches against a [`SourceAdapter`], reporting progress
//! onto a [`DownloadTask`] as it goes. Grounded in the pack's
//! `rust_mdex_dl::downloader::download_images` (semaphore-bounded parallel
//! fetch with one handle per item), generalized from a fixed worker count to
//! batches of size K with a between-batch sleep, the politeness control this
//! crate's sources need that an image CDN does not.

use crate::source::SourceAdapter;
use crate::task::{CancelToken, TaskHandle};
use crate::toc::Chapter;
use rand::Rng;
use std::collections::VecDeque;
use std::time::Duration;

const MAX_CHAPTER_ATTEMPTS: u32 = 3;
const BATCH_SLEEP_MIN_MS: u64 = 1000;
const BATCH_SLEEP_MAX_MS: u64 = 3000;
const FAILURE_RATIO_THRESHOLD: f64 = 0.5;
/// A batch in which every fetch failed triples the per-chapter backoff used
/// by the next batch, easing off a source that looks fully down or blocking.
const BACKOFF_ESCALATION_FACTOR: f64 = 3.0;

pub struct FetchedChapter {
    pub order: u32,
    pub title: String,
    pub content: String,
    pub failed: bool,
}

/// Fetches every chapter in `chapters`, in batches of `batch_size`, updating
/// `task` after each completion. Returns the fetched content in `order`.
/// Returns `Err` only when cancelled or when more than half the chapters
/// ultimately failed.
pub async fn run(
    adapter: &SourceAdapter,
    chapters: Vec<Chapter>,
    batch_size: usize,
    task: &TaskHandle,
    cancel: &CancelToken,
) -> Result<Vec<FetchedChapter>, String> {
    let total = chapters.len();
    task.set_total_chapters(total as u32);

    let mut results: Vec<FetchedChapter> = Vec::with_capacity(total);
    let batch_size = batch_size.max(1);
    let mut backoff_multiplier = 1.0;

    for (batch_idx, batch) in chapters.chunks(batch_size).enumerate() {
        if cancel.is_cancelled() {
            return Err("cancelled".to_owned());
        }

        if batch_idx > 0 {
            let sleep_ms = rand::thread_rng().gen_range(BATCH_SLEEP_MIN_MS..BATCH_SLEEP_MAX_MS);
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }

        let mut handles = VecDeque::with_capacity(batch.len());
        for chapter in batch {
            let adapter = adapter.clone();
            let chapter = chapter.clone();
            handles.push_back(tokio::spawn(async move { fetch_one(&adapter, chapter, backoff_multiplier).await }));
        }

        let mut batch_results = Vec::with_capacity(batch.len());
        while let Some(handle) = handles.pop_front() {
            if cancel.is_cancelled() {
                handle.abort();
                for remaining in handles.drain(..) {
                    remaining.abort();
                }
                return Err("cancelled".to_owned());
            }
            let fetched = match handle.await {
                Ok(fetched) => fetched,
                Err(_) => FetchedChapter {
                    order: 0,
                    title: "Unknown".to_owned(),
                    content: "[chapter fetch task panicked]".to_owned(),
                    failed: true,
                },
            };

            if fetched.failed {
                task.increment_failed();
            } else {
                task.increment_completed();
            }
            task.set_current_chapter_title(&fetched.title);
            batch_results.push(fetched);
        }

        backoff_multiplier = if !batch_results.is_empty() && batch_results.iter().all(|f| f.failed) {
            backoff_multiplier * BACKOFF_ESCALATION_FACTOR
        } else {
            1.0
        };
        results.extend(batch_results);
    }

    results.sort_by_key(|f| f.order);

    let failed = results.iter().filter(|f| f.failed).count();
    if total > 0 && (failed as f64 / total as f64) > FAILURE_RATIO_THRESHOLD {
        return Err(format!("{failed}/{total} chapters failed"));
    }

    Ok(results)
}

async fn fetch_one(adapter: &SourceAdapter, chapter: Chapter, backoff_multiplier: f64) -> FetchedChapter {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match adapter.chapter(&chapter.url).await {
            Ok(content) => {
                return FetchedChapter {
                    order: chapter.order,
                    title: if content.title.is_empty() { chapter.title.clone() } else { content.title },
                    content: content.content,
                    failed: false,
                };
            }
            Err(e) if attempt >= MAX_CHAPTER_ATTEMPTS => {
                tracing::warn!(url = %chapter.url, attempt, error = %e, "chapter fetch failed permanently");
                return FetchedChapter {
                    order: chapter.order,
                    title: chapter.title,
                    content: format!("[failed to fetch this chapter: {e}]"),
                    failed: true,
                };
            }
            Err(e) => {
                tracing::debug!(url = %chapter.url, attempt, error = %e, "chapter fetch failed, retrying");
                let jitter: f64 = rand::thread_rng().gen_range(0.0..0.5);
                let secs = 2f64.powi(attempt as i32 - 1) * (1.0 + jitter) * backoff_multiplier;
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_respect_chunk_size() {
        let items: Vec<u32> = (0..25).collect();
        let batches: Vec<_> = items.chunks(10).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 5);
    }

    fn fake_results(failed_flags: &[bool]) -> Vec<FetchedChapter> {
        failed_flags
            .iter()
            .enumerate()
            .map(|(i, &failed)| FetchedChapter {
                order: i as u32,
                title: String::new(),
                content: String::new(),
                failed,
            })
            .collect()
    }

    #[test]
    fn all_failed_batch_triples_next_backoff() {
        let all_failed = fake_results(&[true, true, true]);
        let next_multiplier =
            if !all_failed.is_empty() && all_failed.iter().all(|f| f.failed) { 1.0 * BACKOFF_ESCALATION_FACTOR } else { 1.0 };
        assert_eq!(next_multiplier, 3.0);
    }

    #[test]
    fn partial_failure_resets_backoff() {
        let mixed = fake_results(&[true, false, true]);
        let next_multiplier = if !mixed.is_empty() && mixed.iter().all(|f| f.failed) { 3.0 } else { 1.0 };
        assert_eq!(next_multiplier, 1.0);
    }
}
