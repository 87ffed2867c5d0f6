//! Route handlers. Thin: each one validates the boundary inputs §8 calls
//! out (empty keyword, `maxResults` clamp/reject) and otherwise delegates
//! straight to the Aggregator / Source Adapter / TOC Normalizer / Download
//! Orchestrator / Task Registry, wrapping the result in [`Envelope`].
//!
//! Grounded in the pack's `bookle-server` handler idiom (`State<AppState>` +
//! typed query/json extractors, `Result<impl IntoResponse, EngineError>`
//! return type) and `ting-reader`'s split of DTOs out of the handler file.

use super::dto::{
    CacheClearResponseDto, ChapterDto, DetailQuery, DownloadQuery, Envelope, HealthDto, HealthMetricsDto,
    ResultPendingDto, SearchQuery, SourceSummaryDto, StartDownloadBody, StartDownloadResponse, TaskIdQuery,
    TaskSnapshotDto, TocQuery,
};
use crate::aggregator::{self, AggregatedSearch};
use crate::assemble::{self, AssembleInput};
use crate::cache::{CacheKey, SEARCH_TTL};
use crate::download;
use crate::error::{EngineError, Result};
use crate::task::{CancelToken, Format, ResultOutcome, TaskHandle};
use crate::toc;
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::path::Path;
use std::time::Instant;
use uuid::Uuid;

const MIN_MAX_RESULTS: u32 = 1;
const MAX_MAX_RESULTS: u32 = 100;

pub async fn search(State(state): State<AppState>, Query(query): Query<SearchQuery>) -> Result<Response> {
    let keyword = query.keyword.trim();
    if keyword.is_empty() {
        return Err(EngineError::input("keyword must not be empty"));
    }
    let max_results = match query.max_results {
        None => state.config.max_results_default,
        Some(n) if n < MIN_MAX_RESULTS => {
            return Err(EngineError::input("maxResults must be at least 1"));
        }
        Some(n) => n.min(MAX_MAX_RESULTS),
    };

    let started = Instant::now();
    let cache_key = CacheKey::search(0, &format!("agg:{keyword}:{max_results}"));

    let (aggregated, cached) = match state.cache.get(&cache_key).await {
        Some(bytes) => match serde_json::from_slice::<AggregatedSearch>(&bytes) {
            Ok(aggregated) => (aggregated, true),
            Err(_) => (
                run_search(&state, keyword, max_results, &cache_key).await,
                false,
            ),
        },
        None => (run_search(&state, keyword, max_results, &cache_key).await, false),
    };

    let duration_ms = started.elapsed().as_millis();
    let total_results = aggregated.hits.len();
    let envelope = Envelope::ok_with_meta(
        aggregated.hits,
        json!({
            "durationMs": duration_ms,
            "cached": cached,
            "totalResults": total_results,
            "sourceErrors": aggregated.errors,
        }),
    );
    Ok(Json(envelope).into_response())
}

async fn run_search(state: &AppState, keyword: &str, max_results: u32, cache_key: &CacheKey) -> AggregatedSearch {
    let deadline = std::time::Duration::from_millis(state.config.search_deadline_ms);
    let per_source_timeout = std::time::Duration::from_millis(state.config.per_source_timeout_ms);
    let aggregated = aggregator::search_all(&state.sources, keyword, deadline, per_source_timeout, max_results).await;
    if let Ok(bytes) = serde_json::to_vec(&aggregated) {
        state.cache.put(cache_key, bytes.into(), SEARCH_TTL).await;
    }
    aggregated
}

pub async fn detail(State(state): State<AppState>, Query(query): Query<DetailQuery>) -> Result<Response> {
    let started = Instant::now();
    let adapter = state.sources.get_or_err(query.source_id)?;
    let detail = adapter.detail(&query.url).await?;
    let duration_ms = started.elapsed().as_millis();
    let envelope = Envelope::ok_with_meta(detail, json!({"durationMs": duration_ms, "sourceId": query.source_id}));
    Ok(Json(envelope).into_response())
}

pub async fn toc(State(state): State<AppState>, Query(query): Query<TocQuery>) -> Result<Response> {
    let started = Instant::now();
    let adapter = state.sources.get_or_err(query.source_id)?;
    let raw = adapter.toc(&query.url).await?;
    let chapters = toc::normalize(raw);
    if chapters.is_empty() {
        return Err(EngineError::Parse {
            what: "toc has no valid chapters".to_owned(),
            url: query.url,
        });
    }
    let duration_ms = started.elapsed().as_millis();
    let total_chapters = chapters.len();
    let data: Vec<ChapterDto> = chapters.iter().map(ChapterDto::from).collect();
    let envelope = Envelope::ok_with_meta(data, json!({"durationMs": duration_ms, "totalChapters": total_chapters}));
    Ok(Json(envelope).into_response())
}

pub async fn download(State(state): State<AppState>, Query(query): Query<DownloadQuery>) -> Result<Response> {
    let DownloadQuery { url, source_id, format } = query;
    let format: Format = format.into();
    let started = Instant::now();

    let (task_id, handle) = state.tasks.submit(url.clone(), source_id, format);
    run_download_task(state.clone(), task_id, handle, url, source_id, format).await;

    // `run_download_task` only returns once the task is terminal; the one
    // exception is the "fully materialized" check on a freshly-written
    // artifact, which can briefly report `Running` right after the file is
    // written. A handful of short retries absorb that without looping forever.
    const MATERIALIZATION_RETRIES: u32 = 10;
    for _ in 0..MATERIALIZATION_RETRIES {
        match state.tasks.result(task_id).await {
            ResultOutcome::Ready(path) => {
                return artifact_response(&state, task_id, &path, started.elapsed().as_millis(), format).await;
            }
            ResultOutcome::Failed(reason) => return Err(EngineError::internal(reason)),
            ResultOutcome::NotFound => return Err(EngineError::NotFound { what: "task".to_owned() }),
            ResultOutcome::Running => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
        }
    }
    Err(EngineError::internal("artifact did not stabilize in time"))
}

pub async fn download_start(
    State(state): State<AppState>,
    Json(body): Json<StartDownloadBody>,
) -> Result<Response> {
    let format: Format = body.format.into();
    let (task_id, handle) = state.tasks.submit(body.url.clone(), body.source_id, format);

    let worker_state = state.clone();
    let worker_url = body.url;
    let worker_source_id = body.source_id;
    tokio::spawn(async move {
        run_download_task(worker_state, task_id, handle, worker_url, worker_source_id, format).await;
    });

    let envelope = Envelope::accepted(StartDownloadResponse { task_id });
    Ok((StatusCode::ACCEPTED, Json(envelope)).into_response())
}

pub async fn download_progress(
    State(state): State<AppState>,
    Query(query): Query<TaskIdQuery>,
) -> Result<Response> {
    let snapshot = state
        .tasks
        .progress(query.task_id)
        .ok_or_else(|| EngineError::NotFound { what: "task".to_owned() })?;
    let dto: TaskSnapshotDto = snapshot.into();
    Ok(Json(Envelope::ok(dto)).into_response())
}

pub async fn download_result(
    State(state): State<AppState>,
    Query(query): Query<TaskIdQuery>,
) -> Result<Response> {
    match state.tasks.result(query.task_id).await {
        ResultOutcome::Ready(path) => {
            let format = state
                .tasks
                .progress(query.task_id)
                .map(|s| s.format)
                .unwrap_or(Format::Epub);
            artifact_response(&state, query.task_id, &path, 0, format).await
        }
        ResultOutcome::Failed(reason) => {
            let progress_percentage = progress_percentage(&state, query.task_id);
            Ok(Json(json!({"status": "FAILED", "progress_percentage": progress_percentage, "error": reason}))
                .into_response())
        }
        ResultOutcome::Running => {
            let progress_percentage = progress_percentage(&state, query.task_id);
            Ok(Json(ResultPendingDto { status: "running", progress_percentage }).into_response())
        }
        ResultOutcome::NotFound => Err(EngineError::NotFound { what: "task".to_owned() }),
    }
}

fn progress_percentage(state: &AppState, task_id: Uuid) -> f64 {
    let Some(snapshot) = state.tasks.progress(task_id) else {
        return 0.0;
    };
    let done = snapshot.completed_chapters + snapshot.failed_chapters;
    if snapshot.total_chapters == 0 {
        0.0
    } else {
        100.0 * f64::from(done) / f64::from(snapshot.total_chapters)
    }
}

pub async fn sources(State(state): State<AppState>) -> Response {
    let data: Vec<SourceSummaryDto> = state
        .sources
        .enabled()
        .map(|adapter| SourceSummaryDto {
            id: adapter.rule().id,
            name: adapter.rule().name.clone(),
            base_url: adapter.rule().base_url.clone(),
            enabled: adapter.rule().enabled,
        })
        .collect();
    Json(Envelope::ok(data)).into_response()
}

pub async fn health(State(state): State<AppState>) -> Response {
    let enabled_sources = state.sources.len();
    let active_tasks = state.tasks.len();
    let status = if enabled_sources > 0 { "ok" } else { "degraded" };
    let health_score = if enabled_sources > 0 { 1.0 } else { 0.0 };
    let dto = HealthDto {
        status,
        health_score,
        metrics: HealthMetricsDto { enabled_sources, active_tasks },
    };
    Json(Envelope::ok(dto)).into_response()
}

pub async fn cache_clear(State(state): State<AppState>) -> Response {
    let cleared = state.cache.clear().await;
    Json(Envelope::ok(CacheClearResponseDto { cleared })).into_response()
}

/// Drives a download task through every transition from `PENDING` to a
/// terminal state. Shared by the synchronous `/download` handler (awaited
/// inline) and `/download/start` (spawned in the background).
async fn run_download_task(
    state: AppState,
    _task_id: Uuid,
    handle: TaskHandle,
    detail_url: String,
    source_id: u32,
    format: Format,
) {
    let adapter = match state.sources.get_or_err(source_id) {
        Ok(adapter) => adapter.clone(),
        Err(e) => {
            handle.fail(e.to_string());
            return;
        }
    };

    handle.transition(crate::task::State::FetchingMeta);
    let detail = match adapter.detail(&detail_url).await {
        Ok(detail) => detail,
        Err(e) => {
            handle.fail(e.to_string());
            return;
        }
    };

    let raw_toc = match adapter.toc(&detail_url).await {
        Ok(raw_toc) => raw_toc,
        Err(e) => {
            handle.fail(e.to_string());
            return;
        }
    };
    let chapters = toc::normalize(raw_toc);
    if chapters.is_empty() {
        handle.fail("toc has no valid chapters");
        return;
    }

    handle.transition(crate::task::State::FetchingChapters);
    let cancel: CancelToken = handle.cancel_token();
    let fetched = match download::run(&adapter, chapters, state.config.download_batch_size, &handle, &cancel).await {
        Ok(fetched) => fetched,
        Err(e) => {
            handle.fail(e);
            return;
        }
    };

    handle.transition(crate::task::State::Assembling);
    let input = AssembleInput {
        title: &detail.title,
        author: &detail.author,
        source_url: &detail_url,
        cover_url: detail.cover.as_deref(),
        chapters: &fetched,
    };
    match assemble::assemble(input, format, &state.blobs, &state.epub_writer).await {
        Ok(path) => {
            handle.set_artifact_path(path);
            handle.transition(crate::task::State::Ready);
        }
        Err(e) => handle.fail(e.to_string()),
    }
}

async fn artifact_response(
    state: &AppState,
    task_id: Uuid,
    path: &Path,
    duration_ms: u128,
    format: Format,
) -> Result<Response> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| EngineError::internal(format!("could not read artifact {path:?}: {e}")))?;
    let file_size = bytes.len();
    let filename = filename_of(path);
    let content_type = match format {
        Format::Txt => "text/plain; charset=utf-8",
        Format::Epub => "application/epub+zip",
    };

    let mut response = (StatusCode::OK, bytes::Bytes::from(bytes)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename*=UTF-8''{}", percent_encode(&filename)))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    headers.insert("X-Task-ID", HeaderValue::from_str(&task_id.to_string()).unwrap_or_else(|_| HeaderValue::from_static("")));
    headers.insert("X-File-Size", HeaderValue::from(file_size as u64));
    headers.insert("X-Download-Duration-MS", HeaderValue::from(u64::try_from(duration_ms).unwrap_or(u64::MAX)));
    Ok(response)
}

fn filename_of(path: &Path) -> String {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("artifact").to_owned()
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(*byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encode_escapes_non_ascii_safe_chars() {
        assert_eq!(percent_encode("Tale of Fire.epub"), "Tale%20of%20Fire.epub");
    }

    #[test]
    fn filename_of_extracts_the_last_path_component() {
        let path = Path::new("/tmp/downloads/book_author.epub");
        assert_eq!(filename_of(path), "book_author.epub");
    }
}
