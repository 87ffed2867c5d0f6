//! Request/response shapes for the REST façade.
//!
//! Grounded in the pack's axum handler examples (`bookle-server`'s separate
//! DTO structs with `From<Domain>` conversions, `ting-reader`'s
//! `api::models` split), generalized to a single response envelope shared by
//! every route instead of one ad hoc shape per handler.

use crate::task::{Format, State, TaskSnapshot};
use crate::toc::Chapter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The global response envelope every route returns (§6/§7).
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            message: "ok".to_owned(),
            data: Some(data),
            meta: None,
        }
    }

    #[must_use]
    pub fn ok_with_meta(data: T, meta: serde_json::Value) -> Self {
        Self {
            code: 200,
            message: "ok".to_owned(),
            data: Some(data),
            meta: Some(meta),
        }
    }

    #[must_use]
    pub fn accepted(data: T) -> Self {
        Self {
            code: 202,
            message: "accepted".to_owned(),
            data: Some(data),
            meta: None,
        }
    }
}

impl Envelope<()> {
    #[must_use]
    pub fn error(code: u16, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
            meta: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub keyword: String,
    #[serde(rename = "maxResults", default)]
    pub max_results: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DetailQuery {
    pub url: String,
    #[serde(rename = "sourceId")]
    pub source_id: u32,
}

#[derive(Debug, Deserialize)]
pub struct TocQuery {
    pub url: String,
    #[serde(rename = "sourceId")]
    pub source_id: u32,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub url: String,
    #[serde(rename = "sourceId")]
    pub source_id: u32,
    pub format: FormatParam,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatParam {
    Txt,
    Epub,
}

impl From<FormatParam> for Format {
    fn from(value: FormatParam) -> Self {
        match value {
            FormatParam::Txt => Self::Txt,
            FormatParam::Epub => Self::Epub,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartDownloadBody {
    pub url: String,
    #[serde(rename = "sourceId")]
    pub source_id: u32,
    pub format: FormatParam,
}

#[derive(Debug, Serialize)]
pub struct StartDownloadResponse {
    pub task_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct TaskIdQuery {
    pub task_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ChapterDto {
    pub title: String,
    pub url: String,
    pub order: u32,
}

impl From<&Chapter> for ChapterDto {
    fn from(chapter: &Chapter) -> Self {
        Self {
            title: chapter.title.clone(),
            url: chapter.url.clone(),
            order: chapter.order,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskSnapshotDto {
    pub task_id: Uuid,
    pub detail_url: String,
    pub source_id: u32,
    pub format: &'static str,
    pub state: &'static str,
    pub total_chapters: u32,
    pub completed_chapters: u32,
    pub failed_chapters: u32,
    pub current_chapter_title: Option<String>,
    pub progress_percentage: f64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<TaskSnapshot> for TaskSnapshotDto {
    fn from(snapshot: TaskSnapshot) -> Self {
        let done = snapshot.completed_chapters + snapshot.failed_chapters;
        let progress_percentage = if snapshot.total_chapters == 0 {
            0.0
        } else {
            100.0 * f64::from(done) / f64::from(snapshot.total_chapters)
        };
        Self {
            task_id: snapshot.task_id,
            detail_url: snapshot.detail_url,
            source_id: snapshot.source_id,
            format: format_name(snapshot.format),
            state: state_name(snapshot.state),
            total_chapters: snapshot.total_chapters,
            completed_chapters: snapshot.completed_chapters,
            failed_chapters: snapshot.failed_chapters,
            current_chapter_title: snapshot.current_chapter_title,
            progress_percentage,
            started_at: DateTime::<Utc>::from(snapshot.started_at),
            finished_at: snapshot.finished_at.map(DateTime::<Utc>::from),
            error: snapshot.error,
        }
    }
}

#[must_use]
pub fn format_name(format: Format) -> &'static str {
    match format {
        Format::Txt => "txt",
        Format::Epub => "epub",
    }
}

#[must_use]
pub fn state_name(state: State) -> &'static str {
    match state {
        State::Pending => "PENDING",
        State::FetchingMeta => "FETCHING_META",
        State::FetchingChapters => "FETCHING_CHAPTERS",
        State::Assembling => "ASSEMBLING",
        State::Ready => "READY",
        State::Failed => "FAILED",
    }
}

#[derive(Debug, Serialize)]
pub struct ResultPendingDto {
    pub status: &'static str,
    pub progress_percentage: f64,
}

#[derive(Debug, Serialize)]
pub struct SourceSummaryDto {
    pub id: u32,
    pub name: String,
    pub base_url: String,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthDto {
    pub status: &'static str,
    pub health_score: f64,
    pub metrics: HealthMetricsDto,
}

#[derive(Debug, Serialize)]
pub struct HealthMetricsDto {
    pub enabled_sources: usize,
    pub active_tasks: usize,
}

#[derive(Debug, Serialize)]
pub struct CacheClearResponseDto {
    pub cleared: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_has_no_data_or_meta() {
        let envelope = Envelope::<()>::error(404, "not found".to_owned());
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["code"], 404);
        assert!(json.get("data").is_none());
        assert!(json.get("meta").is_none());
    }

    #[test]
    fn task_snapshot_dto_computes_progress_percentage() {
        let snapshot = TaskSnapshot {
            task_id: Uuid::nil(),
            detail_url: "https://x.example.com".to_owned(),
            source_id: 1,
            format: Format::Epub,
            state: State::FetchingChapters,
            total_chapters: 10,
            completed_chapters: 4,
            failed_chapters: 1,
            current_chapter_title: None,
            started_at: std::time::SystemTime::now(),
            finished_at: None,
            artifact_path: None,
            error: None,
        };
        let dto: TaskSnapshotDto = snapshot.into();
        assert_eq!(dto.progress_percentage, 50.0);
        assert_eq!(dto.state, "FETCHING_CHAPTERS");
        assert!(dto.finished_at.is_none());
    }
}
