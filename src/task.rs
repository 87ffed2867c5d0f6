//! Process-local registry mapping an opaque task id to a `DownloadTask`'s
//! mutable state, polled by id from the REST façade.
//!
//! Grounded in the teacher's own `Book` struct as the thing a long download
//! mutates in place (`updater/native/book.rs`), generalized from "one struct
//! the CLI owns for the process lifetime" to a registry of many concurrently
//! running tasks addressed by `uuid::Uuid`, the same crate the teacher
//! already pulls in for `Book::id`-adjacent bookkeeping.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Txt,
    Epub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    FetchingMeta,
    FetchingChapters,
    Assembling,
    Ready,
    Failed,
}

impl State {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

struct TaskState {
    detail_url: String,
    source_id: u32,
    format: Format,
    state: Mutex<State>,
    total_chapters: AtomicU32,
    completed_chapters: AtomicU32,
    failed_chapters: AtomicU32,
    current_chapter_title: Mutex<Option<String>>,
    started_at: SystemTime,
    finished_at: Mutex<Option<SystemTime>>,
    artifact_path: Mutex<Option<PathBuf>>,
    error: Mutex<Option<String>>,
    cancel: CancelToken,
}

/// A snapshot safe to hand across an async boundary or serialize into a
/// response body.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub detail_url: String,
    pub source_id: u32,
    pub format: Format,
    pub state: State,
    pub total_chapters: u32,
    pub completed_chapters: u32,
    pub failed_chapters: u32,
    pub current_chapter_title: Option<String>,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
    pub artifact_path: Option<PathBuf>,
    pub error: Option<String>,
}

/// Cooperative cancellation flag, cheap to clone and check at every
/// suspension point.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

/// A handle the owning worker uses to mutate its own task's state. Never
/// shared outside the worker that owns it and the registry.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskState>,
}

impl TaskHandle {
    pub fn transition(&self, state: State) {
        let mut current = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_terminal() {
            return;
        }
        *current = state;
        if state.is_terminal() {
            *self.inner.finished_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(SystemTime::now());
        }
    }

    pub fn fail(&self, reason: impl Into<String>) {
        *self.inner.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.into());
        self.transition(State::Failed);
    }

    pub fn set_total_chapters(&self, total: u32) {
        self.inner.total_chapters.store(total, Ordering::Relaxed);
    }

    pub fn increment_completed(&self) {
        self.inner.completed_chapters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.inner.failed_chapters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_current_chapter_title(&self, title: &str) {
        *self.inner.current_chapter_title.lock().unwrap_or_else(|e| e.into_inner()) = Some(title.to_owned());
    }

    pub fn set_artifact_path(&self, path: PathBuf) {
        *self.inner.artifact_path.lock().unwrap_or_else(|e| e.into_inner()) = Some(path);
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }
}

fn snapshot(task_id: Uuid, inner: &Arc<TaskState>) -> TaskSnapshot {
    TaskSnapshot {
        task_id,
        detail_url: inner.detail_url.clone(),
        source_id: inner.source_id,
        format: inner.format,
        state: *inner.state.lock().unwrap_or_else(|e| e.into_inner()),
        total_chapters: inner.total_chapters.load(Ordering::Relaxed),
        completed_chapters: inner.completed_chapters.load(Ordering::Relaxed),
        failed_chapters: inner.failed_chapters.load(Ordering::Relaxed),
        current_chapter_title: inner.current_chapter_title.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        started_at: inner.started_at,
        finished_at: *inner.finished_at.lock().unwrap_or_else(|e| e.into_inner()),
        artifact_path: inner.artifact_path.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        error: inner.error.lock().unwrap_or_else(|e| e.into_inner()).clone(),
    }
}

const MIN_RETENTION: Duration = Duration::from_secs(60 * 60);
const MATERIALIZATION_CHECK_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<Uuid, Arc<TaskState>>>>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new task in `PENDING` and returns its id plus the handle
    /// the caller's background worker should drive.
    pub fn submit(&self, detail_url: String, source_id: u32, format: Format) -> (Uuid, TaskHandle) {
        let task_id = Uuid::new_v4();
        let inner = Arc::new(TaskState {
            detail_url,
            source_id,
            format,
            state: Mutex::new(State::Pending),
            total_chapters: AtomicU32::new(0),
            completed_chapters: AtomicU32::new(0),
            failed_chapters: AtomicU32::new(0),
            current_chapter_title: Mutex::new(None),
            started_at: SystemTime::now(),
            finished_at: Mutex::new(None),
            artifact_path: Mutex::new(None),
            error: Mutex::new(None),
            cancel: CancelToken::default(),
        });
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).insert(task_id, inner.clone());
        (task_id, TaskHandle { inner })
    }

    #[must_use]
    pub fn progress(&self, task_id: Uuid) -> Option<TaskSnapshot> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(&task_id).map(|inner| snapshot(task_id, inner))
    }

    pub fn cancel(&self, task_id: Uuid) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(inner) = tasks.get(&task_id) else {
            return false;
        };
        inner.cancel.cancel();
        true
    }

    /// Returns the artifact path only once it passes the "fully
    /// materialized" check: the task is `READY`, the file exists, and its
    /// size is stable across two reads separated by a short delay.
    pub async fn result(&self, task_id: Uuid) -> ResultOutcome {
        let Some(snapshot) = self.progress(task_id) else {
            return ResultOutcome::NotFound;
        };
        match snapshot.state {
            State::Failed => ResultOutcome::Failed(snapshot.error.unwrap_or_else(|| "unknown error".to_owned())),
            State::Ready => {
                let Some(path) = snapshot.artifact_path else {
                    return ResultOutcome::Failed("task is ready but has no artifact path".to_owned());
                };
                if !materialization_stable(&path).await {
                    return ResultOutcome::Running;
                }
                ResultOutcome::Ready(path)
            }
            _ => ResultOutcome::Running,
        }
    }

    /// Number of tasks currently tracked (any state), reported by `/health`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any tracked task has not yet reached a terminal state.
    /// Used by shutdown to decide when draining is complete.
    #[must_use]
    pub fn has_active_tasks(&self) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .values()
            .any(|inner| !inner.state.lock().unwrap_or_else(|e| e.into_inner()).is_terminal())
    }

    /// Drops tasks finished more than [`MIN_RETENTION`] ago.
    pub fn garbage_collect(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|_, inner| {
            let finished_at = *inner.finished_at.lock().unwrap_or_else(|e| e.into_inner());
            match finished_at {
                Some(at) => SystemTime::now().duration_since(at).map(|d| d < MIN_RETENTION).unwrap_or(true),
                None => true,
            }
        });
    }
}

async fn materialization_stable(path: &PathBuf) -> bool {
    let Ok(first) = tokio::fs::metadata(path).await else {
        return false;
    };
    tokio::time::sleep(MATERIALIZATION_CHECK_DELAY).await;
    let Ok(second) = tokio::fs::metadata(path).await else {
        return false;
    };
    first.len() == second.len()
}

#[derive(Debug)]
pub enum ResultOutcome {
    Running,
    Ready(PathBuf),
    Failed(String),
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_starts_in_pending_and_transitions_forward() {
        let registry = TaskRegistry::new();
        let (task_id, handle) = registry.submit("https://x.example.com/1".to_owned(), 1, Format::Epub);
        assert_eq!(registry.progress(task_id).unwrap().state, State::Pending);

        handle.transition(State::FetchingMeta);
        handle.transition(State::FetchingChapters);
        assert_eq!(registry.progress(task_id).unwrap().state, State::FetchingChapters);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let registry = TaskRegistry::new();
        let (task_id, handle) = registry.submit("https://x.example.com/1".to_owned(), 1, Format::Txt);
        handle.fail("boom");
        handle.transition(State::Ready);
        assert_eq!(registry.progress(task_id).unwrap().state, State::Failed);
    }

    #[test]
    fn cancel_sets_the_shared_token() {
        let registry = TaskRegistry::new();
        let (task_id, handle) = registry.submit("https://x.example.com/1".to_owned(), 1, Format::Epub);
        let token = handle.cancel_token();
        assert!(!token.is_cancelled());
        registry.cancel(task_id);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn result_is_not_found_for_unknown_id() {
        let registry = TaskRegistry::new();
        let outcome = registry.result(Uuid::new_v4()).await;
        assert!(matches!(outcome, ResultOutcome::NotFound));
    }
}
