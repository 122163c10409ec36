//! Task routes.
//!
//! ## Routes
//!
//! - `GET /tasks` - Task summaries, newest first
//! - `GET /tasks/{task_id}` - One task with its full history
//! - `GET /tasks/{task_id}/events` - Past events then live events, server-push

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use enclave_core::TaskId;
use enclave_flow::event::TaskEvent;
use enclave_flow::stream;
use enclave_flow::task::{Task, TaskRecord, TaskStatus};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Summary of a task without its history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    /// Task identifier.
    pub id: TaskId,
    /// Position in the manager.
    pub index: u64,
    /// What the task does.
    pub description: String,
    /// Current status.
    pub status: TaskStatus,
    /// Creation time.
    pub start_time: DateTime<Utc>,
    /// Close time, once closed.
    pub end_time: Option<DateTime<Utc>>,
    /// Most recent event.
    pub last_event: Option<TaskEvent>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id(),
            index: task.index(),
            description: task.description().to_string(),
            status: task.status(),
            start_time: task.start_time(),
            end_time: task.end_time(),
            last_event: task.last_event(),
        }
    }
}

/// Creates task routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/:task_id", get(get_task))
        .route("/tasks/:task_id/events", get(task_events))
}

fn find_task(state: &AppState, raw_id: &str) -> ApiResult<Arc<Task>> {
    let task_id: TaskId = raw_id.parse().map_err(ApiError::from)?;
    Ok(state.workflow().tasks().get(task_id)?)
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<TaskSummary>>> {
    let tasks = state.workflow().tasks().list()?;
    Ok(Json(tasks.iter().map(|task| TaskSummary::from(task.as_ref())).collect()))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskRecord>> {
    Ok(Json(find_task(&state, &task_id)?.record()))
}

/// Streams a task's events. A closed task has nothing live to stream and
/// answers `204 No Content`; its history is available from `GET /tasks/{id}`.
async fn task_events(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    let task = find_task(&state, &task_id)?;
    let subscriber = task.subscribe();
    if !stream::has_live_content(&subscriber) {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    tracing::debug!(task = %task.id(), "streaming task events");
    Ok(super::event_stream(stream::event_frames(subscriber)))
}
