//! Project routes.
//!
//! Stage routes answer `202 Accepted` with the new request as soon as it is
//! registered; progress is followed through the request's task or the
//! project status stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use enclave_core::ProjectUid;
use enclave_flow::cloud::CloudStatus;
use enclave_flow::event::TaskEvent;
use enclave_flow::stream::status_frame;
use enclave_flow::workflow::{ProjectView, RequestView};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Body of `POST /projects`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    /// Project title.
    pub title: String,
}

/// Body of `PUT /projects/{uid}/attributes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAttributesRequest {
    /// Attributes to push to the enclave.
    pub attributes: BTreeMap<String, String>,
}

/// Enclave log of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogsResponse {
    /// Status inferred from the most recent event.
    pub status: CloudStatus,
    /// Events, most recent first.
    pub events: Vec<TaskEvent>,
}

/// Creates project routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/:uid", get(get_project))
        .route("/projects/:uid/status", get(project_status))
        .route(
            "/projects/:uid/enclave",
            post(prepare_enclave).delete(delete_enclave),
        )
        .route("/projects/:uid/attributes", put(update_attributes))
        .route("/projects/:uid/unlock", post(unlock_enclave))
        .route("/projects/:uid/requests/:index/logs", get(request_logs))
}

fn parse_uid(raw: &str) -> ApiResult<ProjectUid> {
    raw.parse().map_err(ApiError::from)
}

fn accepted(request: RequestView) -> (StatusCode, Json<RequestView>) {
    (StatusCode::ACCEPTED, Json(request))
}

async fn list_projects(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ProjectView>>> {
    Ok(Json(state.workflow().list_projects().await?))
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<ProjectView>)> {
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::bad_request("project title must not be empty"));
    }
    let project = state.workflow().create_project(title).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> ApiResult<Json<ProjectView>> {
    Ok(Json(state.workflow().project(&parse_uid(&uid)?).await?))
}

/// Streams the current status, then every change until the running stage ends.
async fn project_status(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> ApiResult<Response> {
    let (status, subscriber) = state.workflow().subscribe_status(&parse_uid(&uid)?).await?;
    let frames = futures::stream::once(async move { status_frame(status.as_str()) })
        .chain(subscriber.into_stream().map(|status| status_frame(&status)));
    Ok(super::event_stream(frames))
}

async fn prepare_enclave(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> ApiResult<(StatusCode, Json<RequestView>)> {
    let request = state.workflow().prepare_enclave(&parse_uid(&uid)?).await?;
    Ok(accepted(request))
}

async fn update_attributes(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    Json(req): Json<UpdateAttributesRequest>,
) -> ApiResult<(StatusCode, Json<RequestView>)> {
    if req.attributes.is_empty() {
        return Err(ApiError::bad_request("attributes must not be empty"));
    }
    let request = state
        .workflow()
        .update_attributes(&parse_uid(&uid)?, req.attributes)
        .await?;
    Ok(accepted(request))
}

async fn unlock_enclave(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> ApiResult<(StatusCode, Json<RequestView>)> {
    let request = state.workflow().unlock_enclave(&parse_uid(&uid)?).await?;
    Ok(accepted(request))
}

async fn delete_enclave(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> ApiResult<(StatusCode, Json<RequestView>)> {
    let request = state.workflow().delete_enclave(&parse_uid(&uid)?).await?;
    Ok(accepted(request))
}

async fn request_logs(
    State(state): State<Arc<AppState>>,
    Path((uid, index)): Path<(String, usize)>,
) -> ApiResult<Json<RequestLogsResponse>> {
    let (events, status) = state
        .workflow()
        .request_logs(&parse_uid(&uid)?, index)
        .await?;
    Ok(Json(RequestLogsResponse { status, events }))
}
