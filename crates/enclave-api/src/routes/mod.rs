//! HTTP route handlers.

pub mod projects;
pub mod tasks;

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};

use crate::server::AppState;

/// Content type of server-push responses.
pub const EVENT_STREAM: &str = "text/event-stream";

/// `/v1` routes.
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(tasks::routes())
        .merge(projects::routes())
}

/// Streams pre-rendered frames as a server-push response.
pub(crate) fn event_stream<S>(frames: S) -> Response
where
    S: Stream<Item = String> + Send + 'static,
{
    let body = Body::from_stream(frames.map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, EVENT_STREAM),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}
