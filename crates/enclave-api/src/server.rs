//! API server implementation.
//!
//! Provides the health endpoint and the `/v1` workflow routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use enclave_core::{Error, Result, StorageBackend};
use enclave_flow::workflow::Workflow;

use crate::config::Config;

// ============================================================================
// Health Response
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    workflow: Workflow,
}

impl AppState {
    /// Creates state over a workflow.
    #[must_use]
    pub fn new(config: Config, workflow: Workflow) -> Self {
        Self { config, workflow }
    }

    /// Returns the workflow.
    #[must_use]
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint handler.
///
/// Returns 200 OK if the service is alive. This is a shallow check
/// that doesn't verify dependencies.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

// ============================================================================
// Server
// ============================================================================

/// The enclave API server.
///
/// On shutdown the workflow is snapshotted to the state backend so the next
/// start can restore it.
pub struct Server {
    config: Config,
    workflow: Workflow,
    state_backend: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("workflow", &self.workflow)
            .field("state_backend", &"<StorageBackend>")
            .finish()
    }
}

impl Server {
    /// Creates a server over a workflow and the backend its snapshot lives in.
    #[must_use]
    pub fn new(
        config: Config,
        workflow: Workflow,
        state_backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            config,
            workflow,
            state_backend,
        }
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self) -> Router {
        let state = Arc::new(AppState::new(self.config.clone(), self.workflow.clone()));

        Router::new()
            .route("/health", get(health))
            .nest("/v1", crate::routes::api_v1_routes())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serves until Ctrl-C, then persists the workflow snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the port, fails while
    /// serving, or the snapshot cannot be written.
    pub async fn serve(&self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.create_router();

        tracing::info!(http_port = self.config.http_port, "Starting enclave API server");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal {
                message: format!("failed to bind to {addr}: {e}"),
            })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal {
                message: format!("server error: {e}"),
            })?;

        self.workflow
            .persist(self.state_backend.as_ref())
            .await
            .map_err(|e| Error::Internal {
                message: format!("failed to persist workflow snapshot: {e}"),
            })
    }

    /// Creates a test router for the server.
    ///
    /// This is useful for integration tests where you want to test
    /// the routes without actually binding to a port.
    #[doc(hidden)]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
