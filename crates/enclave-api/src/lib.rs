//! # enclave-api
//!
//! HTTP composition layer over the enclave project workflow.
//!
//! This crate is a **thin composition layer** with no domain policy. All
//! lifecycle logic lives in `enclave-flow`; handlers translate requests into
//! workflow calls and workflow errors into JSON error bodies.
//!
//! ## Endpoints
//!
//! ```text
//!   GET    /health                                  - Health check
//!   GET    /v1/tasks                                - Task summaries
//!   GET    /v1/tasks/{id}                           - Task with history
//!   GET    /v1/tasks/{id}/events                    - Server-push task events
//!   GET    /v1/projects                             - Project summaries
//!   POST   /v1/projects                             - Create a project
//!   GET    /v1/projects/{uid}                       - Project with requests
//!   GET    /v1/projects/{uid}/status                - Server-push status changes
//!   POST   /v1/projects/{uid}/enclave               - Prepare the enclave
//!   PUT    /v1/projects/{uid}/attributes            - Update enclave attributes
//!   POST   /v1/projects/{uid}/unlock                - Unlock the enclave
//!   DELETE /v1/projects/{uid}/enclave               - Delete the enclave
//!   GET    /v1/projects/{uid}/requests/{index}/logs - Enclave log of a request
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod routes;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::Server;
}
