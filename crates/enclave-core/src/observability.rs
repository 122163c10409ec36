//! Logging initialization and span helpers.
//!
//! Every component logs through `tracing`; binaries call [`init_logging`] once at
//! startup and the workflow opens spans with the helpers below so task and
//! project identifiers are attached to every record emitted inside them.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `enclave_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one workflow stage of a project.
///
/// # Example
///
/// ```rust
/// use enclave_core::observability::stage_span;
///
/// let span = stage_span("prepare_enclave", "4f1c...", 0);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn stage_span(stage: &str, project_uid: &str, request_index: usize) -> Span {
    tracing::info_span!(
        "stage",
        stage = stage,
        project = project_uid,
        request = request_index,
    )
}

/// Creates a span for a relay of remote enclave logs.
#[must_use]
pub fn cloud_span(alias: &str, bucket: &str, prefix: &str) -> Span {
    tracing::info_span!("cloud", alias = alias, bucket = bucket, prefix = prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn test_span_helpers_create_spans() {
        let span = stage_span("unlock_enclave", "project", 2);
        let _guard = span.enter();
        tracing::info!("stage message");

        let span = cloud_span("dedis", "project", "logs/2");
        let _guard = span.enter();
        tracing::info!("cloud message");
    }
}
