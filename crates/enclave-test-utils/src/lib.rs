//! Shared test utilities for enclave orchestration tests.
//!
//! This crate provides:
//! - [`ScriptedJobStatus`]: Hypervisor jobs that walk through scripted states
//! - [`FakeProvisioner`]: An [`EnclaveProvisioner`] with scripted outcomes
//! - [`RecordingLedger`] and [`RecordingExecutor`]: Collaborators that record calls
//! - [`write_log_event`]: Writes an enclave log object the way an enclave does
//!
//! # Example
//!
//! ```rust,ignore
//! use enclave_test_utils::{FakeProvisioner, RecordingLedger};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let provisioner = FakeProvisioner::new();
//!     provisioner.script("job-create", &[JobState::Running, JobState::Success]);
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod collaborators;
pub mod logs;

pub use collaborators::*;
pub use logs::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("enclave=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
