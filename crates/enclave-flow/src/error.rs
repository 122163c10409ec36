//! Error types for the orchestration domain.

use enclave_core::TaskId;

use crate::cloud::CloudStatus;

/// The result type used throughout enclave-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task was not found in the manager.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: TaskId,
    },

    /// A project was not found in the store.
    #[error("project not found: {uid}")]
    ProjectNotFound {
        /// The project UID that was not found.
        uid: String,
    },

    /// A request index is outside the project's request list.
    #[error("request {index} not found in project {uid}")]
    RequestNotFound {
        /// The project UID.
        uid: String,
        /// The requested index.
        index: usize,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A remote job kept reporting a pending state until the retry budget ran out.
    #[error("gave up on job {job} after {attempts} attempts: {last_status}")]
    PollerExhausted {
        /// The job handle.
        job: String,
        /// Number of status fetches performed.
        attempts: u32,
        /// Last observed status or fetch error.
        last_status: String,
    },

    /// A remote job reported a non-success terminal state.
    #[error("job {job} failed with status {status}: {details}")]
    RemoteJobFailed {
        /// The job handle.
        job: String,
        /// The reported status.
        status: String,
        /// Free-text details from the job.
        details: String,
    },

    /// The hypervisor rejected or failed a request.
    #[error("hypervisor error: {message}")]
    Hypervisor {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A subprocess could not be run or exited unsuccessfully.
    #[error("command `{command}` failed: {message}")]
    Execution {
        /// The command line that was run.
        command: String,
        /// Description of the failure (usually stderr).
        message: String,
    },

    /// The enclave's own log ended without reporting success.
    #[error("enclave log ended with status {status}: {message}")]
    EnclaveLog {
        /// Terminal status of the log relay.
        status: CloudStatus,
        /// Last error reported by the relay.
        message: String,
    },

    /// Invalid input was provided to a workflow stage.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from enclave-core.
    #[error("core error: {0}")]
    Core(#[from] enclave_core::Error),
}

impl Error {
    /// Creates a new hypervisor error.
    #[must_use]
    pub fn hypervisor(message: impl Into<String>) -> Self {
        Self::Hypervisor {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new hypervisor error with a source.
    #[must_use]
    pub fn hypervisor_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Hypervisor {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if this error means a looked-up entity does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::TaskNotFound { .. }
            | Self::ProjectNotFound { .. }
            | Self::RequestNotFound { .. } => true,
            Self::Core(core) => core.is_not_found(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "preparingEnclave".into(),
            to: "unlockingEnclave".into(),
            reason: "stage still in progress".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("preparingEnclave -> unlockingEnclave"));
        assert!(msg.contains("stage still in progress"));
    }

    #[test]
    fn exhaustion_is_distinct_from_failure() {
        let gave_up = Error::PollerExhausted {
            job: "job-1".into(),
            attempts: 3,
            last_status: "running".into(),
        };
        let failed = Error::RemoteJobFailed {
            job: "job-1".into(),
            status: "error".into(),
            details: "disk full".into(),
        };
        assert!(gave_up.to_string().contains("gave up"));
        assert!(failed.to_string().contains("disk full"));
    }

    #[test]
    fn hypervisor_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::hypervisor_with_source("create enclave", io);
        assert!(err.source().is_some());
    }

    #[test]
    fn core_not_found_is_detected() {
        let err: Error = enclave_core::Error::missing_bucket("p").into();
        assert!(err.is_not_found());
        assert!(!Error::InvalidInput("x".into()).is_not_found());
    }
}
