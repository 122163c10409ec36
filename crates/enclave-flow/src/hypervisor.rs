//! Hypervisor collaborator: enclave provisioning and remote job status.
//!
//! Provisioning calls return a [`JobHandle`] for the asynchronous work they
//! started on the hypervisor; [`crate::poller::RemoteJobPoller`] then follows
//! that job through [`JobStatusSource`] until it settles.
//!
//! HTTP contract served by the hypervisor at `base_url`:
//!
//! - `POST /enclaves` with `{"name": <project uid>}` returns
//!   `{"instanceId", "job"}`; `409 Conflict` with `{"instanceId"}` means the
//!   enclave already exists
//! - `DELETE /enclaves/{instanceId}` returns `{"job"}`
//! - `GET /jobs/{job}` returns `{"status", "progress", "details"}`

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use enclave_core::ProjectUid;

use crate::error::{Error, Result};

/// Identifier of an asynchronous job running on the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    /// Wraps a job identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State reported by a remote job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Accepted, not started.
    Queued,
    /// In progress.
    Running,
    /// Finished successfully. The only terminal success value.
    Success,
    /// Any other value, treated as failure.
    Other(String),
}

impl JobState {
    /// Parses a wire status string.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "success" => Self::Success,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns true for states worth waiting on.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Returns the wire string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a remote job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// Reported state.
    pub state: JobState,
    /// Free-text progress.
    pub progress: String,
    /// Free-text details.
    pub details: String,
}

impl JobStatus {
    /// Creates a status with empty progress and details.
    #[must_use]
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            progress: String::new(),
            details: String::new(),
        }
    }
}

/// Source of remote job status.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    /// Fetches the current status of a job.
    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus>;
}

/// Outcome of an enclave creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedEnclave {
    /// Hypervisor instance identifier.
    pub instance_id: String,
    /// Job to wait for, or `None` when the enclave already existed.
    pub job: Option<JobHandle>,
}

impl ProvisionedEnclave {
    /// An enclave whose creation was just started.
    #[must_use]
    pub fn started(instance_id: impl Into<String>, job: JobHandle) -> Self {
        Self {
            instance_id: instance_id.into(),
            job: Some(job),
        }
    }

    /// An enclave that already existed and needs no waiting.
    #[must_use]
    pub fn existing(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            job: None,
        }
    }
}

/// Creates and deletes enclaves.
#[async_trait]
pub trait EnclaveProvisioner: JobStatusSource {
    /// Starts creating the enclave of a project.
    async fn create_enclave(&self, project: &ProjectUid) -> Result<ProvisionedEnclave>;

    /// Starts deleting an enclave.
    async fn delete_enclave(&self, instance_id: &str) -> Result<JobHandle>;
}

/// Exposes the job status half of a provisioner on its own.
#[must_use]
pub fn job_source(provisioner: Arc<dyn EnclaveProvisioner>) -> Arc<dyn JobStatusSource> {
    Arc::new(ProvisionerJobs(provisioner))
}

struct ProvisionerJobs(Arc<dyn EnclaveProvisioner>);

#[async_trait]
impl JobStatusSource for ProvisionerJobs {
    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus> {
        self.0.job_status(job).await
    }
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    instance_id: String,
    #[serde(default)]
    job: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    job: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: String,
    #[serde(default)]
    progress: String,
    #[serde(default)]
    details: String,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the hypervisor API.
#[derive(Debug, Clone)]
pub struct HttpHypervisor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHypervisor {
    /// Creates a client for the hypervisor at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn failure(action: &str, response: reqwest::Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Error::hypervisor(format!("{action} failed (status={status}): {body}"))
    }
}

#[async_trait]
impl JobStatusSource for HttpHypervisor {
    #[tracing::instrument(skip(self, job), fields(job = %job))]
    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus> {
        let response = self
            .client
            .get(self.url(&format!("jobs/{job}")))
            .send()
            .await
            .map_err(|e| Error::hypervisor_with_source("job status request", e))?;

        if !response.status().is_success() {
            return Err(Self::failure("job status", response).await);
        }

        let body: JobResponse = response
            .json()
            .await
            .map_err(|e| Error::hypervisor_with_source("decode job status", e))?;

        Ok(JobStatus {
            state: JobState::parse(&body.status),
            progress: body.progress,
            details: body.details,
        })
    }
}

#[async_trait]
impl EnclaveProvisioner for HttpHypervisor {
    #[tracing::instrument(skip(self, project), fields(project = %project))]
    async fn create_enclave(&self, project: &ProjectUid) -> Result<ProvisionedEnclave> {
        let response = self
            .client
            .post(self.url("enclaves"))
            .json(&CreateRequest {
                name: project.as_str(),
            })
            .send()
            .await
            .map_err(|e| Error::hypervisor_with_source("create enclave request", e))?;

        let status = response.status();
        if status != StatusCode::CONFLICT && !status.is_success() {
            return Err(Self::failure("create enclave", response).await);
        }

        let body: CreateResponse = response
            .json()
            .await
            .map_err(|e| Error::hypervisor_with_source("decode create enclave response", e))?;

        match body.job {
            Some(job) if status != StatusCode::CONFLICT => Ok(ProvisionedEnclave::started(
                body.instance_id,
                JobHandle::new(job),
            )),
            _ => {
                tracing::info!(instance = %body.instance_id, "enclave already exists");
                Ok(ProvisionedEnclave::existing(body.instance_id))
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn delete_enclave(&self, instance_id: &str) -> Result<JobHandle> {
        let response = self
            .client
            .delete(self.url(&format!("enclaves/{instance_id}")))
            .send()
            .await
            .map_err(|e| Error::hypervisor_with_source("delete enclave request", e))?;

        if !response.status().is_success() {
            return Err(Self::failure("delete enclave", response).await);
        }

        let body: DeleteResponse = response
            .json()
            .await
            .map_err(|e| Error::hypervisor_with_source("decode delete enclave response", e))?;
        Ok(JobHandle::new(body.job))
    }
}
