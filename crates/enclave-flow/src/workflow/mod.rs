//! Project lifecycle workflow.
//!
//! A [`Project`] moves through its enclave lifecycle one stage at a time.
//! Every stage attempt appends a [`Request`] wrapping a fresh [`Task`] and
//! [`StatusNotifier`]; a supervising worker watches the task and, when it
//! closes, moves the project and request to their done or errored status.
//! Failed stages are retried by starting the same stage again; earlier
//! requests stay in the project for audit.

mod stages;
mod supervisor;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use enclave_core::{ProjectUid, StorageRegistry, TaskId};

use crate::cloud::{self, CloudNotifierConfig, CloudStatus};
use crate::error::{Error, Result};
use crate::event::TaskEvent;
use crate::hypervisor::{self, EnclaveProvisioner};
use crate::ledger::ProjectLedger;
use crate::manager::TaskManager;
use crate::metrics::FlowMetrics;
use crate::notifier::{StatusNotifier, StatusSubscriber};
use crate::poller::{PollPolicy, RemoteJobPoller};
use crate::task::{Task, TaskStatus};

pub use stages::Stage;

/// Storage alias enclaves write their logs to.
pub const DEFAULT_STORAGE_ALIAS: &str = "dedis";

/// Lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProjectStatus {
    /// Created, no enclave yet.
    Initialized,
    /// Enclave creation running.
    PreparingEnclave,
    /// Enclave creation failed.
    PreparingEnclaveErrored,
    /// Enclave created.
    PreparingEnclaveDone,
    /// Attribute update running.
    UpdatingAttributes,
    /// Attributes applied by the enclave.
    AttributesUpdated,
    /// Attribute update failed.
    AttributesUpdatedErrored,
    /// Unlock running.
    UnlockingEnclave,
    /// Enclave unlocked.
    UnlockingEnclaveDone,
    /// Unlock failed.
    UnlockingEnclaveErrored,
    /// Enclave deletion running.
    DeletingEnclave,
    /// Enclave deleted.
    DeletingEnclaveDone,
    /// Enclave deletion failed.
    DeletingEnclaveErrored,
}

impl ProjectStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 13] = [
        Self::Initialized,
        Self::PreparingEnclave,
        Self::PreparingEnclaveErrored,
        Self::PreparingEnclaveDone,
        Self::UpdatingAttributes,
        Self::AttributesUpdated,
        Self::AttributesUpdatedErrored,
        Self::UnlockingEnclave,
        Self::UnlockingEnclaveDone,
        Self::UnlockingEnclaveErrored,
        Self::DeletingEnclave,
        Self::DeletingEnclaveDone,
        Self::DeletingEnclaveErrored,
    ];

    /// Returns the wire string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::PreparingEnclave => "preparingEnclave",
            Self::PreparingEnclaveErrored => "preparingEnclaveErrored",
            Self::PreparingEnclaveDone => "preparingEnclaveDone",
            Self::UpdatingAttributes => "updatingAttributes",
            Self::AttributesUpdated => "attributesUpdated",
            Self::AttributesUpdatedErrored => "attributesUpdatedErrored",
            Self::UnlockingEnclave => "unlockingEnclave",
            Self::UnlockingEnclaveDone => "unlockingEnclaveDone",
            Self::UnlockingEnclaveErrored => "unlockingEnclaveErrored",
            Self::DeletingEnclave => "deletingEnclave",
            Self::DeletingEnclaveDone => "deletingEnclaveDone",
            Self::DeletingEnclaveErrored => "deletingEnclaveErrored",
        }
    }

    /// Returns true while a stage is running.
    #[must_use]
    pub const fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::PreparingEnclave
                | Self::UpdatingAttributes
                | Self::UnlockingEnclave
                | Self::DeletingEnclave
        )
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown project status: {s}")))
    }
}

/// Status of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// The stage is running.
    Running,
    /// The stage failed.
    Errored,
    /// The stage succeeded.
    Done,
}

impl RequestStatus {
    /// Returns the wire string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Errored => "errored",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of the log an enclave writes for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudAttributes {
    /// Storage alias.
    pub alias_name: String,
    /// Bucket, equal to the project UID.
    pub bucket: String,
    /// Object prefix, `logs/{index}`.
    pub prefix: String,
}

impl CloudAttributes {
    /// Derives the log location of request `index` of `project`.
    #[must_use]
    pub fn for_request(alias: &str, project: &ProjectUid, index: usize) -> Self {
        Self {
            alias_name: alias.to_string(),
            bucket: project.to_string(),
            prefix: format!("logs/{index}"),
        }
    }
}

/// One stage attempt of a project.
#[derive(Debug, Clone)]
pub struct Request {
    /// What the attempt does.
    pub description: String,
    /// Outcome so far.
    pub status: RequestStatus,
    /// Event log of the attempt.
    pub task: Arc<Task>,
    /// Broadcasts the request status.
    pub status_notifier: Arc<StatusNotifier>,
    /// Position in the project's request list.
    pub index: usize,
    /// Where the enclave logs this attempt.
    pub cloud: CloudAttributes,
}

/// A project and the history of its stage attempts.
#[derive(Debug)]
pub struct Project {
    /// Project identifier, also the enclave log bucket.
    pub uid: ProjectUid,
    /// Human-readable title.
    pub title: String,
    /// Lifecycle status.
    pub status: ProjectStatus,
    /// Hypervisor instance of the enclave, once created.
    pub instance_id: Option<String>,
    /// Stage attempts, oldest first.
    pub requests: Vec<Request>,
    /// Broadcasts status changes of the running stage.
    pub status_notifier: Arc<StatusNotifier>,
}

impl Project {
    /// Creates an `initialized` project.
    #[must_use]
    pub fn new(uid: ProjectUid, title: impl Into<String>) -> Self {
        Self {
            uid,
            title: title.into(),
            status: ProjectStatus::Initialized,
            instance_id: None,
            requests: Vec::new(),
            status_notifier: Arc::new(StatusNotifier::new(ProjectStatus::Initialized.as_str())),
        }
    }

    /// Returns a serializable summary.
    #[must_use]
    pub fn view(&self) -> ProjectView {
        ProjectView {
            uid: self.uid.clone(),
            title: self.title.clone(),
            status: self.status,
            instance_id: self.instance_id.clone(),
            requests: self.requests.iter().map(RequestView::from).collect(),
        }
    }
}

/// Serializable summary of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectView {
    /// Project identifier.
    pub uid: ProjectUid,
    /// Title.
    pub title: String,
    /// Lifecycle status.
    pub status: ProjectStatus,
    /// Enclave instance.
    pub instance_id: Option<String>,
    /// Stage attempts, oldest first.
    pub requests: Vec<RequestView>,
}

/// Serializable summary of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    /// Position in the project.
    pub index: usize,
    /// Description.
    pub description: String,
    /// Outcome so far.
    pub status: RequestStatus,
    /// Task carrying the attempt's events.
    pub task_id: TaskId,
    /// Status of that task.
    pub task_status: TaskStatus,
    /// Enclave log location.
    pub cloud: CloudAttributes,
}

impl From<&Request> for RequestView {
    fn from(request: &Request) -> Self {
        Self {
            index: request.index,
            description: request.description.clone(),
            status: request.status,
            task_id: request.task.id(),
            task_status: request.task.status(),
            cloud: request.cloud.clone(),
        }
    }
}

/// Shared, individually locked project.
pub type ProjectHandle = Arc<Mutex<Project>>;

/// Registry of projects, each behind its own lock.
#[derive(Debug, Default)]
pub struct ProjectStore {
    projects: RwLock<HashMap<ProjectUid, ProjectHandle>>,
}

fn poison_err<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Core(enclave_core::Error::Internal {
        message: "project store lock poisoned".into(),
    })
}

impl ProjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a project, replacing any project with the same UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn insert(&self, project: Project) -> Result<ProjectHandle> {
        let uid = project.uid.clone();
        let handle = Arc::new(Mutex::new(project));
        self.projects
            .write()
            .map_err(poison_err)?
            .insert(uid, Arc::clone(&handle));
        Ok(handle)
    }

    /// Looks up a project.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProjectNotFound` for an unknown UID.
    pub fn get(&self, uid: &ProjectUid) -> Result<ProjectHandle> {
        self.projects
            .read()
            .map_err(poison_err)?
            .get(uid)
            .cloned()
            .ok_or_else(|| Error::ProjectNotFound {
                uid: uid.to_string(),
            })
    }

    /// Returns every project handle, ordered by UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn handles(&self) -> Result<Vec<ProjectHandle>> {
        let projects = self.projects.read().map_err(poison_err)?;
        let mut entries: Vec<_> = projects.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        Ok(entries.into_iter().map(|(_, handle)| Arc::clone(handle)).collect())
    }
}

/// Tunables of the workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfig {
    /// Policy for hypervisor jobs.
    pub poll: PollPolicy,
    /// Timing of enclave log relays.
    pub cloud: CloudNotifierConfig,
    /// Storage alias enclaves write their logs to.
    pub storage_alias: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            cloud: CloudNotifierConfig::default(),
            storage_alias: DEFAULT_STORAGE_ALIAS.to_string(),
        }
    }
}

/// Drives projects through their lifecycle.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Workflow {
    tasks: Arc<TaskManager>,
    projects: Arc<ProjectStore>,
    storage: StorageRegistry,
    provisioner: Arc<dyn EnclaveProvisioner>,
    ledger: Arc<dyn ProjectLedger>,
    poller: RemoteJobPoller,
    config: WorkflowConfig,
    metrics: FlowMetrics,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("storage", &self.storage)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Workflow {
    /// Creates a workflow with no tasks and no projects.
    #[must_use]
    pub fn new(
        storage: StorageRegistry,
        provisioner: Arc<dyn EnclaveProvisioner>,
        ledger: Arc<dyn ProjectLedger>,
        config: WorkflowConfig,
    ) -> Self {
        let poller = RemoteJobPoller::new(hypervisor::job_source(Arc::clone(&provisioner)));
        Self {
            tasks: Arc::new(TaskManager::new()),
            projects: Arc::new(ProjectStore::new()),
            storage,
            provisioner,
            ledger,
            poller,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Replaces the task and project registries.
    #[must_use]
    pub fn with_state(mut self, tasks: Arc<TaskManager>, projects: Arc<ProjectStore>) -> Self {
        self.tasks = tasks;
        self.projects = projects;
        self
    }

    /// Returns the task registry.
    #[must_use]
    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// Returns the project registry.
    #[must_use]
    pub fn projects(&self) -> &Arc<ProjectStore> {
        &self.projects
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Creates an `initialized` project with a fresh UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the project store lock is poisoned.
    pub async fn create_project(&self, title: impl Into<String>) -> Result<ProjectView> {
        let project = Project::new(ProjectUid::generate(), title);
        tracing::info!(project = %project.uid, title = %project.title, "project created");
        let handle = self.projects.insert(project)?;
        let view = handle.lock().await.view();
        Ok(view)
    }

    /// Returns a summary of one project.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProjectNotFound` for an unknown UID.
    pub async fn project(&self, uid: &ProjectUid) -> Result<ProjectView> {
        let handle = self.projects.get(uid)?;
        let view = handle.lock().await.view();
        Ok(view)
    }

    /// Returns summaries of every project.
    ///
    /// # Errors
    ///
    /// Returns an error if the project store lock is poisoned.
    pub async fn list_projects(&self) -> Result<Vec<ProjectView>> {
        let mut views = Vec::new();
        for handle in self.projects.handles()? {
            views.push(handle.lock().await.view());
        }
        Ok(views)
    }

    /// Subscribes to status changes of a project's running stage.
    ///
    /// Returns the current status with the subscriber; the subscriber is
    /// already closed when no stage is running.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProjectNotFound` for an unknown UID.
    pub async fn subscribe_status(
        &self,
        uid: &ProjectUid,
    ) -> Result<(ProjectStatus, StatusSubscriber)> {
        let handle = self.projects.get(uid)?;
        let project = handle.lock().await;
        Ok((project.status, project.status_notifier.subscribe()))
    }

    /// Reads the enclave log of one request.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProjectNotFound` or `Error::RequestNotFound` for
    /// unknown targets, and storage errors from the log read.
    pub async fn request_logs(
        &self,
        uid: &ProjectUid,
        index: usize,
    ) -> Result<(Vec<TaskEvent>, CloudStatus)> {
        let handle = self.projects.get(uid)?;
        let attributes = {
            let project = handle.lock().await;
            project
                .requests
                .get(index)
                .map(|request| request.cloud.clone())
                .ok_or_else(|| Error::RequestNotFound {
                    uid: uid.to_string(),
                    index,
                })?
        };
        cloud::get_logs(
            &self.storage,
            &attributes.alias_name,
            &attributes.bucket,
            &attributes.prefix,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_strings_roundtrip() {
        for status in ProjectStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<ProjectStatus>().unwrap(), status);
        }
        assert!("preparing".parse::<ProjectStatus>().is_err());
    }

    #[test]
    fn only_stage_statuses_are_in_progress() {
        let in_progress: Vec<_> = ProjectStatus::ALL
            .into_iter()
            .filter(|status| status.is_in_progress())
            .collect();
        assert_eq!(
            in_progress,
            vec![
                ProjectStatus::PreparingEnclave,
                ProjectStatus::UpdatingAttributes,
                ProjectStatus::UnlockingEnclave,
                ProjectStatus::DeletingEnclave,
            ]
        );
    }

    #[test]
    fn cloud_attributes_are_derived_from_request() {
        let uid: ProjectUid = "project-a".parse().unwrap();
        let attributes = CloudAttributes::for_request("dedis", &uid, 3);
        assert_eq!(attributes.alias_name, "dedis");
        assert_eq!(attributes.bucket, "project-a");
        assert_eq!(attributes.prefix, "logs/3");
    }

    #[tokio::test]
    async fn store_lookups() {
        let store = ProjectStore::new();
        let uid = ProjectUid::generate();
        store.insert(Project::new(uid.clone(), "demo")).unwrap();

        let handle = store.get(&uid).unwrap();
        assert_eq!(handle.lock().await.status, ProjectStatus::Initialized);
        assert_eq!(store.handles().unwrap().len(), 1);

        let err = store.get(&ProjectUid::generate()).unwrap_err();
        assert!(err.is_not_found());
    }
}
