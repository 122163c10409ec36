//! Persisting and restoring workflow state.
//!
//! Live subscribers cannot be serialized: they are dropped on export and
//! every restored notifier starts terminated, so nothing can attach to a
//! workflow that no worker will ever update again.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use enclave_core::{ProjectUid, StorageBackend, TaskId};

use crate::error::Result;
use crate::manager::TaskManager;
use crate::notifier::StatusNotifier;
use crate::task::TaskRecord;
use crate::workflow::{
    CloudAttributes, Project, ProjectStatus, ProjectStore, Request, RequestStatus, Workflow,
};

/// Object path of the snapshot.
pub const SNAPSHOT_PATH: &str = "state/workflow.json";

/// Serializable form of a request; the task is referenced by identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Description.
    pub description: String,
    /// Outcome so far.
    pub status: RequestStatus,
    /// Identifier of the request's task.
    pub task_id: TaskId,
    /// Position in the project.
    pub index: usize,
    /// Enclave log location.
    pub cloud: CloudAttributes,
}

/// Serializable form of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    /// Project identifier.
    pub uid: ProjectUid,
    /// Title.
    pub title: String,
    /// Lifecycle status.
    pub status: ProjectStatus,
    /// Enclave instance.
    pub instance_id: Option<String>,
    /// Stage attempts, oldest first.
    pub requests: Vec<RequestRecord>,
    /// Last status broadcast by the project notifier.
    pub notifier_status: String,
}

/// Everything needed to rebuild a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Every task, in index order.
    pub tasks: Vec<TaskRecord>,
    /// Every project.
    pub projects: Vec<ProjectRecord>,
}

impl WorkflowSnapshot {
    /// Writes the snapshot to [`SNAPSHOT_PATH`].
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub async fn save(&self, backend: &dyn StorageBackend) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        backend.put(SNAPSHOT_PATH, Bytes::from(bytes)).await?;
        tracing::info!(
            tasks = self.tasks.len(),
            projects = self.projects.len(),
            "workflow snapshot saved"
        );
        Ok(())
    }

    /// Reads the snapshot from [`SNAPSHOT_PATH`], if one was saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the snapshot is malformed.
    pub async fn load(backend: &dyn StorageBackend) -> Result<Option<Self>> {
        match backend.get(SNAPSHOT_PATH).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Workflow {
    /// Exports tasks and projects without their live subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if a registry lock is poisoned.
    pub async fn snapshot(&self) -> Result<WorkflowSnapshot> {
        let tasks = self.tasks().snapshot()?;
        let mut projects = Vec::new();
        for handle in self.projects().handles()? {
            let project = handle.lock().await;
            projects.push(ProjectRecord {
                uid: project.uid.clone(),
                title: project.title.clone(),
                status: project.status,
                instance_id: project.instance_id.clone(),
                requests: project
                    .requests
                    .iter()
                    .map(|request| RequestRecord {
                        description: request.description.clone(),
                        status: request.status,
                        task_id: request.task.id(),
                        index: request.index,
                        cloud: request.cloud.clone(),
                    })
                    .collect(),
                notifier_status: project.status_notifier.status(),
            });
        }
        Ok(WorkflowSnapshot { tasks, projects })
    }

    /// Replaces this workflow's tasks and projects with a snapshot's.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` if a request references a task missing
    /// from the snapshot.
    pub fn restore(self, snapshot: WorkflowSnapshot) -> Result<Self> {
        let tasks = Arc::new(TaskManager::restore(snapshot.tasks));
        let projects = Arc::new(ProjectStore::new());

        for record in snapshot.projects {
            if record.status.is_in_progress() {
                tracing::warn!(
                    project = %record.uid,
                    status = %record.status,
                    "restored project was abandoned mid-stage"
                );
            }

            let mut requests = Vec::with_capacity(record.requests.len());
            for request in record.requests {
                requests.push(Request {
                    description: request.description,
                    status: request.status,
                    task: tasks.get(request.task_id)?,
                    status_notifier: Arc::new(StatusNotifier::terminated(
                        request.status.as_str(),
                    )),
                    index: request.index,
                    cloud: request.cloud,
                });
            }

            projects.insert(Project {
                uid: record.uid,
                title: record.title,
                status: record.status,
                instance_id: record.instance_id,
                requests,
                status_notifier: Arc::new(StatusNotifier::terminated(record.notifier_status)),
            })?;
        }

        Ok(self.with_state(tasks, projects))
    }

    /// Saves a snapshot of this workflow.
    ///
    /// # Errors
    ///
    /// Returns an error if exporting or writing fails.
    pub async fn persist(&self, backend: &dyn StorageBackend) -> Result<()> {
        self.snapshot().await?.save(backend).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use enclave_core::MemoryBackend;

    #[tokio::test]
    async fn load_without_snapshot_is_none() {
        let backend = MemoryBackend::new();
        assert!(WorkflowSnapshot::load(&backend).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load() {
        let backend = MemoryBackend::new();
        let task = Task::new(0, "prepare enclave");
        task.close_ok("test", "done", "");
        let snapshot = WorkflowSnapshot {
            tasks: vec![task.record()],
            projects: Vec::new(),
        };

        snapshot.save(&backend).await.unwrap();
        let loaded = WorkflowSnapshot::load(&backend).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn malformed_snapshot_is_an_error() {
        let backend = MemoryBackend::new();
        backend
            .put(SNAPSHOT_PATH, Bytes::from_static(b"{"))
            .await
            .unwrap();
        assert!(WorkflowSnapshot::load(&backend).await.is_err());
    }
}
