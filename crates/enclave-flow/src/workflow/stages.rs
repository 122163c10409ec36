//! Stage transitions of the project workflow.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::Instrument;

use enclave_core::ProjectUid;
use enclave_core::observability::stage_span;

use super::supervisor::{self, Supervision};
use super::{
    CloudAttributes, ProjectHandle, ProjectStatus, Request, RequestStatus, RequestView, Workflow,
};
use crate::cloud::{CloudNotifier, CloudStatus};
use crate::error::{Error, Result};
use crate::event::TaskEventType;
use crate::hypervisor::JobHandle;
use crate::ledger::record_failure;
use crate::metrics::StageTimer;
use crate::notifier::StatusNotifier;
use crate::task::Task;

const SOURCE: &str = "workflow";

/// A step of the enclave lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Create the enclave on the hypervisor.
    PrepareEnclave,
    /// Push new attributes to the enclave through the ledger.
    UpdateAttributes,
    /// Ask the enclave to unlock through the ledger.
    UnlockEnclave,
    /// Delete the enclave on the hypervisor.
    DeleteEnclave,
}

impl Stage {
    /// Returns a stable identifier for logs and metrics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PrepareEnclave => "prepare_enclave",
            Self::UpdateAttributes => "update_attributes",
            Self::UnlockEnclave => "unlock_enclave",
            Self::DeleteEnclave => "delete_enclave",
        }
    }

    /// Returns a human-readable description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::PrepareEnclave => "prepare enclave",
            Self::UpdateAttributes => "update attributes",
            Self::UnlockEnclave => "unlock enclave",
            Self::DeleteEnclave => "delete enclave",
        }
    }

    /// Project status while the stage runs.
    #[must_use]
    pub const fn in_progress(self) -> ProjectStatus {
        match self {
            Self::PrepareEnclave => ProjectStatus::PreparingEnclave,
            Self::UpdateAttributes => ProjectStatus::UpdatingAttributes,
            Self::UnlockEnclave => ProjectStatus::UnlockingEnclave,
            Self::DeleteEnclave => ProjectStatus::DeletingEnclave,
        }
    }

    /// Project status after success.
    #[must_use]
    pub const fn done(self) -> ProjectStatus {
        match self {
            Self::PrepareEnclave => ProjectStatus::PreparingEnclaveDone,
            Self::UpdateAttributes => ProjectStatus::AttributesUpdated,
            Self::UnlockEnclave => ProjectStatus::UnlockingEnclaveDone,
            Self::DeleteEnclave => ProjectStatus::DeletingEnclaveDone,
        }
    }

    /// Project status after failure.
    #[must_use]
    pub const fn errored(self) -> ProjectStatus {
        match self {
            Self::PrepareEnclave => ProjectStatus::PreparingEnclaveErrored,
            Self::UpdateAttributes => ProjectStatus::AttributesUpdatedErrored,
            Self::UnlockEnclave => ProjectStatus::UnlockingEnclaveErrored,
            Self::DeleteEnclave => ProjectStatus::DeletingEnclaveErrored,
        }
    }

    /// Returns true if the stage may start while the project is in `status`.
    ///
    /// A failed stage can always be started again.
    #[must_use]
    pub const fn can_start_from(self, status: ProjectStatus) -> bool {
        use ProjectStatus as S;
        match self {
            Self::PrepareEnclave => matches!(
                status,
                S::Initialized | S::PreparingEnclaveErrored | S::DeletingEnclaveDone
            ),
            Self::UpdateAttributes => matches!(
                status,
                S::PreparingEnclaveDone
                    | S::AttributesUpdated
                    | S::AttributesUpdatedErrored
                    | S::UnlockingEnclaveErrored
            ),
            Self::UnlockEnclave => {
                matches!(status, S::AttributesUpdated | S::UnlockingEnclaveErrored)
            }
            Self::DeleteEnclave => {
                !status.is_in_progress()
                    && !matches!(status, S::Initialized | S::DeletingEnclaveDone)
            }
        }
    }

    /// Returns true if success is decided by the enclave's own log.
    #[must_use]
    pub const fn follows_enclave_log(self) -> bool {
        matches!(self, Self::UpdateAttributes | Self::UnlockEnclave)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

enum Action {
    Prepare,
    UpdateAttributes(BTreeMap<String, String>),
    Unlock,
    Delete,
}

/// A stage whose request is registered and whose supervisor is running.
struct StartedStage {
    stage: Stage,
    uid: ProjectUid,
    handle: ProjectHandle,
    task: Arc<Task>,
    cloud: CloudAttributes,
}

impl Workflow {
    /// Starts creating the project's enclave.
    ///
    /// Returns once the request is registered; the hypervisor work runs in
    /// the background and is reported on the request's task.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidStateTransition` if the project is not in a
    /// status the stage can start from, and `Error::ProjectNotFound` for an
    /// unknown UID.
    pub async fn prepare_enclave(&self, uid: &ProjectUid) -> Result<RequestView> {
        self.start(uid, Stage::PrepareEnclave, Action::Prepare).await
    }

    /// Starts pushing `attributes` to the enclave.
    ///
    /// The stage succeeds when the enclave's log reports success.
    ///
    /// # Errors
    ///
    /// Same as [`Workflow::prepare_enclave`].
    pub async fn update_attributes(
        &self,
        uid: &ProjectUid,
        attributes: BTreeMap<String, String>,
    ) -> Result<RequestView> {
        self.start(
            uid,
            Stage::UpdateAttributes,
            Action::UpdateAttributes(attributes),
        )
        .await
    }

    /// Starts unlocking the enclave.
    ///
    /// The stage succeeds when the enclave's log reports success.
    ///
    /// # Errors
    ///
    /// Same as [`Workflow::prepare_enclave`].
    pub async fn unlock_enclave(&self, uid: &ProjectUid) -> Result<RequestView> {
        self.start(uid, Stage::UnlockEnclave, Action::Unlock).await
    }

    /// Starts deleting the enclave.
    ///
    /// # Errors
    ///
    /// Same as [`Workflow::prepare_enclave`].
    pub async fn delete_enclave(&self, uid: &ProjectUid) -> Result<RequestView> {
        self.start(uid, Stage::DeleteEnclave, Action::Delete).await
    }

    async fn start(&self, uid: &ProjectUid, stage: Stage, action: Action) -> Result<RequestView> {
        let (started, view) = self.begin(uid, stage).await?;
        tracing::info!(project = %uid, stage = stage.name(), request = view.index, "stage started");

        let span = stage_span(stage.name(), uid.as_str(), view.index);
        let workflow = self.clone();
        tokio::spawn(
            async move {
                let outcome = workflow.perform(&started, action).await;
                workflow.finish(&started, outcome).await;
            }
            .instrument(span),
        );
        Ok(view)
    }

    /// Registers a new request and its supervisor under the project lock.
    async fn begin(&self, uid: &ProjectUid, stage: Stage) -> Result<(StartedStage, RequestView)> {
        let handle = self.projects.get(uid)?;
        let mut project = handle.lock().await;

        if !stage.can_start_from(project.status) {
            return Err(Error::InvalidStateTransition {
                from: project.status.to_string(),
                to: stage.in_progress().to_string(),
                reason: format!("cannot {stage} while project is {}", project.status),
            });
        }

        let index = project.requests.len();
        let task = self
            .tasks
            .new_task(format!("{stage} for project {uid}"))?;
        let request_notifier = Arc::new(StatusNotifier::new(RequestStatus::Running.as_str()));
        // An open project notifier has no stage behind it yet; its subscribers
        // follow this stage to its outcome.
        let project_notifier = if project.status_notifier.is_terminated() {
            let fresh = Arc::new(StatusNotifier::new(stage.in_progress().as_str()));
            project.status_notifier = Arc::clone(&fresh);
            fresh
        } else {
            project
                .status_notifier
                .update_status(stage.in_progress().as_str());
            Arc::clone(&project.status_notifier)
        };
        project.status = stage.in_progress();

        let cloud = CloudAttributes::for_request(&self.config.storage_alias, uid, index);
        let request = Request {
            description: stage.description().to_string(),
            status: RequestStatus::Running,
            task: Arc::clone(&task),
            status_notifier: Arc::clone(&request_notifier),
            index,
            cloud: cloud.clone(),
        };
        let view = RequestView::from(&request);
        project.requests.push(request);

        // Subscribed before the action starts, so the close event is always seen.
        let supervision = Supervision {
            stage,
            handle: Arc::clone(&handle),
            index,
            subscriber: task.subscribe(),
            request_notifier,
            project_notifier,
            metrics: self.metrics,
            timer: StageTimer::start(),
        };
        tokio::spawn(
            supervisor::supervise(supervision).instrument(stage_span(
                stage.name(),
                uid.as_str(),
                index,
            )),
        );
        drop(project);

        let started = StartedStage {
            stage,
            uid: uid.clone(),
            handle,
            task,
            cloud,
        };
        Ok((started, view))
    }

    async fn perform(&self, started: &StartedStage, action: Action) -> Result<()> {
        match action {
            Action::Prepare => self.create(started).await,
            Action::UpdateAttributes(attributes) => {
                self.push_attributes(started, attributes).await
            }
            Action::Unlock => self.unlock(started).await,
            Action::Delete => self.delete(started).await,
        }
    }

    async fn create(&self, started: &StartedStage) -> Result<()> {
        let task = &started.task;
        self.ledger
            .record_status(&started.uid, ProjectStatus::PreparingEnclave)
            .await?;
        task.add_info(SOURCE, "creating enclave", "");

        let enclave = self.provisioner.create_enclave(&started.uid).await?;
        match &enclave.job {
            Some(job) => {
                task.add_info(SOURCE, "waiting for hypervisor job", job.to_string());
                self.wait_for_job(task, job).await?;
            }
            None => {
                task.add_important_info(
                    SOURCE,
                    "enclave already exists",
                    enclave.instance_id.clone(),
                );
            }
        }

        started.handle.lock().await.instance_id = Some(enclave.instance_id.clone());
        self.ledger
            .record_instance(&started.uid, Some(&enclave.instance_id))
            .await?;
        task.add_important_info(SOURCE, "enclave ready", enclave.instance_id);
        Ok(())
    }

    async fn push_attributes(
        &self,
        started: &StartedStage,
        attributes: BTreeMap<String, String>,
    ) -> Result<()> {
        if attributes.is_empty() {
            return Err(Error::InvalidInput("no attributes to update".into()));
        }

        let mut notifier = self.follow_enclave_log(started);
        if notifier.started().await.is_terminal() {
            return self.relay(&started.task, notifier).await;
        }

        self.ledger
            .record_status(&started.uid, ProjectStatus::UpdatingAttributes)
            .await?;
        self.ledger
            .update_attributes(&started.uid, &attributes)
            .await?;
        let keys: Vec<&str> = attributes.keys().map(String::as_str).collect();
        started.task.add_info(
            SOURCE,
            "attributes submitted, waiting for the enclave",
            keys.join(", "),
        );
        self.relay(&started.task, notifier).await
    }

    async fn unlock(&self, started: &StartedStage) -> Result<()> {
        let mut notifier = self.follow_enclave_log(started);
        if notifier.started().await.is_terminal() {
            return self.relay(&started.task, notifier).await;
        }

        self.ledger
            .record_status(&started.uid, ProjectStatus::UnlockingEnclave)
            .await?;
        started
            .task
            .add_info(SOURCE, "unlock submitted, waiting for the enclave", "");
        self.relay(&started.task, notifier).await
    }

    async fn delete(&self, started: &StartedStage) -> Result<()> {
        let instance_id = started
            .handle
            .lock()
            .await
            .instance_id
            .clone()
            .ok_or_else(|| Error::InvalidInput("project has no enclave instance".into()))?;

        self.ledger
            .record_status(&started.uid, ProjectStatus::DeletingEnclave)
            .await?;
        started
            .task
            .add_info(SOURCE, "deleting enclave", instance_id.clone());
        let job = self.provisioner.delete_enclave(&instance_id).await?;
        self.wait_for_job(&started.task, &job).await?;

        started.handle.lock().await.instance_id = None;
        self.ledger.record_instance(&started.uid, None).await?;
        started
            .task
            .add_important_info(SOURCE, "enclave deleted", instance_id);
        Ok(())
    }

    async fn wait_for_job(&self, task: &Task, job: &JobHandle) -> Result<()> {
        self.poller
            .poll_with_progress(job, self.config.poll, |attempt, status| {
                task.add_info(
                    SOURCE,
                    format!("job {job} is {} (attempt {attempt})", status.state),
                    status.progress.clone(),
                );
            })
            .await?;
        task.add_info(SOURCE, "hypervisor job succeeded", job.to_string());
        Ok(())
    }

    fn follow_enclave_log(&self, started: &StartedStage) -> CloudNotifier {
        CloudNotifier::new(
            &self.storage,
            started.cloud.alias_name.clone(),
            started.cloud.bucket.clone(),
            started.cloud.prefix.clone(),
            self.config.cloud.clone(),
        )
    }

    /// Copies every enclave log event into the task.
    ///
    /// The enclave's close events are recorded as important info; the task
    /// itself is closed by [`Workflow::finish`] from the returned outcome.
    async fn relay(&self, task: &Task, mut notifier: CloudNotifier) -> Result<()> {
        let mut last_error = String::new();
        while let Some(mut event) = notifier.next_event().await {
            match event.event_type {
                TaskEventType::Error | TaskEventType::CloseError => {
                    last_error = format!("{}: {}", event.message, event.details);
                }
                _ => {}
            }
            if event.is_close() {
                event.event_type = TaskEventType::ImportantInfo;
            }
            task.add_event(event);
        }

        match notifier.status() {
            CloudStatus::Done => Ok(()),
            status => Err(Error::EnclaveLog {
                status,
                message: last_error,
            }),
        }
    }

    /// Records the outcome on the ledger and closes the task.
    async fn finish(&self, started: &StartedStage, outcome: Result<()>) {
        let stage = started.stage;
        let outcome = match outcome {
            Ok(()) => self.ledger.record_status(&started.uid, stage.done()).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                started
                    .task
                    .close_ok(SOURCE, format!("{stage} done"), "");
            }
            Err(e) => {
                tracing::warn!(error = %e, "stage failed");
                let details = record_failure(
                    self.ledger.as_ref(),
                    &started.uid,
                    stage.errored(),
                    e.to_string(),
                )
                .await;
                started
                    .task
                    .close_error(SOURCE, format!("{stage} failed"), details);
            }
        }
    }
}
