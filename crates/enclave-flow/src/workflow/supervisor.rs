//! Translation of a stage's task outcome into project and request status.
//!
//! Exactly one supervisor exists per request. It is the only writer of the
//! project status after the stage started, and the only caller of
//! `update_status_and_close` on the notifiers it was handed.

use std::sync::Arc;

use super::{ProjectHandle, ProjectStatus, RequestStatus, Stage};
use crate::metrics::{FlowMetrics, StageTimer};
use crate::notifier::StatusNotifier;
use crate::task::{Subscriber, TaskStatus};

pub(super) struct Supervision {
    pub(super) stage: Stage,
    pub(super) handle: ProjectHandle,
    pub(super) index: usize,
    pub(super) subscriber: Subscriber,
    pub(super) request_notifier: Arc<StatusNotifier>,
    pub(super) project_notifier: Arc<StatusNotifier>,
    pub(super) metrics: FlowMetrics,
    pub(super) timer: StageTimer,
}

pub(super) const fn outcome(stage: Stage, task: TaskStatus) -> (ProjectStatus, RequestStatus) {
    match task {
        TaskStatus::Finished => (stage.done(), RequestStatus::Done),
        TaskStatus::Errored | TaskStatus::Working => (stage.errored(), RequestStatus::Errored),
    }
}

pub(super) async fn supervise(supervision: Supervision) {
    let Supervision {
        stage,
        handle,
        index,
        mut subscriber,
        request_notifier,
        project_notifier,
        metrics,
        timer,
    } = supervision;

    let task_status = subscriber.wait_done().await;
    let (project_status, request_status) = outcome(stage, task_status);

    // Status and notifiers change under the project lock so the next stage
    // never observes one without the other.
    let mut project = handle.lock().await;
    project.status = project_status;
    if let Some(request) = project.requests.get_mut(index) {
        request.status = request_status;
    }
    request_notifier.update_status_and_close(request_status.as_str());
    project_notifier.update_status_and_close(project_status.as_str());
    drop(project);

    metrics.record_stage(stage.name(), request_status.as_str(), timer.elapsed());
    tracing::info!(
        stage = stage.name(),
        request = index,
        %project_status,
        %request_status,
        "stage finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::workflow::{CloudAttributes, Project, Request};
    use enclave_core::ProjectUid;
    use tokio::sync::Mutex;

    struct Fixture {
        handle: ProjectHandle,
        task: Arc<Task>,
        project_notifier: Arc<StatusNotifier>,
        request_notifier: Arc<StatusNotifier>,
        join: tokio::task::JoinHandle<()>,
    }

    fn start(stage: Stage) -> Fixture {
        let uid = ProjectUid::generate();
        let mut project = Project::new(uid.clone(), "demo");
        let task = Arc::new(Task::new(0, "prepare enclave"));
        let request_notifier = Arc::new(StatusNotifier::new("running"));
        let project_notifier = Arc::new(StatusNotifier::new(stage.in_progress().as_str()));
        project.status = stage.in_progress();
        project.status_notifier = Arc::clone(&project_notifier);
        project.requests.push(Request {
            description: stage.description().to_string(),
            status: RequestStatus::Running,
            task: Arc::clone(&task),
            status_notifier: Arc::clone(&request_notifier),
            index: 0,
            cloud: CloudAttributes::for_request("dedis", &uid, 0),
        });
        let handle = Arc::new(Mutex::new(project));

        let join = tokio::spawn(supervise(Supervision {
            stage,
            handle: Arc::clone(&handle),
            index: 0,
            subscriber: task.subscribe(),
            request_notifier: Arc::clone(&request_notifier),
            project_notifier: Arc::clone(&project_notifier),
            metrics: FlowMetrics::new(),
            timer: StageTimer::start(),
        }));

        Fixture {
            handle,
            task,
            project_notifier,
            request_notifier,
            join,
        }
    }

    fn drain(subscriber: &mut crate::notifier::StatusSubscriber) -> Vec<String> {
        let mut statuses = Vec::new();
        while let Some(status) = subscriber.try_next_status() {
            statuses.push(status);
        }
        statuses
    }

    #[tokio::test]
    async fn close_ok_marks_stage_done() {
        let fixture = start(Stage::PrepareEnclave);
        let mut project_sub = fixture.project_notifier.subscribe();
        let mut request_sub = fixture.request_notifier.subscribe();

        fixture.task.add_info("test", "working", "");
        fixture.task.close_ok("test", "done", "");
        fixture.join.await.unwrap();

        let project = fixture.handle.lock().await;
        assert_eq!(project.status, ProjectStatus::PreparingEnclaveDone);
        assert_eq!(project.requests[0].status, RequestStatus::Done);
        assert_eq!(drain(&mut project_sub), vec!["preparingEnclaveDone"]);
        assert!(project_sub.is_closed());
        assert_eq!(drain(&mut request_sub), vec!["done"]);
        assert!(fixture.project_notifier.is_terminated());
    }

    #[tokio::test]
    async fn close_error_marks_stage_errored() {
        let fixture = start(Stage::PrepareEnclave);
        let mut project_sub = fixture.project_notifier.subscribe();

        fixture.task.close_error("test", "hypervisor unreachable", "");
        fixture.join.await.unwrap();

        let project = fixture.handle.lock().await;
        assert_eq!(project.status, ProjectStatus::PreparingEnclaveErrored);
        assert_eq!(project.requests[0].status, RequestStatus::Errored);
        assert_eq!(drain(&mut project_sub), vec!["preparingEnclaveErrored"]);
        assert!(project_sub.is_closed());
        // The supervisor already terminated the notifier.
        assert!(!fixture.project_notifier.update_status_and_close("again"));
    }

    #[test]
    fn outcome_mapping_per_stage() {
        assert_eq!(
            outcome(Stage::UpdateAttributes, TaskStatus::Finished),
            (ProjectStatus::AttributesUpdated, RequestStatus::Done)
        );
        assert_eq!(
            outcome(Stage::UnlockEnclave, TaskStatus::Errored),
            (ProjectStatus::UnlockingEnclaveErrored, RequestStatus::Errored)
        );
        assert_eq!(
            outcome(Stage::DeleteEnclave, TaskStatus::Finished),
            (ProjectStatus::DeletingEnclaveDone, RequestStatus::Done)
        );
    }
}
