//! End-to-end tests of the project workflow against scripted collaborators.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use enclave_core::{MemoryBackend, MemoryObjectStore, ProjectUid};
use enclave_flow::cloud::{CloudNotifierConfig, CloudStatus};
use enclave_flow::event::{TaskEvent, TaskEventType};
use enclave_flow::hypervisor::{EnclaveProvisioner, JobState};
use enclave_flow::ledger::ProjectLedger;
use enclave_flow::poller::PollPolicy;
use enclave_flow::snapshot::WorkflowSnapshot;
use enclave_flow::task::{Task, TaskStatus};
use enclave_flow::workflow::{
    ProjectStatus, ProjectView, RequestStatus, Workflow, WorkflowConfig,
};
use enclave_flow::Error;
use enclave_test_utils::{
    init_test_logging, memory_registry, write_log_event, CreateOutcome, FakeProvisioner,
    LedgerCall, RecordingLedger, CREATE_JOB, INSTANCE_ID, LOG_ALIAS,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    workflow: Workflow,
    provisioner: Arc<FakeProvisioner>,
    ledger: Arc<RecordingLedger>,
    store: Arc<MemoryObjectStore>,
}

fn config() -> WorkflowConfig {
    WorkflowConfig {
        poll: PollPolicy {
            retry_budget: 5,
            initial_wait: Duration::from_millis(1),
            growth_factor: 1.0,
        },
        cloud: CloudNotifierConfig {
            bucket_attempts: 3,
            bucket_retry_delay: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(5),
        },
        storage_alias: LOG_ALIAS.to_string(),
    }
}

fn harness() -> Harness {
    init_test_logging();
    let store = Arc::new(MemoryObjectStore::new());
    let provisioner = Arc::new(FakeProvisioner::new());
    let ledger = Arc::new(RecordingLedger::new());
    let workflow = Workflow::new(
        memory_registry(&store),
        Arc::clone(&provisioner) as Arc<dyn EnclaveProvisioner>,
        Arc::clone(&ledger) as Arc<dyn ProjectLedger>,
        config(),
    );
    Harness {
        workflow,
        provisioner,
        ledger,
        store,
    }
}

async fn new_project(workflow: &Workflow) -> ProjectUid {
    workflow.create_project("demo").await.unwrap().uid
}

/// Waits until the running stage's supervisor closed the project notifier.
async fn settle(workflow: &Workflow, uid: &ProjectUid) -> ProjectView {
    let (_, mut statuses) = workflow.subscribe_status(uid).await.unwrap();
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while statuses.next_status().await.is_some() {}
    })
    .await
    .expect("stage settles");
    workflow.project(uid).await.unwrap()
}

async fn wait_for_message(task: &Task, needle: &str) {
    let mut subscriber = task.subscribe();
    if subscriber
        .past_events()
        .iter()
        .any(|event| event.message.contains(needle))
    {
        return;
    }
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while let Some(event) = subscriber.next_event().await {
            if event.message.contains(needle) {
                return;
            }
        }
        panic!("task closed before '{needle}'");
    })
    .await
    .expect("message arrives");
}

fn request_task(workflow: &Workflow, view: &ProjectView, index: usize) -> Arc<Task> {
    workflow.tasks().get(view.requests[index].task_id).unwrap()
}

async fn prepared(h: &Harness) -> ProjectUid {
    let uid = new_project(&h.workflow).await;
    h.workflow.prepare_enclave(&uid).await.unwrap();
    let view = settle(&h.workflow, &uid).await;
    assert_eq!(view.status, ProjectStatus::PreparingEnclaveDone);
    uid
}

fn attributes() -> BTreeMap<String, String> {
    BTreeMap::from([("threshold".to_string(), "3".to_string())])
}

fn enclave_event(event_type: TaskEventType, message: &str) -> TaskEvent {
    TaskEvent::new(event_type, "enclave", message, "")
}

async fn log_bucket(h: &Harness, uid: &ProjectUid) -> Arc<MemoryBackend> {
    h.store.create_bucket(uid.as_str()).unwrap()
}

#[tokio::test]
async fn prepare_enclave_polls_job_until_success() {
    let h = harness();
    h.provisioner.script(
        CREATE_JOB,
        &[JobState::Queued, JobState::Running, JobState::Success],
    );
    let uid = new_project(&h.workflow).await;

    let request = h.workflow.prepare_enclave(&uid).await.unwrap();
    assert_eq!(request.index, 0);
    assert_eq!(request.status, RequestStatus::Running);

    let view = settle(&h.workflow, &uid).await;
    assert_eq!(view.status, ProjectStatus::PreparingEnclaveDone);
    assert_eq!(view.instance_id.as_deref(), Some(INSTANCE_ID));
    assert_eq!(view.requests[0].status, RequestStatus::Done);
    assert_eq!(view.requests[0].task_status, TaskStatus::Finished);
    assert_eq!(h.provisioner.polls(CREATE_JOB), 3);

    let task = request_task(&h.workflow, &view, 0);
    let progress = task
        .history()
        .iter()
        .filter(|event| event.message.contains("attempt"))
        .count();
    assert_eq!(progress, 2);
    assert_eq!(task.last_event().unwrap().event_type, TaskEventType::CloseOk);

    assert_eq!(
        h.ledger.statuses(&uid),
        vec![
            ProjectStatus::PreparingEnclave,
            ProjectStatus::PreparingEnclaveDone
        ]
    );
    assert!(h
        .ledger
        .calls()
        .contains(&LedgerCall::Instance(uid.clone(), Some(INSTANCE_ID.to_string()))));
}

#[tokio::test]
async fn prepare_enclave_reuses_existing_enclave() {
    let h = harness();
    h.provisioner
        .set_create(CreateOutcome::Existing("vm-7".to_string()));
    let uid = new_project(&h.workflow).await;

    h.workflow.prepare_enclave(&uid).await.unwrap();
    let view = settle(&h.workflow, &uid).await;

    assert_eq!(view.status, ProjectStatus::PreparingEnclaveDone);
    assert_eq!(view.instance_id.as_deref(), Some("vm-7"));
    assert_eq!(h.provisioner.polls(CREATE_JOB), 0);
    let task = request_task(&h.workflow, &view, 0);
    assert!(task.history().iter().any(|event| {
        event.event_type == TaskEventType::ImportantInfo
            && event.message == "enclave already exists"
    }));
}

#[tokio::test]
async fn failed_job_marks_stage_errored() {
    let h = harness();
    h.provisioner.script(
        CREATE_JOB,
        &[JobState::Running, JobState::parse("failed")],
    );
    let uid = new_project(&h.workflow).await;

    h.workflow.prepare_enclave(&uid).await.unwrap();
    let view = settle(&h.workflow, &uid).await;

    assert_eq!(view.status, ProjectStatus::PreparingEnclaveErrored);
    assert_eq!(view.instance_id, None);
    assert_eq!(view.requests[0].status, RequestStatus::Errored);
    let task = request_task(&h.workflow, &view, 0);
    assert_eq!(task.status(), TaskStatus::Errored);
    let close = task.last_event().unwrap();
    assert_eq!(close.event_type, TaskEventType::CloseError);
    assert!(close.details.contains("failed"), "{}", close.details);
    assert_eq!(
        h.ledger.statuses(&uid).last(),
        Some(&ProjectStatus::PreparingEnclaveErrored)
    );
}

#[tokio::test]
async fn exhausted_job_is_reported_as_giving_up() {
    let h = harness();
    h.provisioner.script(CREATE_JOB, &[JobState::Running]);
    let uid = new_project(&h.workflow).await;

    h.workflow.prepare_enclave(&uid).await.unwrap();
    let view = settle(&h.workflow, &uid).await;

    assert_eq!(view.status, ProjectStatus::PreparingEnclaveErrored);
    assert_eq!(h.provisioner.polls(CREATE_JOB), 5);
    let close = request_task(&h.workflow, &view, 0).last_event().unwrap();
    assert!(close.details.contains("gave up"), "{}", close.details);
}

#[tokio::test]
async fn failed_error_status_update_is_appended_to_details() {
    let h = harness();
    h.provisioner
        .set_create(CreateOutcome::Fails("hypervisor offline".to_string()));
    h.ledger.fail_status(ProjectStatus::PreparingEnclaveErrored);
    let uid = new_project(&h.workflow).await;

    h.workflow.prepare_enclave(&uid).await.unwrap();
    let view = settle(&h.workflow, &uid).await;

    assert_eq!(view.status, ProjectStatus::PreparingEnclaveErrored);
    let close = request_task(&h.workflow, &view, 0).last_event().unwrap();
    assert!(close.details.contains("hypervisor offline"));
    assert!(close
        .details
        .contains("; additionally failed to record status: "));
}

#[tokio::test]
async fn invalid_transition_creates_no_task() {
    let h = harness();
    let uid = new_project(&h.workflow).await;

    let err = h.workflow.unlock_enclave(&uid).await.unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }), "{err}");
    let err = h.workflow.delete_enclave(&uid).await.unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }), "{err}");

    assert!(h.workflow.tasks().list().unwrap().is_empty());
    let view = h.workflow.project(&uid).await.unwrap();
    assert_eq!(view.status, ProjectStatus::Initialized);
    assert!(view.requests.is_empty());
}

#[tokio::test]
async fn stage_cannot_start_while_another_runs() {
    let h = harness();
    h.provisioner.script(
        CREATE_JOB,
        &[JobState::Queued, JobState::Queued, JobState::Success],
    );
    let uid = new_project(&h.workflow).await;

    h.workflow.prepare_enclave(&uid).await.unwrap();
    let err = h.workflow.prepare_enclave(&uid).await.unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }), "{err}");

    let view = settle(&h.workflow, &uid).await;
    assert_eq!(view.requests.len(), 1);
    assert_eq!(view.status, ProjectStatus::PreparingEnclaveDone);
}

#[tokio::test]
async fn unknown_project_is_not_found() {
    let h = harness();
    let err = h
        .workflow
        .prepare_enclave(&ProjectUid::generate())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn failed_stage_can_be_retried() {
    let h = harness();
    h.provisioner
        .set_create(CreateOutcome::Fails("no capacity".to_string()));
    let uid = new_project(&h.workflow).await;

    h.workflow.prepare_enclave(&uid).await.unwrap();
    assert_eq!(
        settle(&h.workflow, &uid).await.status,
        ProjectStatus::PreparingEnclaveErrored
    );

    h.provisioner.set_create(CreateOutcome::Started {
        instance_id: INSTANCE_ID.to_string(),
        job: CREATE_JOB.to_string(),
    });
    let retry = h.workflow.prepare_enclave(&uid).await.unwrap();
    assert_eq!(retry.index, 1);

    let view = settle(&h.workflow, &uid).await;
    assert_eq!(view.status, ProjectStatus::PreparingEnclaveDone);
    let statuses: Vec<RequestStatus> = view.requests.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![RequestStatus::Errored, RequestStatus::Done]);
    assert_eq!(h.workflow.tasks().list().unwrap().len(), 2);
}

#[tokio::test]
async fn status_subscribers_receive_final_status_once() {
    let h = harness();
    h.provisioner.script(
        CREATE_JOB,
        &[JobState::Queued, JobState::Success],
    );
    let uid = new_project(&h.workflow).await;
    h.workflow.prepare_enclave(&uid).await.unwrap();

    let (current, mut statuses) = h.workflow.subscribe_status(&uid).await.unwrap();
    assert_eq!(current, ProjectStatus::PreparingEnclave);

    let mut seen = Vec::new();
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while let Some(status) = statuses.next_status().await {
            seen.push(status);
        }
    })
    .await
    .unwrap();
    assert_eq!(seen, vec!["preparingEnclaveDone".to_string()]);
    assert!(statuses.is_closed());
}

#[tokio::test]
async fn status_stream_opened_before_first_stage_sees_its_outcome() {
    let h = harness();
    let uid = new_project(&h.workflow).await;
    let (current, mut statuses) = h.workflow.subscribe_status(&uid).await.unwrap();
    assert_eq!(current, ProjectStatus::Initialized);

    h.workflow.prepare_enclave(&uid).await.unwrap();

    let mut seen = Vec::new();
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while let Some(status) = statuses.next_status().await {
            seen.push(status);
        }
    })
    .await
    .unwrap();
    assert_eq!(seen, vec!["preparingEnclave", "preparingEnclaveDone"]);
    assert!(statuses.is_closed());

    let view = h.workflow.project(&uid).await.unwrap();
    assert_eq!(view.status, ProjectStatus::PreparingEnclaveDone);
}

#[tokio::test]
async fn update_attributes_follows_enclave_log() {
    let h = harness();
    let uid = prepared(&h).await;
    let bucket = log_bucket(&h, &uid).await;

    let request = h
        .workflow
        .update_attributes(&uid, attributes())
        .await
        .unwrap();
    assert_eq!(request.cloud.prefix, "logs/1");
    let task = h.workflow.tasks().get(request.task_id).unwrap();
    wait_for_message(&task, "attributes submitted").await;

    write_log_event(
        &bucket,
        "logs/1",
        "0001",
        &enclave_event(TaskEventType::Info, "applying attributes"),
    )
    .await;
    write_log_event(
        &bucket,
        "logs/1",
        "0002",
        &enclave_event(TaskEventType::CloseOk, "attributes applied"),
    )
    .await;

    let view = settle(&h.workflow, &uid).await;
    assert_eq!(view.status, ProjectStatus::AttributesUpdated);
    assert_eq!(task.status(), TaskStatus::Finished);

    let history = task.history();
    assert!(history.iter().any(|e| e.message == "applying attributes"));
    assert!(history.iter().any(|e| {
        e.message == "attributes applied" && e.event_type == TaskEventType::ImportantInfo
    }));
    assert_eq!(
        history.iter().filter(|e| e.is_close()).count(),
        1,
        "only the workflow closes the task"
    );
    assert!(h
        .ledger
        .calls()
        .contains(&LedgerCall::Attributes(uid.clone(), attributes())));

    let (events, status) = h.workflow.request_logs(&uid, 1).await.unwrap();
    assert_eq!(status, CloudStatus::Done);
    assert_eq!(events[0].message, "attributes applied");
    assert_eq!(events[1].message, "applying attributes");
}

#[tokio::test]
async fn unlock_fails_when_enclave_reports_error() {
    let h = harness();
    let uid = prepared(&h).await;
    let bucket = log_bucket(&h, &uid).await;

    let request = h
        .workflow
        .update_attributes(&uid, attributes())
        .await
        .unwrap();
    let task = h.workflow.tasks().get(request.task_id).unwrap();
    wait_for_message(&task, "attributes submitted").await;
    write_log_event(
        &bucket,
        "logs/1",
        "0001",
        &enclave_event(TaskEventType::CloseOk, "attributes applied"),
    )
    .await;
    assert_eq!(
        settle(&h.workflow, &uid).await.status,
        ProjectStatus::AttributesUpdated
    );

    let request = h.workflow.unlock_enclave(&uid).await.unwrap();
    let task = h.workflow.tasks().get(request.task_id).unwrap();
    wait_for_message(&task, "unlock submitted").await;
    write_log_event(
        &bucket,
        "logs/2",
        "0001",
        &enclave_event(TaskEventType::CloseError, "threshold not reached"),
    )
    .await;

    let view = settle(&h.workflow, &uid).await;
    assert_eq!(view.status, ProjectStatus::UnlockingEnclaveErrored);
    assert_eq!(view.requests[2].status, RequestStatus::Errored);
    let close = task.last_event().unwrap();
    assert_eq!(close.event_type, TaskEventType::CloseError);
    assert!(close.details.contains("threshold not reached"), "{}", close.details);

    // Errored unlock may be retried, or attributes updated again.
    h.workflow.unlock_enclave(&uid).await.unwrap();
}

#[tokio::test]
async fn already_closed_log_skips_submission() {
    let h = harness();
    let uid = prepared(&h).await;
    let bucket = log_bucket(&h, &uid).await;
    write_log_event(
        &bucket,
        "logs/1",
        "0001",
        &enclave_event(TaskEventType::CloseOk, "applied earlier"),
    )
    .await;

    h.workflow
        .update_attributes(&uid, attributes())
        .await
        .unwrap();
    let view = settle(&h.workflow, &uid).await;

    assert_eq!(view.status, ProjectStatus::AttributesUpdated);
    assert!(!h
        .ledger
        .calls()
        .iter()
        .any(|call| matches!(call, LedgerCall::Attributes(..))));
}

#[tokio::test]
async fn missing_log_bucket_errors_attribute_update() {
    let h = harness();
    let uid = prepared(&h).await;

    h.workflow
        .update_attributes(&uid, attributes())
        .await
        .unwrap();
    let view = settle(&h.workflow, &uid).await;

    assert_eq!(view.status, ProjectStatus::AttributesUpdatedErrored);
    let task = request_task(&h.workflow, &view, 1);
    assert!(task
        .history()
        .iter()
        .any(|e| e.message == "enclave log bucket never appeared"));
}

#[tokio::test]
async fn empty_attributes_error_the_stage() {
    let h = harness();
    let uid = prepared(&h).await;

    h.workflow
        .update_attributes(&uid, BTreeMap::new())
        .await
        .unwrap();
    let view = settle(&h.workflow, &uid).await;

    assert_eq!(view.status, ProjectStatus::AttributesUpdatedErrored);
    let close = request_task(&h.workflow, &view, 1).last_event().unwrap();
    assert!(close.details.contains("no attributes"), "{}", close.details);
}

#[tokio::test]
async fn delete_enclave_clears_instance() {
    let h = harness();
    let uid = prepared(&h).await;

    h.workflow.delete_enclave(&uid).await.unwrap();
    let view = settle(&h.workflow, &uid).await;

    assert_eq!(view.status, ProjectStatus::DeletingEnclaveDone);
    assert_eq!(view.instance_id, None);
    assert!(h
        .provisioner
        .calls()
        .contains(&format!("delete {INSTANCE_ID}")));
    assert!(h
        .ledger
        .calls()
        .contains(&LedgerCall::Instance(uid.clone(), None)));

    // A deleted enclave can be prepared again.
    h.workflow.prepare_enclave(&uid).await.unwrap();
    assert_eq!(
        settle(&h.workflow, &uid).await.status,
        ProjectStatus::PreparingEnclaveDone
    );
}

#[tokio::test]
async fn delete_without_instance_errors() {
    let h = harness();
    h.provisioner
        .set_create(CreateOutcome::Fails("no capacity".to_string()));
    let uid = new_project(&h.workflow).await;
    h.workflow.prepare_enclave(&uid).await.unwrap();
    settle(&h.workflow, &uid).await;

    h.workflow.delete_enclave(&uid).await.unwrap();
    let view = settle(&h.workflow, &uid).await;

    assert_eq!(view.status, ProjectStatus::DeletingEnclaveErrored);
    assert!(!h
        .provisioner
        .calls()
        .iter()
        .any(|call| call.starts_with("delete")));
}

#[tokio::test]
async fn failed_delete_keeps_instance() {
    let h = harness();
    let uid = prepared(&h).await;
    h.provisioner.fail_delete("instance locked");

    h.workflow.delete_enclave(&uid).await.unwrap();
    let view = settle(&h.workflow, &uid).await;

    assert_eq!(view.status, ProjectStatus::DeletingEnclaveErrored);
    assert_eq!(view.instance_id.as_deref(), Some(INSTANCE_ID));
}

#[tokio::test]
async fn snapshot_restores_projects_and_tasks() {
    let h = harness();
    let uid = prepared(&h).await;
    let state = MemoryBackend::new();
    h.workflow.persist(&state).await.unwrap();

    let snapshot = WorkflowSnapshot::load(&state).await.unwrap().unwrap();
    let restored = harness().workflow.restore(snapshot).unwrap();

    let before = h.workflow.project(&uid).await.unwrap();
    let after = restored.project(&uid).await.unwrap();
    assert_eq!(before, after);

    let task = request_task(&restored, &after, 0);
    assert_eq!(task.status(), TaskStatus::Finished);
    assert_eq!(task.history(), request_task(&h.workflow, &before, 0).history());

    let (status, statuses) = restored.subscribe_status(&uid).await.unwrap();
    assert_eq!(status, ProjectStatus::PreparingEnclaveDone);
    assert!(statuses.is_closed());

    // New tasks continue the index sequence.
    restored.delete_enclave(&uid).await.unwrap();
    let view = settle(&restored, &uid).await;
    assert_eq!(view.status, ProjectStatus::DeletingEnclaveDone);
    assert_eq!(request_task(&restored, &view, 1).index(), 1);
}

#[tokio::test]
async fn snapshot_with_unknown_task_is_rejected() {
    let h = harness();
    prepared(&h).await;
    let mut snapshot = h.workflow.snapshot().await.unwrap();
    snapshot.tasks.clear();

    let err = harness().workflow.restore(snapshot).unwrap_err();
    assert!(matches!(err, Error::TaskNotFound { .. }), "{err}");
}
