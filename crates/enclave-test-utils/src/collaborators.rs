//! Scripted and recording doubles for the workflow's collaborators.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use enclave_core::ProjectUid;
use enclave_flow::error::{Error, Result};
use enclave_flow::executor::{CommandOutput, Executor};
use enclave_flow::hypervisor::{
    EnclaveProvisioner, JobHandle, JobState, JobStatus, JobStatusSource, ProvisionedEnclave,
};
use enclave_flow::ledger::ProjectLedger;
use enclave_flow::workflow::ProjectStatus;

/// Job handle [`FakeProvisioner`] returns for creations.
pub const CREATE_JOB: &str = "job-create";
/// Job handle [`FakeProvisioner`] returns for deletions.
pub const DELETE_JOB: &str = "job-delete";
/// Instance [`FakeProvisioner`] creates by default.
pub const INSTANCE_ID: &str = "vm-1";

/// Job status source that walks each job through a scripted list of states.
///
/// The last state of a script repeats forever. Unscripted jobs report
/// `success`.
#[derive(Debug, Default)]
pub struct ScriptedJobStatus {
    scripts: Mutex<HashMap<String, VecDeque<JobState>>>,
    polls: Mutex<HashMap<String, u32>>,
}

impl ScriptedJobStatus {
    /// Creates a source with no scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the states a job reports, in order.
    pub fn script(&self, job: &str, states: &[JobState]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(job.to_string(), states.iter().cloned().collect());
    }

    /// Number of times a job's status was fetched.
    pub fn polls(&self, job: &str) -> u32 {
        self.polls.lock().unwrap().get(job).copied().unwrap_or(0)
    }
}

#[async_trait]
impl JobStatusSource for ScriptedJobStatus {
    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus> {
        *self
            .polls
            .lock()
            .unwrap()
            .entry(job.as_str().to_string())
            .or_insert(0) += 1;

        let mut scripts = self.scripts.lock().unwrap();
        let state = match scripts.get_mut(job.as_str()) {
            Some(states) if states.len() > 1 => states.pop_front(),
            Some(states) => states.front().cloned(),
            None => None,
        };
        Ok(JobStatus::new(state.unwrap_or(JobState::Success)))
    }
}

/// What [`FakeProvisioner::create_enclave`] does.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// Starts a creation job.
    Started {
        /// Instance that will be created.
        instance_id: String,
        /// Job to poll.
        job: String,
    },
    /// Reports that the enclave already exists.
    Existing(String),
    /// Fails with a hypervisor error.
    Fails(String),
}

/// Hypervisor double with scripted outcomes.
#[derive(Debug)]
pub struct FakeProvisioner {
    jobs: ScriptedJobStatus,
    create: Mutex<CreateOutcome>,
    delete_failure: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self {
            jobs: ScriptedJobStatus::new(),
            create: Mutex::new(CreateOutcome::Started {
                instance_id: INSTANCE_ID.to_string(),
                job: CREATE_JOB.to_string(),
            }),
            delete_failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeProvisioner {
    /// Creates a provisioner whose jobs succeed immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the states a job reports, in order.
    pub fn script(&self, job: &str, states: &[JobState]) {
        self.jobs.script(job, states);
    }

    /// Changes what the next creations do.
    pub fn set_create(&self, outcome: CreateOutcome) {
        *self.create.lock().unwrap() = outcome;
    }

    /// Makes deletions fail with a hypervisor error.
    pub fn fail_delete(&self, message: &str) {
        *self.delete_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Calls received so far, as `create {uid}` or `delete {instance}`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of times a job's status was fetched.
    pub fn polls(&self, job: &str) -> u32 {
        self.jobs.polls(job)
    }
}

#[async_trait]
impl JobStatusSource for FakeProvisioner {
    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus> {
        self.jobs.job_status(job).await
    }
}

#[async_trait]
impl EnclaveProvisioner for FakeProvisioner {
    async fn create_enclave(&self, project: &ProjectUid) -> Result<ProvisionedEnclave> {
        self.calls.lock().unwrap().push(format!("create {project}"));
        let outcome = self.create.lock().unwrap().clone();
        match outcome {
            CreateOutcome::Started { instance_id, job } => {
                Ok(ProvisionedEnclave::started(instance_id, JobHandle::new(job)))
            }
            CreateOutcome::Existing(instance_id) => Ok(ProvisionedEnclave::existing(instance_id)),
            CreateOutcome::Fails(message) => Err(Error::hypervisor(message)),
        }
    }

    async fn delete_enclave(&self, instance_id: &str) -> Result<JobHandle> {
        self.calls.lock().unwrap().push(format!("delete {instance_id}"));
        let failure = self.delete_failure.lock().unwrap().clone();
        match failure {
            Some(message) => Err(Error::hypervisor(message)),
            None => Ok(JobHandle::new(DELETE_JOB)),
        }
    }
}

/// One call received by a [`RecordingLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    /// `record_status`.
    Status(ProjectUid, ProjectStatus),
    /// `record_instance`.
    Instance(ProjectUid, Option<String>),
    /// `update_attributes`.
    Attributes(ProjectUid, BTreeMap<String, String>),
}

/// Ledger double that records every call.
#[derive(Debug, Default)]
pub struct RecordingLedger {
    calls: Mutex<Vec<LedgerCall>>,
    failing: Mutex<HashSet<ProjectStatus>>,
    fail_attributes: Mutex<bool>,
}

impl RecordingLedger {
    /// Creates a ledger that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes recording `status` fail.
    pub fn fail_status(&self, status: ProjectStatus) {
        self.failing.lock().unwrap().insert(status);
    }

    /// Makes attribute updates fail.
    pub fn fail_attributes(&self) {
        *self.fail_attributes.lock().unwrap() = true;
    }

    /// Every call, oldest first.
    pub fn calls(&self) -> Vec<LedgerCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Statuses recorded for a project, oldest first.
    pub fn statuses(&self, project: &ProjectUid) -> Vec<ProjectStatus> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LedgerCall::Status(uid, status) if &uid == project => Some(status),
                _ => None,
            })
            .collect()
    }

    fn rejection(what: &str) -> Error {
        Error::Execution {
            command: format!("ledger {what}"),
            message: "transaction rejected".to_string(),
        }
    }
}

#[async_trait]
impl ProjectLedger for RecordingLedger {
    async fn record_status(&self, project: &ProjectUid, status: ProjectStatus) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(LedgerCall::Status(project.clone(), status));
        if self.failing.lock().unwrap().contains(&status) {
            return Err(Self::rejection(status.as_str()));
        }
        Ok(())
    }

    async fn record_instance(
        &self,
        project: &ProjectUid,
        instance_id: Option<&str>,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(LedgerCall::Instance(
            project.clone(),
            instance_id.map(str::to_string),
        ));
        Ok(())
    }

    async fn update_attributes(
        &self,
        project: &ProjectUid,
        attributes: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(LedgerCall::Attributes(project.clone(), attributes.clone()));
        if *self.fail_attributes.lock().unwrap() {
            return Err(Self::rejection("attributes"));
        }
        Ok(())
    }
}

/// Executor double that records invocations and replays scripted outputs.
///
/// Without a scripted output a command succeeds with empty output.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    replies: Mutex<VecDeque<CommandOutput>>,
    invocations: Mutex<Vec<Vec<String>>>,
}

impl RecordingExecutor {
    /// Creates an executor where every command succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the output of the next command.
    pub fn reply(&self, output: CommandOutput) {
        self.replies.lock().unwrap().push_back(output);
    }

    /// Every invocation as `[program, args...]`, oldest first.
    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut invocation = vec![program.to_string()];
        invocation.extend(args.iter().cloned());
        self.invocations.lock().unwrap().push(invocation);
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| CommandOutput {
                exit_code: Some(0),
                ..CommandOutput::default()
            }))
    }
}
