//! Ledger collaborator recording project state.
//!
//! The ledger is an append-only store of project records reached through a
//! transaction submitter. The workflow only needs to push status changes,
//! the enclave instance and attribute updates into it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use enclave_core::ProjectUid;

use crate::error::Result;
use crate::executor::{Executor, run_checked};
use crate::workflow::ProjectStatus;

/// Writes project records to the ledger.
#[async_trait]
pub trait ProjectLedger: Send + Sync {
    /// Records a lifecycle status.
    async fn record_status(&self, project: &ProjectUid, status: ProjectStatus) -> Result<()>;

    /// Records the enclave instance, or clears it with `None`.
    async fn record_instance(&self, project: &ProjectUid, instance_id: Option<&str>)
    -> Result<()>;

    /// Writes attributes the enclave will pick up.
    async fn update_attributes(
        &self,
        project: &ProjectUid,
        attributes: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Records an error status without losing the original failure.
///
/// Returns `original` if the status was recorded, or `original` with the
/// recording failure appended otherwise.
pub async fn record_failure(
    ledger: &dyn ProjectLedger,
    project: &ProjectUid,
    status: ProjectStatus,
    original: String,
) -> String {
    match ledger.record_status(project, status).await {
        Ok(()) => original,
        Err(secondary) => {
            tracing::warn!(
                project = %project,
                %status,
                error = %secondary,
                "failed to record error status"
            );
            format!("{original}; additionally failed to record status: {secondary}")
        }
    }
}

/// [`ProjectLedger`] submitting transactions through a command line tool.
///
/// Runs `{program} project {uid} <verb> <args...>`.
#[derive(Clone)]
pub struct CliLedger {
    executor: Arc<dyn Executor>,
    program: String,
}

impl std::fmt::Debug for CliLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliLedger")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl CliLedger {
    /// Creates a ledger client running `program` through `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, program: impl Into<String>) -> Self {
        Self {
            executor,
            program: program.into(),
        }
    }

    async fn submit(&self, project: &ProjectUid, verb: &str, rest: Vec<String>) -> Result<()> {
        let mut args = vec![
            "project".to_string(),
            project.to_string(),
            verb.to_string(),
        ];
        args.extend(rest);
        run_checked(self.executor.as_ref(), &self.program, &args).await?;
        tracing::debug!(project = %project, verb, "ledger transaction submitted");
        Ok(())
    }
}

#[async_trait]
impl ProjectLedger for CliLedger {
    async fn record_status(&self, project: &ProjectUid, status: ProjectStatus) -> Result<()> {
        self.submit(project, "status", vec![status.as_str().to_string()])
            .await
    }

    async fn record_instance(
        &self,
        project: &ProjectUid,
        instance_id: Option<&str>,
    ) -> Result<()> {
        let arg = instance_id.map_or_else(|| "--clear".to_string(), str::to_string);
        self.submit(project, "instance", vec![arg]).await
    }

    async fn update_attributes(
        &self,
        project: &ProjectUid,
        attributes: &BTreeMap<String, String>,
    ) -> Result<()> {
        let pairs = attributes
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        self.submit(project, "attributes", pairs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandOutput;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        fail: bool,
    }

    #[async_trait]
    impl Executor for Recording {
        async fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            Ok(CommandOutput {
                exit_code: Some(i32::from(self.fail)),
                stdout: String::new(),
                stderr: if self.fail { "tx rejected".into() } else { String::new() },
            })
        }
    }

    fn uid() -> ProjectUid {
        "project-one".parse().unwrap()
    }

    #[tokio::test]
    async fn status_is_submitted_with_wire_string() {
        let executor = Arc::new(Recording::default());
        let ledger = CliLedger::new(executor.clone(), "ledger-cli");

        ledger
            .record_status(&uid(), ProjectStatus::PreparingEnclaveDone)
            .await
            .unwrap();

        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls[0].0, "ledger-cli");
        assert_eq!(
            calls[0].1,
            vec!["project", "project-one", "status", "preparingEnclaveDone"]
        );
    }

    #[tokio::test]
    async fn attributes_are_sorted_pairs() {
        let executor = Arc::new(Recording::default());
        let ledger = CliLedger::new(executor.clone(), "ledger-cli");
        let attributes = BTreeMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);

        ledger.update_attributes(&uid(), &attributes).await.unwrap();
        ledger.record_instance(&uid(), None).await.unwrap();

        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls[0].1[3..], ["a=1", "b=2"]);
        assert_eq!(calls[1].1[2..], ["instance", "--clear"]);
    }

    #[tokio::test]
    async fn failed_secondary_update_is_appended() {
        let executor = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let ledger = CliLedger::new(executor, "ledger-cli");

        let message = record_failure(
            &ledger,
            &uid(),
            ProjectStatus::PreparingEnclaveErrored,
            "hypervisor unreachable".to_string(),
        )
        .await;

        assert!(message.starts_with("hypervisor unreachable; additionally failed to record status:"));
        assert!(message.contains("tx rejected"));
    }

    #[tokio::test]
    async fn successful_secondary_update_keeps_message() {
        let ledger = CliLedger::new(Arc::new(Recording::default()), "ledger-cli");
        let message = record_failure(
            &ledger,
            &uid(),
            ProjectStatus::DeletingEnclaveErrored,
            "boom".to_string(),
        )
        .await;
        assert_eq!(message, "boom");
    }
}
