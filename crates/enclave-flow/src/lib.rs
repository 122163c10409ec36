//! # enclave-flow
//!
//! Task orchestration and notification for remote enclave lifecycles.
//!
//! This crate provides:
//!
//! - **Task Log**: Append-only event history per task with live fan-out to
//!   subscribers that join at any time
//! - **Status Broadcast**: One-shot terminal status notifications for
//!   observers of a running stage
//! - **Enclave Log Relay**: Turns objects an enclave writes to a bucket into
//!   task events, with bucket wait and idle timeout
//! - **Job Polling**: Bounded retries with geometric backoff against the
//!   hypervisor's job status endpoint
//! - **Project Workflow**: Create, configure, unlock and delete an enclave,
//!   one supervised stage at a time
//!
//! ## Guarantees
//!
//! - **Ordered**: Every subscriber sees events in append order, past events
//!   before live ones
//! - **Terminal**: A closed task accepts no further events and every
//!   subscriber observes the close
//! - **Total**: Every stage ends with a terminal task event and a terminal
//!   project status, whatever fails along the way
//!
//! ## Example
//!
//! ```rust
//! use enclave_flow::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let manager = TaskManager::new();
//! let task = manager.new_task("prepare enclave")?;
//! task.add_info("hypervisor", "creating enclave", "");
//!
//! let late = task.subscribe();
//! assert_eq!(late.past_events().len(), 1);
//!
//! task.close_ok("hypervisor", "enclave ready", "");
//! assert_eq!(task.status(), TaskStatus::Finished);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cloud;
pub mod error;
pub mod event;
pub mod executor;
pub mod hypervisor;
pub mod ledger;
pub mod manager;
pub mod metrics;
pub mod notifier;
pub mod poller;
pub mod snapshot;
pub mod stream;
pub mod task;
pub mod workflow;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cloud::{CloudNotifier, CloudNotifierConfig, CloudStatus};
    pub use crate::error::{Error, Result};
    pub use crate::event::{TaskEvent, TaskEventType};
    pub use crate::hypervisor::{
        EnclaveProvisioner, HttpHypervisor, JobHandle, JobState, JobStatus, JobStatusSource,
        ProvisionedEnclave,
    };
    pub use crate::ledger::{CliLedger, ProjectLedger};
    pub use crate::manager::TaskManager;
    pub use crate::notifier::{StatusNotifier, StatusSubscriber};
    pub use crate::poller::{PollPolicy, RemoteJobPoller};
    pub use crate::snapshot::WorkflowSnapshot;
    pub use crate::task::{Subscriber, Task, TaskRecord, TaskStatus};
    pub use crate::workflow::{
        Project, ProjectStatus, ProjectView, RequestStatus, RequestView, Stage, Workflow,
        WorkflowConfig,
    };
}

pub use error::{Error, Result};
