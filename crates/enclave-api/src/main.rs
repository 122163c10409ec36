//! `enclave-api` binary entrypoint.
//!
//! Loads configuration from environment variables, restores the last
//! workflow snapshot and starts the HTTP server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Result;

use enclave_api::config::Config;
use enclave_api::server::Server;
use enclave_core::{
    init_logging, MemoryBackend, MemoryObjectStore, ObjectStoreBackend, ObjectStoreProvider,
    S3ObjectStore, StorageBackend, StorageRegistry,
};
use enclave_flow::executor::CommandExecutor;
use enclave_flow::hypervisor::HttpHypervisor;
use enclave_flow::ledger::CliLedger;
use enclave_flow::snapshot::WorkflowSnapshot;
use enclave_flow::workflow::Workflow;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(config.log_format());

    let Some(hypervisor_url) = config.hypervisor_url.clone() else {
        anyhow::bail!("ENCLAVE_HYPERVISOR_URL is required");
    };

    let logs: Arc<dyn ObjectStoreProvider> = match config.s3_endpoint.clone() {
        Some(endpoint) => {
            tracing::info!(%endpoint, alias = %config.storage_alias, "Using S3 enclave logs");
            Arc::new(S3ObjectStore::new(Some(endpoint)))
        }
        None if config.debug => {
            tracing::warn!("ENCLAVE_S3_ENDPOINT not set; using in-memory enclave logs (debug only)");
            Arc::new(MemoryObjectStore::new())
        }
        None => Arc::new(S3ObjectStore::new(None)),
    };
    let registry = StorageRegistry::new().with_provider(config.storage_alias.clone(), logs);

    let state_backend: Arc<dyn StorageBackend> = if let Some(bucket) = config.state_bucket.as_deref() {
        tracing::info!(bucket = %bucket, "Using object storage for workflow snapshots");
        Arc::new(ObjectStoreBackend::s3(bucket, config.s3_endpoint.as_deref())?)
    } else {
        if !config.debug {
            anyhow::bail!("ENCLAVE_STATE_BUCKET is required when ENCLAVE_DEBUG=false");
        }
        tracing::warn!("ENCLAVE_STATE_BUCKET not set; workflow state is not persisted (debug only)");
        Arc::new(MemoryBackend::new())
    };

    let ledger = CliLedger::new(Arc::new(CommandExecutor::new()), config.ledger_program.clone());
    let mut workflow = Workflow::new(
        registry,
        Arc::new(HttpHypervisor::new(hypervisor_url)),
        Arc::new(ledger),
        config.workflow_config(),
    );
    if let Some(snapshot) = WorkflowSnapshot::load(state_backend.as_ref()).await? {
        tracing::info!(
            tasks = snapshot.tasks.len(),
            projects = snapshot.projects.len(),
            "Restoring workflow snapshot"
        );
        workflow = workflow.restore(snapshot)?;
    }

    let server = Server::new(config, workflow, state_backend);
    server.serve().await?;
    Ok(())
}
