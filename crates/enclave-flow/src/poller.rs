//! Bounded-retry polling of remote asynchronous jobs.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::hypervisor::{JobHandle, JobState, JobStatus, JobStatusSource};
use crate::metrics::FlowMetrics;

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Maximum number of status fetches.
    pub retry_budget: u32,
    /// Sleep after the first pending status.
    pub initial_wait: Duration,
    /// Multiplier applied to the sleep after every pending status.
    pub growth_factor: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            retry_budget: 10,
            initial_wait: Duration::from_secs(2),
            growth_factor: 1.5,
        }
    }
}

impl PollPolicy {
    fn next_wait(&self, wait: Duration) -> Duration {
        Duration::try_from_secs_f64(wait.as_secs_f64() * self.growth_factor).unwrap_or(wait)
    }
}

/// Polls a job until it succeeds, fails, or the retry budget runs out.
///
/// A fetch error counts as a pending status: it consumes one unit of budget
/// and is retried after the current wait.
#[derive(Clone)]
pub struct RemoteJobPoller {
    source: Arc<dyn JobStatusSource>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for RemoteJobPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteJobPoller").finish_non_exhaustive()
    }
}

impl RemoteJobPoller {
    /// Creates a poller over a status source.
    #[must_use]
    pub fn new(source: Arc<dyn JobStatusSource>) -> Self {
        Self {
            source,
            metrics: FlowMetrics::new(),
        }
    }

    /// Polls `job` under `policy`.
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteJobFailed` for any non-pending, non-success
    /// status and `Error::PollerExhausted` when the budget runs out.
    pub async fn poll(&self, job: &JobHandle, policy: PollPolicy) -> Result<JobStatus> {
        self.poll_with_progress(job, policy, |_, _| {}).await
    }

    /// Polls `job` under `policy`, calling `on_progress` with the attempt
    /// number and status after every pending status.
    ///
    /// # Errors
    ///
    /// Same as [`RemoteJobPoller::poll`].
    #[tracing::instrument(
        skip(self, job, on_progress),
        fields(job = %job, budget = policy.retry_budget)
    )]
    pub async fn poll_with_progress<F>(
        &self,
        job: &JobHandle,
        policy: PollPolicy,
        mut on_progress: F,
    ) -> Result<JobStatus>
    where
        F: FnMut(u32, &JobStatus) + Send,
    {
        let mut wait = policy.initial_wait;
        let mut last_status = String::from("no status fetched");

        for attempt in 1..=policy.retry_budget {
            match self.source.job_status(job).await {
                Ok(status) => match &status.state {
                    JobState::Success => {
                        self.metrics.record_job_poll("success");
                        tracing::info!(attempt, "job succeeded");
                        return Ok(status);
                    }
                    state if state.is_pending() => {
                        self.metrics.record_job_poll("pending");
                        tracing::debug!(
                            attempt,
                            state = %state,
                            progress = %status.progress,
                            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                            "job pending"
                        );
                        on_progress(attempt, &status);
                        last_status = state.to_string();
                    }
                    state => {
                        self.metrics.record_job_poll("failed");
                        tracing::warn!(attempt, state = %state, details = %status.details, "job failed");
                        return Err(Error::RemoteJobFailed {
                            job: job.to_string(),
                            status: state.to_string(),
                            details: status.details.clone(),
                        });
                    }
                },
                Err(e) => {
                    self.metrics.record_job_poll("error");
                    tracing::warn!(attempt, error = %e, "job status fetch failed");
                    last_status = e.to_string();
                }
            }

            tokio::time::sleep(wait).await;
            wait = policy.next_wait(wait);
        }

        tracing::warn!(attempts = policy.retry_budget, last = %last_status, "giving up on job");
        Err(Error::PollerExhausted {
            job: job.to_string(),
            attempts: policy.retry_budget,
            last_status,
        })
    }
}
