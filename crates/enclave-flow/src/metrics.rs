//! Observability metrics for task orchestration.
//!
//! Metrics go through the `metrics` crate facade; the binary decides whether
//! a recorder is installed.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `enclave_flow_tasks_total` | Counter | `status` | Tasks created, finished and errored |
//! | `enclave_flow_active_tasks` | Gauge | - | Tasks still working |
//! | `enclave_flow_job_polls_total` | Counter | `result` | Remote job status fetches |
//! | `enclave_flow_cloud_events_total` | Counter | `result` | Objects relayed from enclave logs |
//! | `enclave_flow_stages_total` | Counter | `stage`, `result` | Workflow stage outcomes |
//! | `enclave_flow_stage_duration_seconds` | Histogram | `stage`, `result` | Time from stage start to close |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Tasks by lifecycle status.
    pub const TASKS_TOTAL: &str = "enclave_flow_tasks_total";
    /// Gauge: Tasks still working.
    pub const ACTIVE_TASKS: &str = "enclave_flow_active_tasks";
    /// Counter: Remote job status fetches by result.
    pub const JOB_POLLS_TOTAL: &str = "enclave_flow_job_polls_total";
    /// Counter: Enclave log objects by decode result.
    pub const CLOUD_EVENTS_TOTAL: &str = "enclave_flow_cloud_events_total";
    /// Counter: Workflow stage outcomes.
    pub const STAGES_TOTAL: &str = "enclave_flow_stages_total";
    /// Histogram: Workflow stage duration in seconds.
    pub const STAGE_DURATION_SECONDS: &str = "enclave_flow_stage_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Task status (created, finished, errored).
    pub const STATUS: &str = "status";
    /// Result of an operation.
    pub const RESULT: &str = "result";
    /// Workflow stage name.
    pub const STAGE: &str = "stage";
}

/// High-level interface for recording orchestration metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a task lifecycle change.
    pub fn record_task(&self, status: &str) {
        counter!(names::TASKS_TOTAL, labels::STATUS => status.to_string()).increment(1);
    }

    /// Sets the number of working tasks.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_tasks(&self, count: usize) {
        gauge!(names::ACTIVE_TASKS).set(count as f64);
    }

    /// Records one remote job status fetch.
    pub fn record_job_poll(&self, result: &str) {
        counter!(names::JOB_POLLS_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Records one relayed enclave log object.
    pub fn record_cloud_event(&self, result: &str) {
        counter!(names::CLOUD_EVENTS_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Records the outcome and duration of a workflow stage.
    pub fn record_stage(&self, stage: &str, result: &str, duration: Duration) {
        counter!(
            names::STAGES_TOTAL,
            labels::STAGE => stage.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
        histogram!(
            names::STAGE_DURATION_SECONDS,
            labels::STAGE => stage.to_string(),
            labels::RESULT => result.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Measures time since creation.
#[derive(Debug, Clone, Copy)]
pub struct StageTimer {
    start: Instant,
}

impl StageTimer {
    /// Starts a timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns the elapsed time since the timer was started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_metrics_record_without_recorder() {
        let metrics = FlowMetrics::new();
        metrics.record_task("created");
        metrics.set_active_tasks(3);
        metrics.record_job_poll("running");
        metrics.record_cloud_event("decoded");
        metrics.record_stage("prepare_enclave", "done", Duration::from_secs(2));
    }

    #[test]
    fn stage_timer_measures_elapsed() {
        let timer = StageTimer::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
    }
}
