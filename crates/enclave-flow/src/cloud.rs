//! Relay of event logs that remote enclaves write to object storage.
//!
//! An enclave reports progress by writing one JSON-encoded [`TaskEvent`] per
//! object under `{prefix}/` in its project's bucket. [`get_logs`] reads such a
//! log once; [`CloudNotifier`] follows it live and republishes every new
//! object as a [`TaskEvent`] until the enclave writes a close event, the log
//! goes idle, or the storage fails.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use enclave_core::observability::cloud_span;
use enclave_core::{ObjectMeta, ObjectStoreProvider, StorageBackend, StorageRegistry};

use crate::error::{Error, Result};
use crate::event::{TaskEvent, TaskEventType};
use crate::metrics::FlowMetrics;

/// Suffix of log objects.
pub const LOG_SUFFIX: &str = ".json";

const SOURCE: &str = "cloud";

/// State of an enclave log relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudStatus {
    /// Nothing observed yet.
    Created,
    /// Listening for new objects.
    Running,
    /// The enclave reported success.
    Done,
    /// The enclave reported failure or the storage failed.
    Errored,
    /// No new object arrived within the idle timeout.
    Timeout,
}

impl CloudStatus {
    /// Returns true for final states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Timeout)
    }

    /// Returns the wire string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Done => "done",
            Self::Errored => "errored",
            Self::Timeout => "timeout",
        }
    }

    /// Infers the state of a log from its most recent event.
    #[must_use]
    pub fn from_latest(latest: Option<&TaskEvent>) -> Self {
        match latest.map(|event| event.event_type) {
            None => Self::Created,
            Some(TaskEventType::CloseOk) => Self::Done,
            Some(TaskEventType::CloseError) => Self::Errored,
            Some(_) => Self::Running,
        }
    }
}

impl fmt::Display for CloudStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing of a [`CloudNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudNotifierConfig {
    /// How many times to check for the bucket before giving up.
    pub bucket_attempts: u32,
    /// Delay between bucket checks.
    pub bucket_retry_delay: Duration,
    /// Longest wait for a new object before timing out.
    pub idle_timeout: Duration,
}

impl Default for CloudNotifierConfig {
    fn default() -> Self {
        Self {
            bucket_attempts: 10,
            bucket_retry_delay: Duration::from_secs(7),
            idle_timeout: Duration::from_secs(7 * 60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    time: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: String,
    #[serde(default)]
    source: String,
}

/// A decoded log object and the raw timestamp it was written with.
#[derive(Debug)]
struct LogEntry {
    event: TaskEvent,
    raw_time: String,
    parsed_time: Option<DateTime<Utc>>,
}

impl LogEntry {
    fn decode(bytes: &[u8], meta: &ObjectMeta) -> std::result::Result<Self, String> {
        let record: LogRecord = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        let event_type: TaskEventType = record.kind.parse().map_err(|e: Error| e.to_string())?;
        let parsed_time = DateTime::parse_from_rfc3339(&record.time)
            .ok()
            .map(|time| time.with_timezone(&Utc));
        let time = parsed_time
            .or(meta.last_modified)
            .unwrap_or_else(Utc::now);

        Ok(Self {
            event: TaskEvent {
                event_type,
                time,
                message: record.message,
                details: record.details,
                source: record.source,
            },
            raw_time: record.time,
            parsed_time,
        })
    }

    fn malformed(meta: &ObjectMeta, reason: &str) -> Self {
        let time = meta.last_modified.unwrap_or_else(Utc::now);
        Self {
            event: TaskEvent::error(
                SOURCE,
                "failed to decode enclave log object",
                format!("{}: {reason}", meta.path),
            ),
            raw_time: time.to_rfc3339_opts(SecondsFormat::Millis, true),
            parsed_time: Some(time),
        }
    }

    fn read(bytes: &[u8], meta: &ObjectMeta, metrics: FlowMetrics) -> Self {
        match Self::decode(bytes, meta) {
            Ok(entry) => {
                metrics.record_cloud_event("decoded");
                entry
            }
            Err(reason) => {
                metrics.record_cloud_event("malformed");
                tracing::warn!(path = %meta.path, %reason, "malformed enclave log object");
                Self::malformed(meta, &reason)
            }
        }
    }
}

// Timestamps are compared as instants when every entry has a parseable one,
// and as raw strings otherwise.
fn sort_newest_first(entries: &mut [LogEntry]) {
    if entries.iter().all(|entry| entry.parsed_time.is_some()) {
        entries.sort_by(|a, b| b.parsed_time.cmp(&a.parsed_time));
    } else {
        entries.sort_by(|a, b| b.raw_time.cmp(&a.raw_time));
    }
}

fn log_prefix(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}

async fn log_objects(backend: &dyn StorageBackend, prefix: &str) -> Result<Vec<ObjectMeta>> {
    Ok(backend
        .list(&log_prefix(prefix))
        .await?
        .into_iter()
        .filter(|meta| meta.path.ends_with(LOG_SUFFIX))
        .collect())
}

/// Reads an enclave log once.
///
/// Returns its events most recent first, with the status inferred from the
/// most recent one. A missing bucket or empty log yields `created`; objects
/// that fail to decode appear as `error` events.
///
/// # Errors
///
/// Returns an error for an unknown alias or a failing storage call.
#[tracing::instrument(skip(registry))]
pub async fn get_logs(
    registry: &StorageRegistry,
    alias: &str,
    bucket: &str,
    prefix: &str,
) -> Result<(Vec<TaskEvent>, CloudStatus)> {
    let provider = registry.resolve(alias)?;
    if !provider.bucket_exists(bucket).await? {
        return Ok((Vec::new(), CloudStatus::Created));
    }
    let backend = provider.bucket(bucket).await?;
    let metrics = FlowMetrics::new();

    let mut entries = Vec::new();
    for meta in log_objects(backend.as_ref(), prefix).await? {
        let bytes = backend.get(&meta.path).await?;
        entries.push(LogEntry::read(&bytes, &meta, metrics));
    }
    sort_newest_first(&mut entries);

    let events: Vec<TaskEvent> = entries.into_iter().map(|entry| entry.event).collect();
    let status = CloudStatus::from_latest(events.first());
    Ok((events, status))
}

/// Live relay of one enclave log.
///
/// Creating a notifier starts a background listener. It waits for the bucket
/// to exist, then forwards every new log object as a [`TaskEvent`]. A log
/// whose most recent object is already a close event is not listened to; the
/// notifier starts closed with the matching status.
#[derive(Debug)]
pub struct CloudNotifier {
    alias: String,
    bucket: String,
    prefix: String,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    status: watch::Receiver<CloudStatus>,
}

impl CloudNotifier {
    /// Starts following `{bucket}/{prefix}/` on the deployment named `alias`.
    #[must_use]
    pub fn new(
        registry: &StorageRegistry,
        alias: impl Into<String>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        config: CloudNotifierConfig,
    ) -> Self {
        let alias = alias.into();
        let bucket = bucket.into();
        let prefix = prefix.into();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(CloudStatus::Created);

        let listener = Listener {
            provider: registry.resolve(&alias),
            bucket: bucket.clone(),
            prefix: log_prefix(&prefix),
            config,
            events: events_tx,
            status: status_tx,
            metrics: FlowMetrics::new(),
        };
        let span = cloud_span(&alias, &bucket, &prefix);
        tokio::spawn(listener.run().instrument(span));

        Self {
            alias,
            bucket,
            prefix,
            events,
            status,
        }
    }

    /// Returns the storage alias.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Returns the bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Returns the log prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> CloudStatus {
        *self.status.borrow()
    }

    /// Returns true once the relay has stopped.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.status().is_terminal()
    }

    /// Waits until the listener is active or has already stopped.
    pub async fn started(&mut self) -> CloudStatus {
        let reached = self
            .status
            .wait_for(|status| *status != CloudStatus::Created)
            .await
            .map(|status| *status);
        reached.unwrap_or_else(|_| self.status())
    }

    /// Waits for the next relayed event.
    ///
    /// Returns `None` after the relay has stopped and every event was read;
    /// [`CloudNotifier::status`] is final by then.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        self.events.recv().await
    }
}

struct Listener {
    provider: enclave_core::Result<Arc<dyn ObjectStoreProvider>>,
    bucket: String,
    prefix: String,
    config: CloudNotifierConfig,
    events: mpsc::UnboundedSender<TaskEvent>,
    status: watch::Sender<CloudStatus>,
    metrics: FlowMetrics,
}

impl Listener {
    async fn run(self) {
        let status = match self.listen().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "enclave log relay failed");
                self.publish(TaskEvent::error(SOURCE, "enclave log relay failed", e.to_string()));
                CloudStatus::Errored
            }
        };
        tracing::info!(%status, "enclave log relay stopped");
        // The status is final before the event channel closes.
        self.status.send_replace(status);
    }

    fn publish(&self, event: TaskEvent) -> bool {
        self.events.send(event).is_ok()
    }

    async fn listen(&self) -> Result<CloudStatus> {
        let provider = match &self.provider {
            Ok(provider) => Arc::clone(provider),
            Err(e) => return Err(Error::InvalidInput(e.to_string())),
        };

        if !self.wait_for_bucket(provider.as_ref()).await? {
            self.publish(TaskEvent::error(
                SOURCE,
                "enclave log bucket never appeared",
                format!(
                    "bucket {} missing after {} checks",
                    self.bucket, self.config.bucket_attempts
                ),
            ));
            return Ok(CloudStatus::Errored);
        }

        let backend = provider.bucket(&self.bucket).await?;
        // Watch before inspecting the existing log so nothing written in
        // between is missed.
        let mut watch = provider
            .watch_created(&self.bucket, &self.prefix, LOG_SUFFIX)
            .await?;

        if let Some(status) = self.already_done(backend.as_ref()).await? {
            tracing::info!(%status, "enclave log already closed");
            return Ok(status);
        }

        self.status.send_replace(CloudStatus::Running);

        loop {
            let meta = match tokio::time::timeout(self.config.idle_timeout, watch.next()).await {
                Err(_) => {
                    self.publish(TaskEvent::error(
                        SOURCE,
                        "enclave log went idle",
                        format!(
                            "no new log object for {}s",
                            self.config.idle_timeout.as_secs()
                        ),
                    ));
                    return Ok(CloudStatus::Timeout);
                }
                Ok(None) => {
                    let ended = enclave_core::Error::storage("object creation watch ended");
                    return Err(Error::Core(ended));
                }
                Ok(Some(created)) => created?,
            };

            let bytes = backend.get(&meta.path).await?;
            let entry = LogEntry::read(&bytes, &meta, self.metrics);
            let event_type = entry.event.event_type;
            if !self.publish(entry.event) {
                tracing::debug!("enclave log consumer went away");
                return Ok(CloudStatus::Errored);
            }

            match event_type {
                TaskEventType::CloseOk => return Ok(CloudStatus::Done),
                TaskEventType::CloseError => return Ok(CloudStatus::Errored),
                _ => {}
            }
        }
    }

    async fn wait_for_bucket(&self, provider: &dyn ObjectStoreProvider) -> Result<bool> {
        for attempt in 1..=self.config.bucket_attempts {
            if provider.bucket_exists(&self.bucket).await? {
                return Ok(true);
            }
            tracing::debug!(attempt, "enclave log bucket not there yet");
            if attempt < self.config.bucket_attempts {
                tokio::time::sleep(self.config.bucket_retry_delay).await;
            }
        }
        Ok(false)
    }

    async fn already_done(&self, backend: &dyn StorageBackend) -> Result<Option<CloudStatus>> {
        let latest = log_objects(backend, &self.prefix)
            .await?
            .into_iter()
            .max_by(|a, b| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a.path.cmp(&b.path))
            });
        let Some(meta) = latest else {
            return Ok(None);
        };

        let bytes = backend.get(&meta.path).await?;
        let status = LogEntry::decode(&bytes, &meta)
            .ok()
            .map(|entry| CloudStatus::from_latest(Some(&entry.event)))
            .filter(|status| status.is_terminal());
        Ok(status)
    }
}
