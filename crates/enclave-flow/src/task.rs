//! Append-only task log with live fan-out to subscribers.
//!
//! A [`Task`] records the events of one long-running operation. Observers
//! attach with [`Task::subscribe`]: they receive a snapshot of everything
//! appended so far, then every later event in append order. Appending a close
//! event pushes it to every live subscriber before their streams end, so the
//! terminal event is always the last thing a subscriber receives.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use enclave_core::TaskId;

use crate::event::{TaskEvent, TaskEventType};

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Events may still be appended.
    Working,
    /// Closed with `closeOK`.
    Finished,
    /// Closed with `closeError`.
    Errored,
}

impl TaskStatus {
    /// Returns true if the task accepts no more events.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Working)
    }

    /// Returns the wire string of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Finished => "finished",
            Self::Errored => "errored",
        }
    }

    const fn after_close(event_type: TaskEventType) -> Option<Self> {
        match event_type {
            TaskEventType::CloseOk => Some(Self::Finished),
            TaskEventType::CloseError => Some(Self::Errored),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable form of a task, without its live subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Task identifier.
    pub id: TaskId,
    /// Position in the manager.
    pub index: u64,
    /// Current status.
    pub status: TaskStatus,
    /// What the task does.
    pub description: String,
    /// Creation time.
    pub start_time: DateTime<Utc>,
    /// Time of the close event, if closed.
    pub end_time: Option<DateTime<Utc>>,
    /// Events, most recent first.
    pub history: Vec<TaskEvent>,
}

struct TaskInner {
    status: TaskStatus,
    end_time: Option<DateTime<Utc>>,
    history: VecDeque<TaskEvent>,
    subscribers: Vec<mpsc::UnboundedSender<TaskEvent>>,
}

/// One tracked asynchronous operation.
pub struct Task {
    id: TaskId,
    index: u64,
    description: String,
    start_time: DateTime<Utc>,
    inner: Mutex<TaskInner>,
    done: watch::Sender<TaskStatus>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("description", &self.description)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Creates a working task with an empty history.
    #[must_use]
    pub fn new(index: u64, description: impl Into<String>) -> Self {
        let (done, _) = watch::channel(TaskStatus::Working);
        Self {
            id: TaskId::generate(),
            index,
            description: description.into(),
            start_time: Utc::now(),
            inner: Mutex::new(TaskInner {
                status: TaskStatus::Working,
                end_time: None,
                history: VecDeque::new(),
                subscribers: Vec::new(),
            }),
            done,
        }
    }

    /// Rebuilds a task from its persisted form with no subscribers.
    #[must_use]
    pub fn from_record(record: TaskRecord) -> Self {
        let (done, _) = watch::channel(record.status);
        Self {
            id: record.id,
            index: record.index,
            description: record.description,
            start_time: record.start_time,
            inner: Mutex::new(TaskInner {
                status: record.status,
                end_time: record.end_time,
                history: record.history.into(),
                subscribers: Vec::new(),
            }),
            done,
        }
    }

    /// Returns the persisted form of this task.
    #[must_use]
    pub fn record(&self) -> TaskRecord {
        let inner = self.lock();
        TaskRecord {
            id: self.id,
            index: self.index,
            status: inner.status,
            description: self.description.clone(),
            start_time: self.start_time,
            end_time: inner.end_time,
            history: inner.history.iter().cloned().collect(),
        }
    }

    // Appends never leave the log half-updated, so a poisoned lock still
    // guards a consistent log.
    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the task identifier.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the position of this task in its manager.
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Returns the task description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the creation time.
    #[must_use]
    pub const fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Returns the time of the close event, if any.
    #[must_use]
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.lock().end_time
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    /// Returns a copy of the history, most recent first.
    #[must_use]
    pub fn history(&self) -> Vec<TaskEvent> {
        self.lock().history.iter().cloned().collect()
    }

    /// Returns the most recent event.
    #[must_use]
    pub fn last_event(&self) -> Option<TaskEvent> {
        self.lock().history.front().cloned()
    }

    /// Returns the number of registered live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Attaches a new observer.
    ///
    /// On a closed task the returned subscriber is already done: it carries the
    /// full history as past events and will never receive a live event.
    #[must_use]
    pub fn subscribe(&self) -> Subscriber {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        let past_events = inner.history.iter().cloned().collect();
        if !inner.status.is_terminal() {
            inner.subscribers.push(tx);
        }
        Subscriber {
            past_events,
            events: rx,
            done: self.done.subscribe(),
        }
    }

    /// Appends an event and forwards it to every live subscriber.
    ///
    /// A close event is pushed to all subscribers before their streams are
    /// ended. Returns `false` if the task was already closed, in which case
    /// the event is dropped.
    pub fn add_event(&self, mut event: TaskEvent) -> bool {
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            tracing::error!(
                task = %self.id,
                status = %inner.status,
                event_type = %event.event_type,
                message = %event.message,
                "dropping event appended to a closed task"
            );
            return false;
        }

        if let Some(latest) = inner.history.front() {
            if event.time < latest.time {
                event.time = latest.time;
            }
        }

        inner
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());

        if let Some(status) = TaskStatus::after_close(event.event_type) {
            inner.status = status;
            inner.end_time = Some(event.time);
            self.done.send_replace(status);
            // Dropping the senders ends every subscriber's stream after the
            // close event already queued above.
            inner.subscribers.clear();
            tracing::debug!(task = %self.id, %status, "task closed");
        }

        inner.history.push_front(event);
        true
    }

    /// Appends an `info` event.
    pub fn add_info(
        &self,
        source: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> bool {
        self.add_event(TaskEvent::new(TaskEventType::Info, source, message, details))
    }

    /// Appends a non-fatal `error` event.
    pub fn add_error(
        &self,
        source: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> bool {
        self.add_event(TaskEvent::new(TaskEventType::Error, source, message, details))
    }

    /// Appends an `importantInfo` event.
    pub fn add_important_info(
        &self,
        source: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> bool {
        self.add_event(TaskEvent::new(
            TaskEventType::ImportantInfo,
            source,
            message,
            details,
        ))
    }

    /// Closes the task successfully.
    pub fn close_ok(
        &self,
        source: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> bool {
        self.add_event(TaskEvent::new(TaskEventType::CloseOk, source, message, details))
    }

    /// Closes the task with an error.
    pub fn close_error(
        &self,
        source: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> bool {
        self.add_event(TaskEvent::new(
            TaskEventType::CloseError,
            source,
            message,
            details,
        ))
    }
}

/// A live observer of a [`Task`].
#[derive(Debug)]
pub struct Subscriber {
    past_events: Vec<TaskEvent>,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    done: watch::Receiver<TaskStatus>,
}

impl Subscriber {
    /// Returns the task history at subscribe time, most recent first.
    #[must_use]
    pub fn past_events(&self) -> &[TaskEvent] {
        &self.past_events
    }

    /// Waits for the next live event.
    ///
    /// Returns `None` once the task has closed and every queued event has
    /// been received, or if the subscriber was closed.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        self.events.recv().await
    }

    /// Returns a queued live event without waiting.
    pub fn try_next_event(&mut self) -> Option<TaskEvent> {
        self.events.try_recv().ok()
    }

    /// Returns the task status as last published.
    #[must_use]
    pub fn task_status(&self) -> TaskStatus {
        *self.done.borrow()
    }

    /// Returns true once the task has closed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.task_status().is_terminal()
    }

    /// Returns true if no live event is queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.events.is_empty()
    }

    /// Stops receiving new events. Already queued events stay readable.
    pub fn close(&mut self) {
        self.events.close();
    }

    /// Consumes live events until the stream ends and returns the final status.
    pub async fn wait_done(&mut self) -> TaskStatus {
        while self.events.recv().await.is_some() {}
        self.task_status()
    }

    /// Converts the subscriber into a stream of past events (oldest first)
    /// followed by live events.
    pub fn into_stream(self) -> impl Stream<Item = TaskEvent> + Send + 'static {
        use futures::StreamExt;

        let Self {
            past_events,
            events,
            ..
        } = self;
        let past = futures::stream::iter(past_events.into_iter().rev());
        let live = futures::stream::unfold(events, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        past.chain(live)
    }
}
