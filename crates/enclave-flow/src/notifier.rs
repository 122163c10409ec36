//! Broadcaster of a single evolving status string.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tokio::sync::mpsc;

struct NotifierInner {
    status: String,
    terminated: bool,
    subscribers: Vec<mpsc::UnboundedSender<String>>,
}

/// Broadcasts status updates to live subscribers and terminates once.
#[derive(Debug)]
pub struct StatusNotifier {
    inner: Mutex<NotifierInner>,
}

impl std::fmt::Debug for NotifierInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierInner")
            .field("status", &self.status)
            .field("terminated", &self.terminated)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl StatusNotifier {
    /// Creates a live notifier holding `status`.
    #[must_use]
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(NotifierInner {
                status: status.into(),
                terminated: false,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Creates a notifier that is already terminated.
    ///
    /// Used for notifiers rebuilt from a snapshot: nothing will ever update
    /// them again, so nothing may wait on them.
    #[must_use]
    pub fn terminated(status: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(NotifierInner {
                status: status.into(),
                terminated: true,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NotifierInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the last broadcast status.
    #[must_use]
    pub fn status(&self) -> String {
        self.lock().status.clone()
    }

    /// Returns true once the notifier has terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Registers a subscriber for future updates.
    ///
    /// After termination the returned subscriber is already closed and never
    /// receives anything.
    #[must_use]
    pub fn subscribe(&self) -> StatusSubscriber {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        if !inner.terminated {
            inner.subscribers.push(tx);
        }
        StatusSubscriber { rx }
    }

    /// Broadcasts an intermediate status.
    ///
    /// Returns `false` if the notifier has already terminated.
    pub fn update_status(&self, status: impl Into<String>) -> bool {
        let mut inner = self.lock();
        if inner.terminated {
            return false;
        }
        let status = status.into();
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(status.clone()).is_ok());
        inner.status = status;
        true
    }

    /// Broadcasts a final status, then closes and forgets every subscriber.
    ///
    /// Only the first call has an effect; later calls log an error and
    /// return `false` without broadcasting.
    pub fn update_status_and_close(&self, status: impl Into<String>) -> bool {
        let mut inner = self.lock();
        let status = status.into();
        if inner.terminated {
            tracing::error!(
                current = %inner.status,
                ignored = %status,
                "status notifier already terminated"
            );
            return false;
        }
        for subscriber in inner.subscribers.drain(..) {
            let _ = subscriber.send(status.clone());
        }
        inner.status = status;
        inner.terminated = true;
        true
    }
}

/// A live observer of a [`StatusNotifier`].
#[derive(Debug)]
pub struct StatusSubscriber {
    rx: mpsc::UnboundedReceiver<String>,
}

impl StatusSubscriber {
    /// Waits for the next status. Returns `None` once the notifier has
    /// terminated and the final status was received.
    pub async fn next_status(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Returns a queued status without waiting.
    pub fn try_next_status(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Returns true if the notifier closed this subscriber and nothing is queued.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed() && self.rx.is_empty()
    }

    /// Converts the subscriber into a stream of statuses.
    pub fn into_stream(self) -> impl Stream<Item = String> + Send + 'static {
        futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|status| (status, rx))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(subscriber: &mut StatusSubscriber) -> Vec<String> {
        let mut statuses = Vec::new();
        while let Some(status) = subscriber.try_next_status() {
            statuses.push(status);
        }
        statuses
    }

    #[test]
    fn updates_reach_every_subscriber() {
        let notifier = StatusNotifier::new("initialized");
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        assert!(notifier.update_status("preparingEnclave"));
        assert_eq!(drain(&mut a), vec!["preparingEnclave"]);
        assert_eq!(drain(&mut b), vec!["preparingEnclave"]);
        assert!(!a.is_closed());
        assert_eq!(notifier.status(), "preparingEnclave");
    }

    #[test]
    fn close_delivers_final_status_once() {
        let notifier = StatusNotifier::new("preparingEnclave");
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        assert!(notifier.update_status_and_close("preparingEnclaveDone"));
        assert_eq!(drain(&mut a), vec!["preparingEnclaveDone"]);
        assert_eq!(drain(&mut b), vec!["preparingEnclaveDone"]);
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn subscribe_after_close_is_closed_immediately() {
        let notifier = StatusNotifier::new("x");
        notifier.update_status_and_close("X");

        let mut late = notifier.subscribe();
        assert!(late.is_closed());
        assert!(late.try_next_status().is_none());
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn second_close_is_a_noop() {
        let notifier = StatusNotifier::new("x");
        let mut sub = notifier.subscribe();
        assert!(notifier.update_status_and_close("first"));
        assert!(!notifier.update_status_and_close("second"));
        assert!(!notifier.update_status("third"));
        assert_eq!(drain(&mut sub), vec!["first"]);
        assert_eq!(notifier.status(), "first");
    }

    #[test]
    fn restored_notifier_is_terminated() {
        let notifier = StatusNotifier::terminated("attributesUpdated");
        assert!(notifier.is_terminated());
        assert!(notifier.subscribe().is_closed());
        assert_eq!(notifier.status(), "attributesUpdated");
    }

    #[tokio::test]
    async fn stream_ends_after_final_status() {
        use futures::StreamExt;

        let notifier = StatusNotifier::new("a");
        let sub = notifier.subscribe();
        notifier.update_status("b");
        notifier.update_status_and_close("c");

        let statuses: Vec<_> = sub.into_stream().collect().await;
        assert_eq!(statuses, vec!["b", "c"]);
    }
}
