//! Server-push framing of task events and status updates.
//!
//! Every frame is the literal prefix `data: `, a payload, and a blank line.

use futures::{Stream, StreamExt};

use crate::error::Result;
use crate::event::TaskEvent;
use crate::task::Subscriber;

/// Renders one task event as a frame carrying its JSON encoding.
///
/// # Errors
///
/// Returns an error if the event cannot be encoded.
pub fn event_frame(event: &TaskEvent) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// Renders one status string as a frame.
#[must_use]
pub fn status_frame(status: &str) -> String {
    format!("data: {status}\n\n")
}

/// Returns false when a subscriber has nothing left to stream: no queued
/// live event and a task that is no longer working.
#[must_use]
pub fn has_live_content(subscriber: &Subscriber) -> bool {
    !subscriber.is_idle() || !subscriber.is_done()
}

/// Frames a subscriber's past events (oldest first) followed by live events.
pub fn event_frames(subscriber: Subscriber) -> impl Stream<Item = String> + Send + 'static {
    subscriber.into_stream().filter_map(|event| async move {
        match event_frame(&event) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode task event");
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn event_frame_layout() {
        let event = TaskEvent::info("hypervisor", "created", "vm-1");
        let frame = event_frame(&event).unwrap();

        assert!(frame.starts_with("data: {\"type\":\"info\",\"time\":"));
        assert!(frame.ends_with("}\n\n"));
        let json: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim_end()).unwrap();
        assert_eq!(json["message"], "created");
        assert_eq!(json["details"], "vm-1");
        assert_eq!(json["source"], "hypervisor");
    }

    #[test]
    fn status_frame_layout() {
        assert_eq!(
            status_frame("preparingEnclave"),
            "data: preparingEnclave\n\n"
        );
    }

    #[test]
    fn closed_task_has_no_live_content() {
        let task = Task::new(0, "t");
        let live = task.subscribe();
        assert!(has_live_content(&live));

        task.close_ok("test", "done", "");
        // Queued close event is still content.
        assert!(has_live_content(&live));
        assert!(!has_live_content(&task.subscribe()));
    }

    #[tokio::test]
    async fn frames_follow_append_order() {
        let task = Task::new(0, "t");
        task.add_info("test", "first", "");
        let subscriber = task.subscribe();
        task.close_ok("test", "last", "");

        let frames: Vec<String> = event_frames(subscriber).collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("\"message\":\"first\""));
        assert!(frames[1].contains("\"type\":\"closeOK\""));
    }
}
