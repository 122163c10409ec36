//! Task events: immutable, timestamped records of one step of an operation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of a [`TaskEvent`].
///
/// The two close kinds are terminal: once one is appended to a task, the
/// task accepts no further events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskEventType {
    /// Progress information.
    #[serde(rename = "info")]
    Info,
    /// A non-fatal error.
    #[serde(rename = "error")]
    Error,
    /// Progress information worth highlighting to observers.
    #[serde(rename = "importantInfo")]
    ImportantInfo,
    /// The operation completed successfully.
    #[serde(rename = "closeOK")]
    CloseOk,
    /// The operation failed.
    #[serde(rename = "closeError")]
    CloseError,
}

impl TaskEventType {
    /// Returns true for the terminal kinds.
    #[must_use]
    pub const fn is_close(self) -> bool {
        matches!(self, Self::CloseOk | Self::CloseError)
    }

    /// Returns the wire string of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
            Self::ImportantInfo => "importantInfo",
            Self::CloseOk => "closeOK",
            Self::CloseError => "closeError",
        }
    }
}

impl fmt::Display for TaskEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskEventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(Self::Info),
            "error" => Ok(Self::Error),
            "importantInfo" => Ok(Self::ImportantInfo),
            "closeOK" => Ok(Self::CloseOk),
            "closeError" => Ok(Self::CloseError),
            other => Err(Error::Serialization {
                message: format!("unknown task event type: {other}"),
            }),
        }
    }
}

/// One step of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Kind of the event.
    #[serde(rename = "type")]
    pub event_type: TaskEventType,
    /// When the event was created.
    pub time: DateTime<Utc>,
    /// Short human-readable message.
    pub message: String,
    /// Free-form details.
    pub details: String,
    /// Component that produced the event.
    pub source: String,
}

impl TaskEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(
        event_type: TaskEventType,
        source: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            time: Utc::now(),
            message: message.into(),
            details: details.into(),
            source: source.into(),
        }
    }

    /// Creates an `info` event.
    #[must_use]
    pub fn info(
        source: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::new(TaskEventType::Info, source, message, details)
    }

    /// Creates an `error` event.
    #[must_use]
    pub fn error(
        source: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::new(TaskEventType::Error, source, message, details)
    }

    /// Returns true if this event closes its task.
    #[must_use]
    pub const fn is_close(&self) -> bool {
        self.event_type.is_close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_serde() {
        for kind in [
            TaskEventType::Info,
            TaskEventType::Error,
            TaskEventType::ImportantInfo,
            TaskEventType::CloseOk,
            TaskEventType::CloseError,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<TaskEventType>().unwrap(), kind);
        }
    }

    #[test]
    fn event_json_uses_wire_field_names() {
        let event = TaskEvent::info("hypervisor", "enclave created", "vm-42");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "info");
        assert_eq!(value["message"], "enclave created");
        assert_eq!(value["details"], "vm-42");
        assert_eq!(value["source"], "hypervisor");
        assert!(value["time"].is_string());
    }

    #[test]
    fn only_close_kinds_are_terminal() {
        assert!(TaskEventType::CloseOk.is_close());
        assert!(TaskEventType::CloseError.is_close());
        assert!(!TaskEventType::ImportantInfo.is_close());
        assert!(!TaskEventType::Error.is_close());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!("closeok".parse::<TaskEventType>().is_err());
    }
}
