//! Event types carried by the bridge.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Metadata attached to every bridge event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Component that produced the event (usually the app name).
    pub source: String,
}

impl EventMetadata {
    /// Create new event metadata.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new("unknown")
    }
}

/// Severity of a log line emitted by sandboxed logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `console.log` / `print`.
    #[default]
    Log,
    /// `console.info` / `debug`.
    Info,
    /// `console.warn`.
    Warn,
    /// `console.error` and contained script faults.
    Error,
}

impl LogLevel {
    /// Wire name of the level.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of dispatching a named method into sandboxed logic.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodOutcome {
    /// The method ran to completion and returned a value.
    Completed(Value),
    /// No method with that name was declared at registration time.
    NotFound,
    /// The method raised; the sandbox contained the fault.
    Failed(String),
}

impl MethodOutcome {
    /// Whether the call succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Returned value, if the call succeeded and produced something other than `null`.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Completed(Value::Null) | Self::NotFound | Self::Failed(_) => None,
            Self::Completed(value) => Some(value),
        }
    }

    /// Human-readable failure message.
    #[must_use]
    pub fn error_message(&self, method: &str) -> Option<String> {
        match self {
            Self::Completed(_) => None,
            Self::NotFound => Some(format!("Method not found: {method}")),
            Self::Failed(message) => Some(message.clone()),
        }
    }
}

/// Single-use reply channel for a method invocation.
///
/// Cloning shares the slot: the first subscriber to [`take`](Self::take) it
/// owns the reply.
#[derive(Clone, Default)]
pub struct ReplySlot(Arc<Mutex<Option<oneshot::Sender<MethodOutcome>>>>);

impl ReplySlot {
    /// Create a slot paired with the receiver that will observe the reply.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<MethodOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    /// Take the sender out of the slot. Returns `None` if already taken.
    #[must_use]
    pub fn take(&self) -> Option<oneshot::Sender<MethodOutcome>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Whether the reply is still unclaimed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySlot")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// A host request to run a named method inside the sandbox.
#[derive(Debug, Clone)]
pub struct MethodRequest {
    /// Method name as declared in the app registration.
    pub method: String,
    /// Arguments: an array is spread positionally, anything else is passed as one argument.
    pub args: Value,
    /// Where the outcome goes.
    pub reply: ReplySlot,
}

/// Which side of the bridge an event travels towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Logic → host (renderer, viewers).
    ToHost,
    /// Host → logic.
    ToLogic,
}

/// All events that cross the bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Logic committed a new data snapshot via `setData`.
    StateMutated {
        /// Event metadata.
        metadata: EventMetadata,
        /// The full, immutable snapshot after the merge.
        snapshot: Arc<Value>,
        /// The top-level keys that were replaced.
        patch: Map<String, Value>,
    },

    /// Logic emitted a log line.
    LogEmitted {
        /// Event metadata.
        metadata: EventMetadata,
        /// Log level.
        level: LogLevel,
        /// Arguments, converted to JSON.
        args: Vec<Value>,
    },

    /// Host asks the logic to run a method.
    MethodInvocationRequested {
        /// Event metadata.
        metadata: EventMetadata,
        /// The request and its reply slot.
        request: MethodRequest,
    },
}

impl BridgeEvent {
    /// Stable name of the event kind, for logging.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StateMutated { .. } => "state_mutated",
            Self::LogEmitted { .. } => "log_emitted",
            Self::MethodInvocationRequested { .. } => "method_invocation_requested",
        }
    }

    /// Direction the event travels.
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            Self::StateMutated { .. } | Self::LogEmitted { .. } => Direction::ToHost,
            Self::MethodInvocationRequested { .. } => Direction::ToLogic,
        }
    }

    /// Metadata of the event.
    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        match self {
            Self::StateMutated { metadata, .. }
            | Self::LogEmitted { metadata, .. }
            | Self::MethodInvocationRequested { metadata, .. } => metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_direction() {
        let mutated = BridgeEvent::StateMutated {
            metadata: EventMetadata::new("counter"),
            snapshot: Arc::new(json!({"count": 1})),
            patch: Map::new(),
        };
        assert_eq!(mutated.direction(), Direction::ToHost);
        assert_eq!(mutated.event_type(), "state_mutated");

        let (reply, _rx) = ReplySlot::channel();
        let invoke = BridgeEvent::MethodInvocationRequested {
            metadata: EventMetadata::new("host"),
            request: MethodRequest {
                method: "increment".into(),
                args: Value::Null,
                reply,
            },
        };
        assert_eq!(invoke.direction(), Direction::ToLogic);
        assert_eq!(invoke.metadata().source, "host");
    }

    #[test]
    fn test_reply_slot_is_single_use() {
        let (slot, mut rx) = ReplySlot::channel();
        let shared = slot.clone();

        let sender = slot.take().unwrap();
        assert!(shared.take().is_none());
        assert!(!shared.is_pending());

        sender.send(MethodOutcome::NotFound).unwrap();
        assert_eq!(rx.try_recv().unwrap(), MethodOutcome::NotFound);
    }

    #[test]
    fn test_method_outcome_messages() {
        assert!(MethodOutcome::Completed(Value::Null).is_success());
        assert!(MethodOutcome::Completed(Value::Null).result().is_none());
        assert_eq!(
            MethodOutcome::Completed(json!(3)).result(),
            Some(&json!(3))
        );
        assert_eq!(
            MethodOutcome::NotFound.error_message("nope").as_deref(),
            Some("Method not found: nope")
        );
        assert_eq!(
            MethodOutcome::Failed("boom".into())
                .error_message("x")
                .as_deref(),
            Some("boom")
        );
    }

    #[test]
    fn test_log_level_serde() {
        assert_eq!(serde_json::to_string(&LogLevel::Warn).unwrap(), "\"warn\"");
        let level: LogLevel = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(level, LogLevel::Error);
        assert_eq!(LogLevel::Info.to_string(), "info");
    }
}
