//! Push channel envelope protocol.
//!
//! Every frame is a JSON text message of the form
//! `{ "type": <kind>, "payload": { ... }, "timestamp": <epoch-ms> }`.
//! The set of kinds is closed; the payload shape follows from the kind.

use std::fmt;
use std::str::FromStr;

use miniapp_bridge::{LogLevel, MethodOutcome};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use crate::error::{PushError, PushResult};

// ── Error Codes ──────────────────────────────────────────────

/// `error.code` for an inbound envelope whose type the server does not accept.
pub const UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";
/// `error.code` for inbound text that is not a valid envelope.
pub const INVALID_FORMAT: &str = "INVALID_FORMAT";

// ── Message Types ────────────────────────────────────────────

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Server → viewer: a fresh render.
    Render,
    /// Server → viewer: a log line from the logic.
    Console,
    /// Viewer → server: run a method.
    CallMethod,
    /// Server → viewer: outcome of a `callMethod`.
    MethodCallResponse,
    /// Server → viewer: connection status.
    Connection,
    /// Server → viewer: the last inbound frame was rejected.
    Error,
}

impl MessageType {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Render => "render",
            Self::Console => "console",
            Self::CallMethod => "callMethod",
            Self::MethodCallResponse => "methodCallResponse",
            Self::Connection => "connection",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "render" => Ok(Self::Render),
            "console" => Ok(Self::Console),
            "callMethod" => Ok(Self::CallMethod),
            "methodCallResponse" => Ok(Self::MethodCallResponse),
            "connection" => Ok(Self::Connection),
            "error" => Ok(Self::Error),
            other => Err(PushError::UnknownType(other.to_string())),
        }
    }
}

// ── Payloads ─────────────────────────────────────────────────

/// `render` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPayload {
    /// Rendered markup.
    pub html: String,
    /// The snapshot the markup was rendered from.
    pub data: Value,
}

/// `console` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolePayload {
    /// Log level.
    pub level: LogLevel,
    /// Log arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// `callMethod` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMethodPayload {
    /// Method to run.
    pub method_name: String,
    /// Arguments: an array is spread positionally.
    #[serde(default)]
    pub args: Value,
}

/// `methodCallResponse` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodCallResponsePayload {
    /// Whether the method completed.
    pub success: bool,
    /// The method that was called.
    pub method_name: String,
    /// Returned value, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MethodCallResponsePayload {
    /// Build the response for a dispatch outcome.
    #[must_use]
    pub fn from_outcome(method_name: &str, outcome: &MethodOutcome) -> Self {
        Self {
            success: outcome.is_success(),
            method_name: method_name.to_string(),
            result: outcome.result().cloned(),
            error: outcome.error_message(method_name),
        }
    }

    /// A failed response with `error`.
    #[must_use]
    pub fn failure(method_name: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            method_name: method_name.to_string(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// `connection.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// The connection is open.
    Connected,
    /// The connection is closing.
    Disconnected,
}

/// `connection` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPayload {
    /// Connection status.
    pub status: ConnectionStatus,
    /// When the status was produced.
    pub timestamp: i64,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// ── Envelope ─────────────────────────────────────────────────

/// A push channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Kind-specific payload object.
    pub payload: Value,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

/// Current time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Envelope {
    fn typed<T: Serialize>(kind: MessageType, payload: &T) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or_else(|e| {
            error!(kind = %kind, error = %e, "Failed to serialize envelope payload");
            Value::Object(Map::new())
        });
        Self {
            kind,
            payload,
            timestamp: now_millis(),
        }
    }

    /// `render` envelope.
    #[must_use]
    pub fn render(html: impl Into<String>, data: Value) -> Self {
        Self::typed(
            MessageType::Render,
            &RenderPayload {
                html: html.into(),
                data,
            },
        )
    }

    /// `console` envelope.
    #[must_use]
    pub fn console(level: LogLevel, args: Vec<Value>) -> Self {
        Self::typed(MessageType::Console, &ConsolePayload { level, args })
    }

    /// `callMethod` envelope.
    #[must_use]
    pub fn call_method(method_name: impl Into<String>, args: Value) -> Self {
        Self::typed(
            MessageType::CallMethod,
            &CallMethodPayload {
                method_name: method_name.into(),
                args,
            },
        )
    }

    /// `methodCallResponse` envelope.
    #[must_use]
    pub fn method_call_response(response: &MethodCallResponsePayload) -> Self {
        Self::typed(MessageType::MethodCallResponse, response)
    }

    /// `connection` envelope.
    #[must_use]
    pub fn connection(connected: bool) -> Self {
        let status = if connected {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };
        Self::typed(
            MessageType::Connection,
            &ConnectionPayload {
                status,
                timestamp: now_millis(),
            },
        )
    }

    /// `error` envelope.
    #[must_use]
    pub fn error(message: impl Into<String>, code: Option<&str>) -> Self {
        Self::typed(
            MessageType::Error,
            &ErrorPayload {
                message: message.into(),
                code: code.map(str::to_string),
            },
        )
    }

    /// Parse and validate an inbound frame.
    ///
    /// `type` must be a string and `payload` an object. `timestamp` is
    /// optional; when present it must be a number. A missing timestamp is
    /// filled with the current time.
    ///
    /// # Errors
    ///
    /// [`PushError::Protocol`] for malformed frames and
    /// [`PushError::UnknownType`] for well-formed frames of an unknown kind.
    pub fn parse(text: &str) -> PushResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| PushError::Protocol(format!("invalid JSON: {e}")))?;
        let Value::Object(mut fields) = value else {
            return Err(PushError::Protocol("envelope must be an object".into()));
        };

        let Some(Value::String(kind)) = fields.remove("type") else {
            return Err(PushError::Protocol("`type` must be a string".into()));
        };
        let payload = match fields.remove("payload") {
            Some(payload @ Value::Object(_)) => payload,
            _ => return Err(PushError::Protocol("`payload` must be an object".into())),
        };
        let timestamp = match fields.remove("timestamp") {
            None | Some(Value::Null) => now_millis(),
            Some(Value::Number(n)) => n.as_i64().unwrap_or_else(now_millis),
            Some(_) => return Err(PushError::Protocol("`timestamp` must be a number".into())),
        };

        Ok(Self {
            kind: kind.parse()?,
            payload,
            timestamp,
        })
    }

    /// Decode the payload as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Json`] if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> PushResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Serialize to wire JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Json`] if serialization fails.
    pub fn to_json(&self) -> PushResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_types_use_camel_case() {
        let json = serde_json::to_string(&MessageType::MethodCallResponse).unwrap();
        assert_eq!(json, "\"methodCallResponse\"");
        for kind in [
            MessageType::Render,
            MessageType::Console,
            MessageType::CallMethod,
            MessageType::MethodCallResponse,
            MessageType::Connection,
            MessageType::Error,
        ] {
            assert_eq!(kind.as_str().parse::<MessageType>().unwrap(), kind);
        }
    }

    #[test]
    fn render_envelope_wire_shape() {
        let env = Envelope::render("<div>5</div>", json!({"count": 5}));
        let wire: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(wire["type"], "render");
        assert_eq!(wire["payload"]["html"], "<div>5</div>");
        assert_eq!(wire["payload"]["data"]["count"], 5);
        assert!(wire["timestamp"].is_i64());
    }

    #[test]
    fn console_and_connection_payloads() {
        let env = Envelope::console(LogLevel::Warn, vec![json!("careful")]);
        assert_eq!(env.payload, json!({"level": "warn", "args": ["careful"]}));

        let env = Envelope::connection(true);
        let payload: ConnectionPayload = env.payload_as().unwrap();
        assert_eq!(payload.status, ConnectionStatus::Connected);
    }

    #[test]
    fn method_call_response_omits_absent_fields() {
        let ok = MethodCallResponsePayload::from_outcome(
            "increment",
            &MethodOutcome::Completed(Value::Null),
        );
        let env = Envelope::method_call_response(&ok);
        assert_eq!(
            env.payload,
            json!({"success": true, "methodName": "increment"})
        );

        let missing = MethodCallResponsePayload::from_outcome("nope", &MethodOutcome::NotFound);
        assert!(!missing.success);
        assert_eq!(missing.error.as_deref(), Some("Method not found: nope"));

        let completed = MethodCallResponsePayload::from_outcome(
            "sum",
            &MethodOutcome::Completed(json!(3)),
        );
        assert_eq!(completed.result, Some(json!(3)));
    }

    #[test]
    fn error_envelope_code_is_optional() {
        let env = Envelope::error("Invalid message format", Some(INVALID_FORMAT));
        assert_eq!(
            env.payload,
            json!({"message": "Invalid message format", "code": "INVALID_FORMAT"})
        );
        let env = Envelope::error("plain", None);
        assert_eq!(env.payload, json!({"message": "plain"}));
    }

    #[test]
    fn parse_accepts_inbound_call_method() {
        let env = Envelope::parse(
            r#"{"type":"callMethod","payload":{"methodName":"setStep","args":[2]}}"#,
        )
        .unwrap();
        assert_eq!(env.kind, MessageType::CallMethod);
        let call: CallMethodPayload = env.payload_as().unwrap();
        assert_eq!(call.method_name, "setStep");
        assert_eq!(call.args, json!([2]));
    }

    #[test]
    fn parse_keeps_numeric_timestamp() {
        let env = Envelope::parse(r#"{"type":"render","payload":{},"timestamp":42}"#).unwrap();
        assert_eq!(env.timestamp, 42);
    }

    #[test]
    fn parse_rejects_malformed_frames() {
        for text in [
            "not json",
            "[1,2]",
            r#"{"payload":{}}"#,
            r#"{"type":7,"payload":{}}"#,
            r#"{"type":"render"}"#,
            r#"{"type":"render","payload":"x"}"#,
            r#"{"type":"render","payload":{},"timestamp":"now"}"#,
        ] {
            assert!(
                matches!(Envelope::parse(text), Err(PushError::Protocol(_))),
                "{text} should be rejected"
            );
        }
    }

    #[test]
    fn parse_reports_unknown_type() {
        let err = Envelope::parse(r#"{"type":"hello","payload":{}}"#).unwrap_err();
        assert!(matches!(err, PushError::UnknownType(ref t) if t == "hello"));
    }

    #[test]
    fn call_method_args_default_to_null() {
        let env = Envelope::parse(r#"{"type":"callMethod","payload":{"methodName":"reset"}}"#)
            .unwrap();
        let call: CallMethodPayload = env.payload_as().unwrap();
        assert_eq!(call.args, Value::Null);
    }
}
