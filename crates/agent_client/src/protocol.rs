//! Frame classification and control-plane envelopes.
//!
//! Each stdout line that parses as a JSON object is classified into exactly
//! one inbound frame: a data-plane message, a control request from the
//! process, or a control response to a prior caller-initiated request.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::message::AgentMessage;

/// One classified inbound frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Message(AgentMessage),
    ControlRequest(ControlRequest),
    ControlResponse(ControlResponse),
}

/// A control request initiated by the process.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    pub request_id: String,
    pub request: ControlRequestPayload,
}

/// Inner request payload, classified by its `subtype`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequestPayload {
    /// The process announces itself; metadata is recorded and acknowledged.
    Initialize {
        #[serde(flatten)]
        metadata: Map<String, Value>,
    },
    /// Execute a previously advertised hook callback.
    HookCallback {
        callback_id: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    /// Ask the permission decision point whether a tool may run.
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        permission_suggestions: Option<Value>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Forward a message to a named in-process tool server.
    McpMessage {
        server_name: String,
        #[serde(default)]
        message: Value,
    },
}

/// A control response to a caller-initiated request.
#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub request_id: String,
    pub outcome: ControlOutcome,
}

#[derive(Debug, Clone)]
pub enum ControlOutcome {
    Success(Value),
    Error(String),
}

/// Why a frame could not be classified. The line is dropped and logged;
/// classification failures are never fatal to the session.
#[derive(Debug)]
pub struct ClassifyError {
    pub message: String,
}

pub(crate) fn classify(value: Value) -> Result<InboundFrame, ClassifyError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ClassifyError {
            message: "frame missing `type` field".to_string(),
        })?
        .to_string();

    match kind.as_str() {
        "control_request" => {
            let request: ControlRequest =
                serde_json::from_value(value.clone()).map_err(|err| ClassifyError {
                    message: format!("malformed control_request: {err}"),
                })?;
            Ok(InboundFrame::ControlRequest(request))
        }
        "control_response" => classify_control_response(&value).map(InboundFrame::ControlResponse),
        _ => {
            let message: AgentMessage =
                serde_json::from_value(value).map_err(|err| ClassifyError {
                    message: format!("unrecognized frame type `{kind}`: {err}"),
                })?;
            Ok(InboundFrame::Message(message))
        }
    }
}

fn classify_control_response(value: &Value) -> Result<ControlResponse, ClassifyError> {
    // The id lives at the top level; tolerate it nested under `response` as
    // some process versions place it there.
    let request_id = value
        .get("request_id")
        .or_else(|| value.pointer("/response/request_id"))
        .and_then(Value::as_str)
        .ok_or_else(|| ClassifyError {
            message: "control_response missing request_id".to_string(),
        })?
        .to_string();

    if let Some(error) = value.get("error") {
        return Ok(ControlResponse {
            request_id,
            outcome: ControlOutcome::Error(error_text(error)),
        });
    }
    if value.pointer("/response/subtype").and_then(Value::as_str) == Some("error") {
        let error = value
            .pointer("/response/error")
            .cloned()
            .unwrap_or(Value::Null);
        return Ok(ControlResponse {
            request_id,
            outcome: ControlOutcome::Error(error_text(&error)),
        });
    }

    let payload = value.get("response").cloned().unwrap_or(Value::Null);
    Ok(ControlResponse {
        request_id,
        outcome: ControlOutcome::Success(payload),
    })
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

/// The wire shape of one outbound user turn.
pub(crate) fn user_message(prompt: &str, session_id: Option<&str>) -> Value {
    let mut frame = json!({
        "type": "user",
        "message": { "role": "user", "content": prompt },
        "parent_tool_use_id": Value::Null,
    });
    if let Some(session_id) = session_id {
        frame["session_id"] = Value::String(session_id.to_string());
    }
    frame
}

/// Envelope for a caller-initiated control request.
pub(crate) fn control_request(request_id: &str, subtype: &str, body: Map<String, Value>) -> Value {
    let mut request = Map::new();
    request.insert("subtype".to_string(), Value::String(subtype.to_string()));
    request.extend(body);
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": Value::Object(request),
    })
}

/// Success reply to a process-initiated control request; `payload` fields are
/// merged into the response object.
pub(crate) fn control_success(request_id: &str, payload: Map<String, Value>) -> Value {
    let mut response = Map::new();
    response.insert(
        "request_id".to_string(),
        Value::String(request_id.to_string()),
    );
    response.insert("subtype".to_string(), Value::String("success".to_string()));
    response.extend(payload);
    json!({ "type": "control_response", "response": Value::Object(response) })
}

/// Error reply to a process-initiated control request.
pub(crate) fn control_error(request_id: &str, message: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "request_id": request_id,
            "subtype": "error",
            "error": message,
        }
    })
}
