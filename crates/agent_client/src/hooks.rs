//! Caller-registered hooks invoked by the agent at points in its
//! tool-execution lifecycle.
//!
//! Registrations are advertised to the process at session start (as the
//! payload of the caller-initiated `initialize` control request) and executed
//! when the process sends a `hook_callback` control request back.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::AgentClientError;

/// Lifecycle points the agent can call back on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    PreCompact,
    Notification,
}

impl HookEvent {
    pub(crate) fn as_wire(&self) -> &'static str {
        match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::Stop => "Stop",
            HookEvent::SubagentStop => "SubagentStop",
            HookEvent::PreCompact => "PreCompact",
            HookEvent::Notification => "Notification",
        }
    }
}

/// Payload handed to a hook callback, decoded from the `hook_callback`
/// control request by its `hook_event_name`.
#[derive(Debug, Clone)]
pub enum HookInput {
    PreToolUse {
        tool_name: String,
        tool_input: Value,
        tool_use_id: Option<String>,
    },
    PostToolUse {
        tool_name: String,
        tool_response: Value,
        tool_use_id: Option<String>,
    },
    /// Hook kinds without a dedicated shape are forwarded verbatim.
    Other {
        hook_event_name: Option<String>,
        payload: Value,
    },
}

impl HookInput {
    pub(crate) fn from_wire(payload: Value) -> HookInput {
        let event = payload
            .get("hook_event_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        match event.as_deref() {
            Some("PreToolUse") => HookInput::PreToolUse {
                tool_name: str_field(&payload, "tool_name"),
                tool_input: payload.get("tool_input").cloned().unwrap_or(Value::Null),
                tool_use_id: opt_str_field(&payload, "tool_use_id"),
            },
            Some("PostToolUse") => HookInput::PostToolUse {
                tool_name: str_field(&payload, "tool_name"),
                tool_response: payload
                    .get("tool_response")
                    .cloned()
                    .unwrap_or(Value::Null),
                tool_use_id: opt_str_field(&payload, "tool_use_id"),
            },
            _ => HookInput::Other {
                hook_event_name: event,
                payload,
            },
        }
    }

    pub(crate) fn tool_name(&self) -> Option<&str> {
        match self {
            HookInput::PreToolUse { tool_name, .. }
            | HookInput::PostToolUse { tool_name, .. } => Some(tool_name),
            HookInput::Other { payload, .. } => {
                payload.get("tool_name").and_then(Value::as_str)
            }
        }
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn opt_str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Outcome of a hook callback, translated to wire form before it is sent
/// back to the process.
#[derive(Debug, Clone, Default)]
pub struct HookOutput {
    /// When false, the agent stops the action the hook was consulted about.
    pub block: bool,
    pub decision: Option<String>,
    pub reason: Option<String>,
    pub permission: Option<HookPermissionOutput>,
}

impl HookOutput {
    pub fn proceed() -> Self {
        HookOutput::default()
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        HookOutput {
            block: true,
            reason: Some(reason.into()),
            ..HookOutput::default()
        }
    }

    pub(crate) fn to_wire(&self) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("continue".to_string(), Value::Bool(!self.block));
        if let Some(decision) = &self.decision {
            out.insert("decision".to_string(), Value::String(decision.clone()));
        }
        if let Some(reason) = &self.reason {
            out.insert("reason".to_string(), Value::String(reason.clone()));
        }
        if let Some(permission) = &self.permission {
            let mut nested = Map::new();
            if let Some(decision) = &permission.permission_decision {
                nested.insert(
                    "permissionDecision".to_string(),
                    Value::String(decision.clone()),
                );
            }
            if let Some(reason) = &permission.permission_decision_reason {
                nested.insert(
                    "permissionDecisionReason".to_string(),
                    Value::String(reason.clone()),
                );
            }
            if let Some(updated) = &permission.updated_input {
                nested.insert("updatedInput".to_string(), updated.clone());
            }
            out.insert("hookSpecificOutput".to_string(), Value::Object(nested));
        }
        out
    }
}

/// Permission-hook specifics nested under `hookSpecificOutput`.
#[derive(Debug, Clone, Default)]
pub struct HookPermissionOutput {
    pub permission_decision: Option<String>,
    pub permission_decision_reason: Option<String>,
    /// Replaces the tool invocation's input before execution proceeds.
    pub updated_input: Option<Value>,
}

/// Async hook callback. The boxed future keeps registrations object-safe.
pub type HookCallback = Arc<
    dyn Fn(HookInput) -> BoxFuture<'static, Result<HookOutput, AgentClientError>> + Send + Sync,
>;

struct HookRegistration {
    id: String,
    event: HookEvent,
    pattern: Option<Regex>,
    callback: HookCallback,
}

/// Registry of hook callbacks keyed by event kind and tool-name pattern.
///
/// Registration is copy-on-write: dispatch snapshots the registration list
/// once per inbound request, so a concurrent register/unregister never
/// affects an in-flight execution.
#[derive(Default)]
pub struct HookRegistry {
    entries: RwLock<Arc<Vec<Arc<HookRegistration>>>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for `event`, optionally restricted to tool names
    /// matching `tool_pattern` (a regex; alternation covers multiple names).
    /// Returns the stable callback identifier advertised to the process.
    pub fn register(
        &self,
        event: HookEvent,
        tool_pattern: Option<&str>,
        callback: HookCallback,
    ) -> Result<String, AgentClientError> {
        let pattern = match tool_pattern {
            Some(raw) => Some(Regex::new(raw).map_err(|err| AgentClientError::Callback {
                message: format!("invalid hook tool pattern `{raw}`: {err}"),
            })?),
            None => None,
        };
        let id = format!("hook_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let registration = Arc::new(HookRegistration {
            id: id.clone(),
            event,
            pattern,
            callback,
        });

        let mut guard = self.entries.write().expect("hook registry poisoned");
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(registration);
        *guard = Arc::new(next);
        Ok(id)
    }

    /// Removes a registration; returns whether it existed.
    pub fn unregister(&self, id: &str) -> bool {
        let mut guard = self.entries.write().expect("hook registry poisoned");
        if !guard.iter().any(|entry| entry.id == id) {
            return false;
        }
        let next: Vec<_> = guard
            .iter()
            .filter(|entry| entry.id != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .read()
            .expect("hook registry poisoned")
            .is_empty()
    }

    fn snapshot(&self) -> Arc<Vec<Arc<HookRegistration>>> {
        self.entries
            .read()
            .expect("hook registry poisoned")
            .clone()
    }

    /// The `hooks` payload of the caller-initiated `initialize` request:
    /// every registration's event, pattern, and callback identifier.
    /// `None` when the registry is empty (no `initialize` is sent).
    pub(crate) fn build_configuration(&self) -> Option<Value> {
        let entries = self.snapshot();
        if entries.is_empty() {
            return None;
        }

        let mut hooks = Map::new();
        for entry in entries.iter() {
            let matcher = entry
                .pattern
                .as_ref()
                .map(|p| Value::String(p.as_str().to_string()))
                .unwrap_or(Value::Null);
            let config = json!({
                "matcher": matcher,
                "hookCallbackIds": [entry.id],
            });
            hooks
                .entry(entry.event.as_wire().to_string())
                .or_insert_with(|| Value::Array(Vec::new()))
                .as_array_mut()
                .expect("hook config entries are arrays")
                .push(config);
        }
        Some(Value::Object(hooks))
    }

    /// Executes the registrations matching a `hook_callback` request.
    ///
    /// The identified registration anchors the event kind; every registration
    /// for that event whose pattern matches the input's tool name runs, in
    /// registration order. A registration whose pattern does not match the
    /// tool name is skipped even when named by `callback_id`. Outputs merge:
    /// any block wins, any non-null updated input wins, last non-null reason
    /// wins.
    pub(crate) async fn execute(
        &self,
        callback_id: &str,
        input: Value,
    ) -> Result<HookOutput, AgentClientError> {
        let entries = self.snapshot();
        let anchor = entries
            .iter()
            .find(|entry| entry.id == callback_id)
            .ok_or_else(|| AgentClientError::Callback {
                message: format!("unknown hook callback id `{callback_id}`"),
            })?;

        let input = HookInput::from_wire(input);
        let tool_name = input.tool_name();

        let mut merged = HookOutput::proceed();
        let mut invoked = 0usize;
        for entry in entries.iter().filter(|entry| entry.event == anchor.event) {
            if !pattern_matches(entry.pattern.as_ref(), tool_name) {
                continue;
            }
            invoked += 1;
            match (entry.callback)(input.clone()).await {
                Ok(output) => merge_outputs(&mut merged, output),
                Err(err) => {
                    warn!(callback_id = %entry.id, error = %err, "hook callback failed");
                    return Err(AgentClientError::Callback {
                        message: format!("hook `{}` failed: {err}", entry.id),
                    });
                }
            }
            if merged.block {
                break;
            }
        }

        if invoked == 0 {
            // Pattern mismatch: the hook is not consulted and the action
            // proceeds unmodified.
            return Ok(HookOutput::proceed());
        }
        Ok(merged)
    }
}

fn pattern_matches(pattern: Option<&Regex>, tool_name: Option<&str>) -> bool {
    match (pattern, tool_name) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(pattern), Some(name)) => pattern.is_match(name),
    }
}

fn merge_outputs(merged: &mut HookOutput, next: HookOutput) {
    if next.block {
        merged.block = true;
    }
    if next.decision.is_some() {
        merged.decision = next.decision;
    }
    if next.reason.is_some() {
        merged.reason = next.reason;
    }
    match (&mut merged.permission, next.permission) {
        (_, None) => {}
        (slot @ None, Some(perm)) => *slot = Some(perm),
        (Some(existing), Some(perm)) => {
            if perm.permission_decision.is_some() {
                existing.permission_decision = perm.permission_decision;
            }
            if perm.permission_decision_reason.is_some() {
                existing.permission_decision_reason = perm.permission_decision_reason;
            }
            if perm.updated_input.is_some() {
                existing.updated_input = perm.updated_input;
            }
        }
    }
}
