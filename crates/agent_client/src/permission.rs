//! The permission decision point: one caller-registered callback consulted
//! when the process asks whether a tool may run with given arguments.

use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::AgentClientError;

/// Verdict for a `can_use_tool` control request.
#[derive(Debug, Clone)]
pub enum PermissionDecision {
    Allow,
    /// Allow, replacing the tool invocation's input.
    AllowWithUpdatedInput(Value),
    Deny { message: Option<String> },
}

impl PermissionDecision {
    pub fn deny(message: impl Into<String>) -> Self {
        PermissionDecision::Deny {
            message: Some(message.into()),
        }
    }

    pub(crate) fn to_wire(&self) -> Map<String, Value> {
        let mut out = Map::new();
        match self {
            PermissionDecision::Allow => {
                out.insert("behavior".to_string(), Value::String("allow".to_string()));
            }
            PermissionDecision::AllowWithUpdatedInput(input) => {
                out.insert("behavior".to_string(), Value::String("allow".to_string()));
                out.insert("updatedInput".to_string(), input.clone());
            }
            PermissionDecision::Deny { message } => {
                out.insert("behavior".to_string(), Value::String("deny".to_string()));
                if let Some(message) = message {
                    out.insert("message".to_string(), Value::String(message.clone()));
                }
            }
        }
        out
    }
}

/// Context forwarded alongside the tool name and input.
#[derive(Debug, Clone)]
pub struct PermissionContext {
    /// Suggestions the process attached to the request, verbatim.
    pub suggestions: Option<Value>,
    /// Identifier of the control request that asked.
    pub request_id: String,
}

pub type PermissionCallback = Arc<
    dyn Fn(String, Value, PermissionContext) -> BoxFuture<'static, Result<PermissionDecision, AgentClientError>>
        + Send
        + Sync,
>;

/// Holds the (single) registered callback. Absent a callback the default
/// decision is allow.
#[derive(Default)]
pub(crate) struct PermissionSlot {
    callback: RwLock<Option<PermissionCallback>>,
}

impl PermissionSlot {
    pub(crate) fn set(&self, callback: Option<PermissionCallback>) {
        *self.callback.write().expect("permission slot poisoned") = callback;
    }

    /// Evaluates the callback. A callback error becomes a deny carrying the
    /// error text; the decision itself is never rewritten.
    pub(crate) async fn evaluate(
        &self,
        tool_name: String,
        input: Value,
        context: PermissionContext,
    ) -> PermissionDecision {
        let callback = self
            .callback
            .read()
            .expect("permission slot poisoned")
            .clone();
        let Some(callback) = callback else {
            return PermissionDecision::Allow;
        };
        match callback(tool_name, input, context).await {
            Ok(decision) => decision,
            Err(err) => PermissionDecision::deny(format!("callback error: {err}")),
        }
    }
}
