//! Tool-server configuration and the in-process handler contract.
//!
//! External servers (stdio/sse/http) are serialized into the `--mcp-config`
//! argument at spawn time. In-process (`sdk`) servers never reach the argv:
//! they are registered with the session and answer `mcp_message` control
//! requests directly.

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::AgentClientError;

/// Caller-supplied handler answering `mcp_message` control requests for one
/// named in-process tool server.
///
/// The handler receives the inner protocol message verbatim and returns the
/// reply to forward. Errors are converted into control-plane error responses;
/// they never terminate the session.
#[async_trait]
pub trait ToolServerHandler: Send + Sync {
    async fn handle_message(&self, message: Value) -> Result<Value, AgentClientError>;
}

/// Configuration for one tool server, keyed by name in
/// [`crate::AgentOptionsBuilder::mcp_server`].
#[derive(Clone)]
pub enum McpServerConfig {
    /// External process speaking the tool protocol over stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    /// External server reached over server-sent events.
    Sse {
        url: String,
        headers: BTreeMap<String, String>,
    },
    /// External server reached over HTTP.
    Http {
        url: String,
        headers: BTreeMap<String, String>,
    },
    /// In-process server backed by a caller-supplied handler.
    Sdk { handler: Arc<dyn ToolServerHandler> },
}

impl McpServerConfig {
    pub fn stdio(command: impl Into<String>) -> Self {
        McpServerConfig::Stdio {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn sdk(handler: Arc<dyn ToolServerHandler>) -> Self {
        McpServerConfig::Sdk { handler }
    }

    /// The JSON entry used inside `--mcp-config` for external servers.
    /// In-process servers have no wire form and return `None`.
    pub(crate) fn wire_value(&self) -> Option<Value> {
        match self {
            McpServerConfig::Stdio { command, args, env } => {
                let mut entry = json!({ "type": "stdio", "command": command });
                if !args.is_empty() {
                    entry["args"] = json!(args);
                }
                if !env.is_empty() {
                    entry["env"] = json!(env);
                }
                Some(entry)
            }
            McpServerConfig::Sse { url, headers } => {
                let mut entry = json!({ "type": "sse", "url": url });
                if !headers.is_empty() {
                    entry["headers"] = json!(headers);
                }
                Some(entry)
            }
            McpServerConfig::Http { url, headers } => {
                let mut entry = json!({ "type": "http", "url": url });
                if !headers.is_empty() {
                    entry["headers"] = json!(headers);
                }
                Some(entry)
            }
            McpServerConfig::Sdk { .. } => None,
        }
    }
}

impl fmt::Debug for McpServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpServerConfig::Stdio { command, args, env } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("env", env)
                .finish(),
            McpServerConfig::Sse { url, .. } => {
                f.debug_struct("Sse").field("url", url).finish()
            }
            McpServerConfig::Http { url, .. } => {
                f.debug_struct("Http").field("url", url).finish()
            }
            McpServerConfig::Sdk { .. } => f.debug_struct("Sdk").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_entries_have_wire_values_and_sdk_does_not() {
        let stdio = McpServerConfig::stdio("tool-server");
        let wire = stdio.wire_value().expect("stdio is external");
        assert_eq!(wire["type"], "stdio");
        assert_eq!(wire["command"], "tool-server");
        assert!(wire.get("args").is_none());

        struct Nop;
        #[async_trait]
        impl ToolServerHandler for Nop {
            async fn handle_message(&self, _message: Value) -> Result<Value, AgentClientError> {
                Ok(Value::Null)
            }
        }

        let sdk = McpServerConfig::sdk(Arc::new(Nop));
        assert!(sdk.wire_value().is_none());
    }
}
