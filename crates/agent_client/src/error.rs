use std::{path::PathBuf, process::ExitStatus, time::Duration};

use thiserror::Error;

/// Errors surfaced while driving the agent CLI.
#[derive(Debug, Error)]
pub enum AgentClientError {
    #[error("agent binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("agent process exited unexpectedly ({})", format_status(.status))]
    ProcessTerminated { status: Option<ExitStatus> },
    #[error("malformed frame from agent process: {message}")]
    Protocol { message: String },
    #[error("control request `{subtype}` received no response within {timeout:?}")]
    ControlTimeout {
        subtype: &'static str,
        timeout: Duration,
    },
    #[error("agent rejected control request: {message}")]
    ControlError { message: String },
    #[error("session closed while the request was pending")]
    ClosedWhilePending,
    #[error("agent did not produce a result within {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("session is not connected")]
    NotConnected,
    #[error("session is already connected")]
    AlreadyConnected,
    #[error("session is closed")]
    Closed,
    #[error("callback failed: {message}")]
    Callback { message: String },
    #[error("internal error: missing stdin pipe")]
    MissingStdin,
    #[error("internal error: missing stdout pipe")]
    MissingStdout,
    #[error("internal error: missing stderr pipe")]
    MissingStderr,
    #[error("failed to encode outbound frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl AgentClientError {
    /// Errors delivered to many waiters are rebuilt per recipient; this
    /// produces an equivalent instance for the variants that fan out.
    pub(crate) fn replicate(&self) -> AgentClientError {
        match self {
            AgentClientError::ProcessTerminated { status } => {
                AgentClientError::ProcessTerminated { status: *status }
            }
            AgentClientError::ClosedWhilePending => AgentClientError::ClosedWhilePending,
            AgentClientError::Closed => AgentClientError::Closed,
            other => AgentClientError::Protocol {
                message: other.to_string(),
            },
        }
    }
}

fn format_status(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => format!("{status}"),
        None => "exit status unknown".to_string(),
    }
}
