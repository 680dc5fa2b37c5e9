//! One-shot execution: spawn, prompt, collect until the turn's `result`,
//! tear down.

use std::time::Duration;

use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::time;

use crate::{
    message::{AgentMessage, ContentBlock, ResultMessage},
    options::AgentOptions,
    session::AgentSession,
    AgentClientError,
};

/// Outcome classification for a one-shot execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteStatus {
    /// Assistant content arrived and the turn completed without error.
    Success,
    /// The turn completed but produced no assistant content.
    Partial,
    /// The turn errored, or the transport failed before its `result`.
    Error,
}

/// Accounting extracted from the turn's messages.
#[derive(Debug, Clone, Default)]
pub struct ExecuteMetadata {
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<u64>,
    pub duration_api_ms: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub usage: Option<Map<String, Value>>,
}

/// The three views over one completed execution: joined text, the ordered
/// message list, and the metadata record.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub status: ExecuteStatus,
    pub text: String,
    pub messages: Vec<AgentMessage>,
    pub metadata: ExecuteMetadata,
}

impl ExecuteResult {
    /// The turn's `result` message, when one was observed.
    pub fn result_message(&self) -> Option<&ResultMessage> {
        self.messages.iter().find_map(|message| match message {
            AgentMessage::Result(result) => Some(result),
            _ => None,
        })
    }

    /// Structured output from the `result` message, when requested via a
    /// JSON schema.
    pub fn structured_output(&self) -> Option<&Value> {
        self.result_message()?.structured_output.as_ref()
    }
}

/// Runs a single prompt to completion and closes the process.
///
/// The whole execution is bounded by the options' operation timeout. Errors
/// establishing the transport are returned as `Err`; failures after the
/// prompt was sent are reported through [`ExecuteStatus::Error`] with
/// whatever messages arrived.
pub async fn execute(
    prompt: impl AsRef<str>,
    options: AgentOptions,
) -> Result<ExecuteResult, AgentClientError> {
    let timeout = options.operation_timeout;
    let session = AgentSession::new(options);
    session.connect().await?;

    let outcome = run_turn(&session, prompt.as_ref(), timeout).await;
    let _ = session.close().await;
    outcome
}

async fn run_turn(
    session: &AgentSession,
    prompt: &str,
    timeout: Duration,
) -> Result<ExecuteResult, AgentClientError> {
    session.query(prompt).await?;

    let collected = if timeout.is_zero() {
        collect_turn(session).await
    } else {
        match time::timeout(timeout, collect_turn(session)).await {
            Ok(collected) => collected,
            Err(_) => return Err(AgentClientError::Timeout { timeout }),
        }
    };

    Ok(summarize(collected))
}

struct CollectedTurn {
    messages: Vec<AgentMessage>,
    failure: Option<AgentClientError>,
}

async fn collect_turn(session: &AgentSession) -> CollectedTurn {
    let mut stream = session.receive_response();
    let mut messages = Vec::new();
    let mut failure = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(message) => messages.push(message),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    CollectedTurn { messages, failure }
}

fn summarize(collected: CollectedTurn) -> ExecuteResult {
    let CollectedTurn { messages, failure } = collected;

    let mut text = String::new();
    let mut has_assistant_content = false;
    let mut metadata = ExecuteMetadata::default();
    let mut result: Option<&ResultMessage> = None;

    for message in &messages {
        match message {
            AgentMessage::Assistant(assistant) => {
                if assistant
                    .message
                    .content
                    .iter()
                    .any(|block| !matches!(block, ContentBlock::Unknown))
                {
                    has_assistant_content = true;
                }
                text.push_str(&assistant.text());
                if metadata.model.is_none() {
                    metadata.model = assistant.message.model.clone();
                }
            }
            AgentMessage::System(system) => {
                if metadata.model.is_none() {
                    metadata.model = system.model.clone();
                }
            }
            AgentMessage::Result(message) => result = Some(message),
            _ => {}
        }
        if metadata.session_id.is_none() {
            metadata.session_id = message.session_id().map(str::to_string);
        }
    }

    let status = match (&result, &failure) {
        (None, _) | (_, Some(_)) => ExecuteStatus::Error,
        (Some(result), None) if result.is_error => ExecuteStatus::Error,
        (Some(_), None) if has_assistant_content => ExecuteStatus::Success,
        (Some(_), None) => ExecuteStatus::Partial,
    };

    if let Some(result) = result {
        metadata.num_turns = result.num_turns;
        metadata.duration_ms = result.duration_ms;
        metadata.duration_api_ms = result.duration_api_ms;
        metadata.total_cost_usd = result.total_cost_usd;
        metadata.usage = result.usage.clone();
    }

    ExecuteResult {
        status,
        text,
        messages,
        metadata,
    }
}
