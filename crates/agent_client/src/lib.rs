#![forbid(unsafe_code)]
//! Async client for driving a conversational-agent CLI over bidirectional
//! newline-delimited JSON on stdin/stdout.
//!
//! The library spawns and supervises the agent binary, streams its
//! data-plane messages (`system` / `assistant` / `user` / `result` /
//! `stream_event`) back to the caller, and interleaves a control-plane
//! request/response protocol that lets the process invoke caller-side
//! callbacks mid-conversation: lifecycle hooks, tool-permission checks, and
//! in-process tool servers.
//!
//! ## Setup: binary resolution
//! - Defaults pull `AGENT_BINARY` or `agent` on `PATH`; call
//!   [`AgentOptionsBuilder::binary`] to pin a packaged binary.
//! - Three framing arguments are always injected on spawn: stream-json
//!   output, stream-json input, verbose. Everything else derives from the
//!   options record; see [`AgentOptions::to_argv`].
//!
//! ## Surfaces
//! - [`execute`] for a single prompt/response with joined text, the full
//!   message list, and a metadata record.
//! - [`AgentSession`] for iterator-style multi-turn conversations:
//!   [`AgentSession::query`], [`AgentSession::receive_response`] (one turn),
//!   [`AgentSession::receive_messages`] (unbounded), plus `interrupt`,
//!   `set_model`, and `set_permission_mode` control operations.
//! - [`ReactiveSession`] for lazy per-turn producers: each
//!   [`ReactiveSession::query`] returns a [`TurnHandle`] whose `text()`,
//!   `text_stream()`, and `messages()` perform no IO until subscribed.
//!
//! ```rust,no_run
//! use agent_client::{execute, AgentOptions};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = AgentOptions::builder().model("sonnet").build();
//! let outcome = execute("What is 2+2?", options).await?;
//! println!("{}", outcome.text);
//! # Ok(()) }
//! ```
//!
//! ## Callbacks
//! Hooks register against an event kind plus an optional tool-name pattern
//! ([`AgentOptionsBuilder::hook`]); registrations are advertised to the
//! process at connect when any exist. A single permission callback
//! ([`AgentOptionsBuilder::can_use_tool`]) answers `can_use_tool` requests;
//! in-process tool servers ([`McpServerConfig::Sdk`]) answer `mcp_message`
//! requests. All callbacks run on worker tasks, never on the reader, and a
//! failing callback becomes an error response to the process rather than a
//! session failure.

mod control;
mod error;
mod exec;
mod hooks;
mod mcp;
mod message;
mod options;
mod permission;
mod process;
mod protocol;
mod reactive;
mod router;
mod session;
mod transport;

pub use error::AgentClientError;
pub use exec::{execute, ExecuteMetadata, ExecuteResult, ExecuteStatus};
pub use hooks::{
    HookCallback, HookEvent, HookInput, HookOutput, HookPermissionOutput, HookRegistry,
};
pub use mcp::{McpServerConfig, ToolServerHandler};
pub use message::{
    AgentMessage, AssistantMessage, AssistantPayload, ContentBlock, ResultMessage,
    StreamEventMessage, SystemMessage, UserContent, UserMessage, UserPayload,
};
pub use options::{AgentDefinition, AgentOptions, AgentOptionsBuilder, PermissionMode};
pub use permission::{PermissionCallback, PermissionContext, PermissionDecision};
pub use protocol::{
    ControlOutcome, ControlRequest, ControlRequestPayload, ControlResponse, InboundFrame,
};
pub use reactive::{ReactiveSession, TurnHandle};
pub use session::{AgentSession, MessageStream, RawFrameStream, TextStream};
