//! The immutable options record and its translation into the agent CLI's
//! argument vector.

use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    hooks::{HookCallback, HookEvent, HookRegistry},
    mcp::McpServerConfig,
    permission::PermissionCallback,
    AgentClientError,
};

/// How tool-permission prompts are resolved by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
    /// Encoded as the dedicated dangerous-mode flag rather than
    /// `--permission-mode`.
    DangerouslySkipPermissions,
}

impl PermissionMode {
    pub(crate) fn as_arg_value(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::DangerouslySkipPermissions => "dangerouslySkipPermissions",
        }
    }
}

/// A named sub-agent template, JSON-encoded into the `--agents` argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub description: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Immutable configuration for one session, composed before connect.
///
/// Build with [`AgentOptions::builder`].
#[derive(Clone, Default)]
pub struct AgentOptions {
    pub(crate) binary: Option<PathBuf>,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) model: Option<String>,
    pub(crate) fallback_model: Option<String>,
    pub(crate) system_prompt: Option<String>,
    pub(crate) append_system_prompt: Option<String>,
    pub(crate) tools: Option<Vec<String>>,
    pub(crate) allowed_tools: Vec<String>,
    pub(crate) disallowed_tools: Vec<String>,
    pub(crate) permission_mode: Option<PermissionMode>,
    pub(crate) permission_prompt_tool_name: Option<String>,
    pub(crate) max_turns: Option<u32>,
    pub(crate) max_budget_usd: Option<f64>,
    /// Accepted for API completeness; the CLI has no corresponding argument,
    /// so this field is never encoded. Use `extra_arg` to map it manually.
    pub(crate) max_tokens: Option<u32>,
    pub(crate) max_thinking_tokens: Option<u32>,
    pub(crate) resume: Option<String>,
    pub(crate) continue_conversation: bool,
    pub(crate) fork_session: bool,
    pub(crate) include_partial_messages: bool,
    pub(crate) json_schema: Option<Value>,
    pub(crate) agents: BTreeMap<String, AgentDefinition>,
    pub(crate) mcp_servers: BTreeMap<String, McpServerConfig>,
    pub(crate) add_dirs: Vec<PathBuf>,
    pub(crate) plugins: Vec<PathBuf>,
    pub(crate) settings: Option<PathBuf>,
    pub(crate) setting_sources: Option<Vec<String>>,
    pub(crate) extra_args: BTreeMap<String, Option<String>>,
    pub(crate) operation_timeout: Duration,
    pub(crate) close_grace: Duration,
    pub(crate) mirror_stderr: bool,
    pub(crate) hooks: Arc<HookRegistry>,
    pub(crate) can_use_tool: Option<PermissionCallback>,
}

impl AgentOptions {
    pub fn builder() -> AgentOptionsBuilder {
        AgentOptionsBuilder::default()
    }

    /// Builds the argument vector for the spawned process.
    ///
    /// The three framing arguments are always present; everything else is
    /// derived from the record. Ordering is deterministic so the vector can
    /// be asserted against byte-for-byte.
    pub fn to_argv(&self) -> Vec<String> {
        let mut out: Vec<String> = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(model) = &self.model {
            push_value(&mut out, "--model", model.clone());
        }
        if let Some(fallback) = &self.fallback_model {
            push_value(&mut out, "--fallback-model", fallback.clone());
        }
        if let Some(prompt) = &self.system_prompt {
            push_value(&mut out, "--system-prompt", prompt.clone());
        }
        if let Some(append) = &self.append_system_prompt {
            push_value(&mut out, "--append-system-prompt", append.clone());
        }
        if let Some(tools) = &self.tools {
            // An empty list still emits the flag: empty string disables all.
            push_value(&mut out, "--tools", tools.join(","));
        }
        if !self.allowed_tools.is_empty() {
            push_value(&mut out, "--allowedTools", self.allowed_tools.join(","));
        }
        if !self.disallowed_tools.is_empty() {
            push_value(&mut out, "--disallowedTools", self.disallowed_tools.join(","));
        }
        match self.permission_mode {
            Some(PermissionMode::DangerouslySkipPermissions) => {
                out.push("--dangerously-skip-permissions".to_string());
            }
            Some(mode) => {
                push_value(&mut out, "--permission-mode", mode.as_arg_value().to_string())
            }
            None => {}
        }
        if let Some(tool) = &self.permission_prompt_tool_name {
            push_value(&mut out, "--permission-prompt-tool", tool.clone());
        }
        if let Some(max_turns) = self.max_turns {
            push_value(&mut out, "--max-turns", max_turns.to_string());
        }
        if let Some(budget) = self.max_budget_usd {
            push_value(&mut out, "--max-budget-usd", budget.to_string());
        }
        if let Some(thinking) = self.max_thinking_tokens {
            push_value(&mut out, "--max-thinking-tokens", thinking.to_string());
        }
        if let Some(schema) = &self.json_schema {
            push_value(&mut out, "--json-schema", schema.to_string());
        }
        if !self.agents.is_empty() {
            let encoded = serde_json::to_string(&self.agents)
                .expect("agent definitions serialize to JSON");
            push_value(&mut out, "--agents", encoded);
        }
        if let Some(config) = self.external_mcp_config() {
            push_value(&mut out, "--mcp-config", config.to_string());
        }
        for dir in &self.add_dirs {
            push_value(&mut out, "--add-dir", dir.display().to_string());
        }
        for plugin in &self.plugins {
            push_value(&mut out, "--plugin-dir", plugin.display().to_string());
        }
        if let Some(settings) = &self.settings {
            push_value(&mut out, "--settings", settings.display().to_string());
        }
        if let Some(sources) = &self.setting_sources {
            push_value(&mut out, "--setting-sources", sources.join(","));
        }
        if self.continue_conversation {
            out.push("--continue".to_string());
        }
        if let Some(resume) = &self.resume {
            push_value(&mut out, "--resume", resume.clone());
        }
        if self.fork_session {
            out.push("--fork-session".to_string());
        }
        if self.include_partial_messages {
            out.push("--include-partial-messages".to_string());
        }
        for (key, value) in &self.extra_args {
            out.push(format!("--{key}"));
            if let Some(value) = value {
                out.push(value.clone());
            }
        }

        out
    }

    /// The `--mcp-config` JSON covering external server entries, or `None`
    /// when every configured server is in-process.
    pub(crate) fn external_mcp_config(&self) -> Option<Value> {
        let external: serde_json::Map<String, Value> = self
            .mcp_servers
            .iter()
            .filter_map(|(name, config)| config.wire_value().map(|v| (name.clone(), v)))
            .collect();
        if external.is_empty() {
            return None;
        }
        Some(json!({ "mcpServers": external }))
    }

    /// In-process tool-server handlers, keyed by server name.
    pub(crate) fn sdk_servers(
        &self,
    ) -> BTreeMap<String, Arc<dyn crate::mcp::ToolServerHandler>> {
        self.mcp_servers
            .iter()
            .filter_map(|(name, config)| match config {
                McpServerConfig::Sdk { handler } => Some((name.clone(), handler.clone())),
                _ => None,
            })
            .collect()
    }
}

fn push_value(out: &mut Vec<String>, flag: &str, value: String) {
    out.push(flag.to_string());
    out.push(value);
}

impl fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentOptions")
            .field("binary", &self.binary)
            .field("working_dir", &self.working_dir)
            .field("model", &self.model)
            .field("fallback_model", &self.fallback_model)
            .field("permission_mode", &self.permission_mode)
            .field("max_turns", &self.max_turns)
            .field("resume", &self.resume)
            .field("continue_conversation", &self.continue_conversation)
            .field("fork_session", &self.fork_session)
            .field("mcp_servers", &self.mcp_servers)
            .field("extra_args", &self.extra_args)
            .field("operation_timeout", &self.operation_timeout)
            .field("hooks_registered", &!self.hooks.is_empty())
            .field(
                "can_use_tool",
                &self.can_use_tool.as_ref().map(|_| "<callback>"),
            )
            .finish_non_exhaustive()
    }
}

/// Chained builder for [`AgentOptions`].
pub struct AgentOptionsBuilder {
    options: AgentOptions,
}

impl Default for AgentOptionsBuilder {
    fn default() -> Self {
        Self {
            options: AgentOptions {
                operation_timeout: Duration::from_secs(60),
                close_grace: Duration::from_secs(2),
                ..AgentOptions::default()
            },
        }
    }
}

impl AgentOptionsBuilder {
    /// Pins the agent binary instead of resolving `AGENT_BINARY` / `PATH`.
    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.options.binary = Some(binary.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable applied to the child process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.insert(key.into(), value.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.options.model = (!model.trim().is_empty()).then_some(model);
        self
    }

    pub fn fallback_model(mut self, model: impl Into<String>) -> Self {
        self.options.fallback_model = Some(model.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.system_prompt = Some(prompt.into());
        self
    }

    pub fn append_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.append_system_prompt = Some(prompt.into());
        self
    }

    /// Replaces the base tool set. An empty list disables all tools.
    pub fn tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn allowed_tool(mut self, tool: impl Into<String>) -> Self {
        self.options.allowed_tools.push(tool.into());
        self
    }

    pub fn disallowed_tool(mut self, tool: impl Into<String>) -> Self {
        self.options.disallowed_tools.push(tool.into());
        self
    }

    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.options.permission_mode = Some(mode);
        self
    }

    pub fn permission_prompt_tool_name(mut self, name: impl Into<String>) -> Self {
        self.options.permission_prompt_tool_name = Some(name.into());
        self
    }

    pub fn max_turns(mut self, turns: u32) -> Self {
        self.options.max_turns = Some(turns);
        self
    }

    pub fn max_budget_usd(mut self, budget: f64) -> Self {
        self.options.max_budget_usd = Some(budget);
        self
    }

    /// Carried on the record but not mapped to any argument; see the field
    /// documentation.
    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.options.max_tokens = Some(tokens);
        self
    }

    pub fn max_thinking_tokens(mut self, tokens: u32) -> Self {
        self.options.max_thinking_tokens = Some(tokens);
        self
    }

    /// Resumes the named prior session.
    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.options.resume = Some(session_id.into());
        self
    }

    pub fn continue_conversation(mut self, enable: bool) -> Self {
        self.options.continue_conversation = enable;
        self
    }

    pub fn fork_session(mut self, enable: bool) -> Self {
        self.options.fork_session = enable;
        self
    }

    pub fn include_partial_messages(mut self, enable: bool) -> Self {
        self.options.include_partial_messages = enable;
        self
    }

    /// Structured-output contract, JSON-encoded into `--json-schema`.
    pub fn json_schema(mut self, schema: Value) -> Self {
        self.options.json_schema = Some(schema);
        self
    }

    pub fn agent(mut self, name: impl Into<String>, definition: AgentDefinition) -> Self {
        self.options.agents.insert(name.into(), definition);
        self
    }

    pub fn mcp_server(mut self, name: impl Into<String>, config: McpServerConfig) -> Self {
        self.options.mcp_servers.insert(name.into(), config);
        self
    }

    pub fn add_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.add_dirs.push(dir.into());
        self
    }

    pub fn plugin(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.plugins.push(dir.into());
        self
    }

    pub fn settings(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.settings = Some(path.into());
        self
    }

    pub fn setting_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.setting_sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    /// Escape hatch: `--key value`, or bare `--key` when `value` is `None`.
    pub fn extra_arg(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.options.extra_args.insert(key.into(), value);
        self
    }

    /// Deadline for each caller-initiated control request, and the overall
    /// bound on one-shot execution. Defaults to 60 seconds.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.options.operation_timeout = timeout;
        self
    }

    /// Grace period between closing the process's stdin and forcing
    /// termination. Defaults to 2 seconds.
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.options.close_grace = grace;
        self
    }

    /// Mirrors the agent's stderr to this process's stderr in addition to
    /// logging it.
    pub fn mirror_stderr(mut self, enable: bool) -> Self {
        self.options.mirror_stderr = enable;
        self
    }

    /// Registers a hook callback; see [`HookRegistry::register`].
    pub fn hook(
        self,
        event: HookEvent,
        tool_pattern: Option<&str>,
        callback: HookCallback,
    ) -> Result<Self, AgentClientError> {
        self.options.hooks.register(event, tool_pattern, callback)?;
        Ok(self)
    }

    /// Sets the permission decision callback consulted for `can_use_tool`.
    pub fn can_use_tool(mut self, callback: PermissionCallback) -> Self {
        self.options.can_use_tool = Some(callback);
        self
    }

    pub fn build(self) -> AgentOptions {
        self.options
    }
}
