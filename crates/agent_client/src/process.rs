//! Process supervision: binary resolution, spawn with busy retry, and
//! ordered teardown.

use std::{
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};

use tokio::{
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    time,
};
use tracing::{debug, warn};

use crate::{AgentClientError, AgentOptions};

/// Environment variable overriding binary resolution.
pub(crate) const BINARY_ENV: &str = "AGENT_BINARY";

/// The spawned agent with its pipes detached, ready for the IO tasks.
pub(crate) struct SpawnedAgent {
    pub(crate) child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: ChildStderr,
    pub(crate) binary: PathBuf,
}

pub(crate) fn resolve_binary(options: &AgentOptions) -> PathBuf {
    if let Some(binary) = options.binary.as_ref() {
        return binary.clone();
    }
    if let Ok(value) = std::env::var(BINARY_ENV) {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    PathBuf::from("agent")
}

pub(crate) async fn spawn_agent(
    options: &AgentOptions,
) -> Result<SpawnedAgent, AgentClientError> {
    let binary = resolve_binary(options);
    let argv = options.to_argv();

    let mut command = Command::new(&binary);
    command
        .args(&argv)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = options.working_dir.as_ref() {
        command.current_dir(dir);
    }
    for (key, value) in &options.env {
        command.env(key, value);
    }

    let mut child = spawn_with_retry(&mut command, &binary).await?;
    debug!(binary = ?binary, args = argv.len(), "spawned agent process");

    let stdin = child.stdin.take().ok_or(AgentClientError::MissingStdin)?;
    let stdout = child.stdout.take().ok_or(AgentClientError::MissingStdout)?;
    let stderr = child.stderr.take().ok_or(AgentClientError::MissingStderr)?;

    Ok(SpawnedAgent {
        child,
        stdin,
        stdout,
        stderr,
        binary,
    })
}

/// Waits applied between spawn attempts when the binary is briefly
/// unavailable (ETXTBSY while an installer still has it open for write).
const SPAWN_BACKOFF: [Duration; 4] = [
    Duration::from_millis(5),
    Duration::from_millis(10),
    Duration::from_millis(20),
    Duration::from_millis(40),
];

async fn spawn_with_retry(
    command: &mut Command,
    binary: &Path,
) -> Result<Child, AgentClientError> {
    for backoff in SPAWN_BACKOFF {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) if source.kind() == std::io::ErrorKind::ExecutableFileBusy => {
                time::sleep(backoff).await;
            }
            Err(source) => {
                return Err(AgentClientError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                });
            }
        }
    }

    command.spawn().map_err(|source| AgentClientError::Spawn {
        binary: binary.to_path_buf(),
        source,
    })
}

/// Reaps the child after stdin has been closed: a grace wait first, then a
/// forced kill. Returns the exit status when one was observed.
pub(crate) async fn reap(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return Some(status),
        Ok(Err(err)) => {
            warn!(error = %err, "failed waiting for agent process");
            return None;
        }
        Err(_) => {}
    }

    if let Err(err) = child.start_kill() {
        warn!(error = %err, "failed to kill agent process");
    }
    match child.wait().await {
        Ok(status) => Some(status),
        Err(err) => {
            warn!(error = %err, "failed reaping agent process");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_binary_wins_over_environment() {
        let options = AgentOptions::builder().binary("/opt/agent/bin/agent").build();
        assert_eq!(
            resolve_binary(&options),
            PathBuf::from("/opt/agent/bin/agent")
        );
    }

    #[test]
    fn default_binary_is_resolved_from_path() {
        let options = AgentOptions::builder().build();
        // With no override configured the bare name is handed to the OS
        // loader, which consults PATH.
        if std::env::var(BINARY_ENV).is_err() {
            assert_eq!(resolve_binary(&options), PathBuf::from("agent"));
        }
    }
}
