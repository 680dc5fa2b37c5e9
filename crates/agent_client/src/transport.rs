//! Line-framed IO over the agent's stdin/stderr.
//!
//! Stdin is owned by a single writer task fed through an unbounded channel,
//! so concurrent callers can never interleave partial objects. Stderr is
//! drained in the background and surfaced as diagnostics only.

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStderr, ChildStdin},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) enum WriterCommand {
    /// One serialized JSON object, written with a trailing newline.
    Line(String),
    /// Close stdin so the process can drain and exit.
    Shutdown,
}

pub(crate) fn spawn_writer(
    stdin: ChildStdin,
) -> (mpsc::UnboundedSender<WriterCommand>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(writer_task(stdin, rx));
    (tx, handle)
}

async fn writer_task(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Line(line) => {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
            WriterCommand::Shutdown => break,
        }
    }

    let _ = stdin.shutdown().await;
}

pub(crate) fn spawn_stderr(stderr: ChildStderr, mirror: bool) -> JoinHandle<()> {
    tokio::spawn(stderr_task(stderr, mirror))
}

async fn stderr_task(stderr: ChildStderr, mirror: bool) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if mirror {
            eprintln!("[agent stderr] {line}");
        } else {
            debug!("agent stderr: {line}");
        }
    }
}

/// Parses one stdout line into a JSON value. Empty lines are skipped and
/// malformed lines are logged and skipped; the process interleaves
/// diagnostic noise on stdout and a bad line must never take the session
/// down.
pub(crate) fn parse_line(line: &str) -> Option<serde_json::Value> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, "skipping non-JSON stdout line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_is_tolerant_and_line_oriented() {
        assert!(parse_line("   ").is_none());
        assert!(parse_line("{\"k\":1}\r").is_some());
        assert!(parse_line("{not-json}").is_none());
        assert!(parse_line("{\"k\":2}").is_some());
    }
}
