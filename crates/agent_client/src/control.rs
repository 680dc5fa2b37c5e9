//! Correlation of caller-initiated control requests with their responses.
//!
//! Each request installs a single-shot reply slot keyed by a locally unique
//! identifier. A slot is resolved exactly once: by a matching response, by
//! the deadline elapsing (the entry is removed in the same step, so a late
//! response cannot resolve a failed slot), or by session close.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde_json::{Map, Value};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    time,
};
use tracing::debug;

use crate::{
    protocol::{self, ControlOutcome, ControlResponse},
    transport::WriterCommand,
    AgentClientError,
};

type ReplySlot = oneshot::Sender<Result<Value, AgentClientError>>;

pub(crate) struct Correlator {
    pending: Mutex<HashMap<String, ReplySlot>>,
    next_id: AtomicU64,
    prefix: String,
    writer: mpsc::UnboundedSender<WriterCommand>,
    operation_timeout: Duration,
}

impl Correlator {
    pub(crate) fn new(
        prefix: String,
        writer: mpsc::UnboundedSender<WriterCommand>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            prefix,
            writer,
            operation_timeout,
        }
    }

    /// Sends one control request and waits for its response up to the
    /// operation timeout.
    pub(crate) async fn send_request(
        &self,
        subtype: &'static str,
        body: Map<String, Value>,
    ) -> Result<Value, AgentClientError> {
        let id = format!(
            "{}-{}",
            self.prefix,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        let envelope = protocol::control_request(&id, subtype, body);
        let line = serde_json::to_string(&envelope)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.pending.lock().await;
            guard.insert(id.clone(), tx);
        }

        if self.writer.send(WriterCommand::Line(line)).is_err() {
            let mut guard = self.pending.lock().await;
            guard.remove(&id);
            return Err(AgentClientError::Closed);
        }

        match time::timeout(self.operation_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AgentClientError::ClosedWhilePending),
            Err(_) => {
                // Remove the slot before reporting the timeout; a response
                // arriving after this point finds nothing to resolve.
                let mut guard = self.pending.lock().await;
                guard.remove(&id);
                Err(AgentClientError::ControlTimeout {
                    subtype,
                    timeout: self.operation_timeout,
                })
            }
        }
    }

    /// Resolves the slot matching an inbound control response.
    pub(crate) async fn resolve(&self, response: ControlResponse) {
        let sender = {
            let mut guard = self.pending.lock().await;
            guard.remove(&response.request_id)
        };
        let Some(tx) = sender else {
            debug!(
                request_id = %response.request_id,
                "control response for unknown or timed-out request"
            );
            return;
        };

        let outcome = match response.outcome {
            ControlOutcome::Success(payload) => Ok(payload),
            ControlOutcome::Error(message) => Err(AgentClientError::ControlError { message }),
        };
        let _ = tx.send(outcome);
    }

    /// Fails every pending slot; used on close and on unexpected process
    /// exit.
    pub(crate) async fn fail_all(&self, err: &AgentClientError) {
        let mut guard = self.pending.lock().await;
        for (_, tx) in guard.drain() {
            let _ = tx.send(Err(err.replicate()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InboundFrame;

    fn correlator(timeout: Duration) -> (Correlator, mpsc::UnboundedReceiver<WriterCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Correlator::new("c0".to_string(), tx, timeout), rx)
    }

    fn response_frame(raw: Value) -> ControlResponse {
        match crate::protocol::classify(raw).expect("classify") {
            InboundFrame::ControlResponse(resp) => resp,
            _ => panic!("expected control response"),
        }
    }

    #[tokio::test]
    async fn success_response_resolves_the_request() {
        let (correlator, mut writer) = correlator(Duration::from_secs(1));

        let send = correlator.send_request("set_model", Map::new());
        let resolve = async {
            let command = writer.recv().await.expect("request written");
            let WriterCommand::Line(line) = command else {
                panic!("expected line");
            };
            let envelope: Value = serde_json::from_str(&line).expect("valid json");
            let id = envelope["request_id"].as_str().expect("id").to_string();
            assert!(id.starts_with("c0-"));

            correlator
                .resolve(response_frame(serde_json::json!({
                    "type": "control_response",
                    "request_id": id,
                    "response": {"status": "ok"}
                })))
                .await;
        };

        let (outcome, ()) = tokio::join!(send, resolve);
        assert_eq!(outcome.expect("resolved")["status"], "ok");
    }

    #[tokio::test]
    async fn error_payload_surfaces_as_control_error() {
        let (correlator, mut writer) = correlator(Duration::from_secs(1));

        let send = correlator.send_request("interrupt", Map::new());
        let resolve = async {
            let WriterCommand::Line(line) = writer.recv().await.expect("written") else {
                panic!("expected line");
            };
            let envelope: Value = serde_json::from_str(&line).expect("valid json");
            correlator
                .resolve(response_frame(serde_json::json!({
                    "type": "control_response",
                    "request_id": envelope["request_id"],
                    "error": "not supported"
                })))
                .await;
        };

        let (outcome, ()) = tokio::join!(send, resolve);
        let err = outcome.unwrap_err();
        assert!(matches!(err, AgentClientError::ControlError { .. }));
        assert!(err.to_string().contains("not supported"));
    }

    #[tokio::test]
    async fn deadline_elapsing_fails_with_timeout_and_removes_the_entry() {
        let (correlator, mut writer) = correlator(Duration::from_millis(20));

        let err = correlator
            .send_request("set_permission_mode", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentClientError::ControlTimeout { .. }));

        // A late response is ignored rather than resolving anything.
        let WriterCommand::Line(line) = writer.recv().await.expect("written") else {
            panic!("expected line");
        };
        let envelope: Value = serde_json::from_str(&line).expect("valid json");
        correlator
            .resolve(response_frame(serde_json::json!({
                "type": "control_response",
                "request_id": envelope["request_id"],
                "response": {}
            })))
            .await;
        assert!(correlator.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn close_fails_every_pending_request() {
        let (correlator, _writer) = correlator(Duration::from_secs(5));

        let send = correlator.send_request("interrupt", Map::new());
        let fail = async {
            // Let the request install its slot first.
            time::sleep(Duration::from_millis(10)).await;
            correlator
                .fail_all(&AgentClientError::ClosedWhilePending)
                .await;
        };

        let (outcome, ()) = tokio::join!(send, fail);
        assert!(matches!(
            outcome.unwrap_err(),
            AgentClientError::ClosedWhilePending
        ));
    }

    #[tokio::test]
    async fn request_identifiers_are_unique() {
        let (correlator, mut writer) = correlator(Duration::from_millis(10));
        let _ = correlator.send_request("interrupt", Map::new()).await;
        let _ = correlator.send_request("interrupt", Map::new()).await;

        let mut seen = std::collections::HashSet::new();
        while let Ok(command) = writer.try_recv() {
            let WriterCommand::Line(line) = command else {
                continue;
            };
            let envelope: Value = serde_json::from_str(&line).expect("valid json");
            assert!(seen.insert(envelope["request_id"].as_str().unwrap().to_string()));
        }
        assert_eq!(seen.len(), 2);
    }
}
