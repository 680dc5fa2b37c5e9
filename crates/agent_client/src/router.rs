//! Per-turn stream demultiplexing.
//!
//! One subscriber is active per session at any moment. Each subscriber is a
//! dedicated unbounded unicast channel: dropping the sender is the normal
//! completion signal, so the `result` message (or a superseding
//! subscription) completes the stream without poisoning any shared state.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::{message::AgentMessage, protocol::InboundFrame, AgentClientError};

pub(crate) type TurnItem = Result<AgentMessage, AgentClientError>;
pub(crate) type TurnReceiver = mpsc::UnboundedReceiver<TurnItem>;

#[derive(Default)]
pub(crate) struct TurnRouter {
    active: Mutex<Option<mpsc::UnboundedSender<TurnItem>>>,
    raw: Mutex<Vec<mpsc::UnboundedSender<InboundFrame>>>,
}

impl TurnRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Installs a fresh turn subscriber. Any prior subscriber is completed
    /// normally (its channel closes after buffered items drain).
    pub(crate) fn subscribe(&self) -> TurnReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = self.active.lock().expect("turn slot poisoned");
        *slot = Some(tx);
        rx
    }

    /// Registers a raw subscriber receiving every parsed inbound frame,
    /// control messages included.
    pub(crate) fn subscribe_raw(&self) -> mpsc::UnboundedReceiver<InboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.raw.lock().expect("raw sinks poisoned").push(tx);
        rx
    }

    pub(crate) fn fan_out_raw(&self, frame: &InboundFrame) {
        let mut sinks = self.raw.lock().expect("raw sinks poisoned");
        sinks.retain(|tx| tx.send(frame.clone()).is_ok());
    }

    /// Delivers one data-plane message to the active subscriber. A `result`
    /// completes the subscriber and clears the slot in the same critical
    /// section, so the result is always the final element of its turn.
    pub(crate) fn deliver(&self, message: &AgentMessage) {
        let mut slot = self.active.lock().expect("turn slot poisoned");
        let Some(tx) = slot.as_ref() else {
            return;
        };
        let _ = tx.send(Ok(message.clone()));
        if message.is_result() {
            *slot = None;
        }
    }

    /// Fails the active subscriber with `err` and clears the slot.
    pub(crate) fn fail_active(&self, err: AgentClientError) {
        let mut slot = self.active.lock().expect("turn slot poisoned");
        if let Some(tx) = slot.take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Completes the active subscriber normally (session close).
    pub(crate) fn complete_active(&self) {
        self.active.lock().expect("turn slot poisoned").take();
    }

    pub(crate) fn drop_raw(&self) {
        self.raw.lock().expect("raw sinks poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant(text: &str) -> AgentMessage {
        serde_json::from_value(json!({
            "type": "assistant",
            "message": {"role": "assistant", "content": [{"type": "text", "text": text}]}
        }))
        .expect("valid assistant message")
    }

    fn result() -> AgentMessage {
        serde_json::from_value(json!({"type": "result", "subtype": "success"}))
            .expect("valid result message")
    }

    #[tokio::test]
    async fn result_is_the_final_element() {
        let router = TurnRouter::new();
        let mut rx = router.subscribe();

        router.deliver(&assistant("a"));
        router.deliver(&result());

        assert!(matches!(
            rx.recv().await,
            Some(Ok(AgentMessage::Assistant(_)))
        ));
        assert!(matches!(rx.recv().await, Some(Ok(AgentMessage::Result(_)))));
        assert!(rx.recv().await.is_none(), "channel closes after result");
    }

    #[tokio::test]
    async fn new_subscription_supersedes_the_old_one() {
        let router = TurnRouter::new();
        let mut first = router.subscribe();
        router.deliver(&assistant("one"));

        let mut second = router.subscribe();
        router.deliver(&assistant("two"));

        // The first subscriber keeps its buffered item, then completes
        // normally without a result.
        assert!(matches!(first.recv().await, Some(Ok(_))));
        assert!(first.recv().await.is_none());

        assert!(matches!(second.recv().await, Some(Ok(_))));
    }

    #[tokio::test]
    async fn messages_without_a_subscriber_are_dropped() {
        let router = TurnRouter::new();
        router.deliver(&assistant("lost"));

        let mut rx = router.subscribe();
        router.deliver(&result());
        assert!(matches!(rx.recv().await, Some(Ok(AgentMessage::Result(_)))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn failure_reaches_the_subscriber() {
        let router = TurnRouter::new();
        let mut rx = router.subscribe();
        router.fail_active(AgentClientError::ProcessTerminated { status: None });

        assert!(matches!(
            rx.recv().await,
            Some(Err(AgentClientError::ProcessTerminated { .. }))
        ));
        assert!(rx.recv().await.is_none());
    }
}
