//! Reactive session façade: per-turn lazy producers over the shared session
//! engine.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::{stream, StreamExt};
use serde_json::Value;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    message::{AgentMessage, ResultMessage, StreamEventMessage},
    options::{AgentOptions, PermissionMode},
    router::TurnReceiver,
    session::{AgentSession, MessageStream, RawFrameStream, TextStream},
    AgentClientError,
};

/// Session façade where each turn is a [`TurnHandle`] of lazy producers.
///
/// Nothing touches the process until one of a handle's producers is
/// subscribed; in particular, building a pipeline before `connect` does not
/// fail eagerly because the connected check runs on subscription.
#[derive(Clone)]
pub struct ReactiveSession {
    session: AgentSession,
}

impl ReactiveSession {
    pub fn new(options: AgentOptions) -> Self {
        Self {
            session: AgentSession::new(options),
        }
    }

    pub async fn connect(&self) -> Result<(), AgentClientError> {
        self.session.connect().await
    }

    /// Prepares a turn. No IO happens here; the prompt is sent when the
    /// first producer is subscribed.
    pub fn query(&self, prompt: impl Into<String>) -> TurnHandle {
        TurnHandle {
            session: self.session.clone(),
            prompt: prompt.into(),
            sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a handler invoked before each data-plane message is
    /// forwarded to the turn subscriber. Handlers run inline on the dispatch
    /// path and must be fast.
    pub fn on_message(&self, handler: impl Fn(&AgentMessage) + Send + Sync + 'static) {
        self.session.register_on_message(Arc::new(handler));
    }

    /// Registers a handler invoked for every `result` message.
    pub fn on_result(&self, handler: impl Fn(&ResultMessage) + Send + Sync + 'static) {
        self.session.register_on_result(Arc::new(handler));
    }

    pub async fn interrupt(&self) -> Result<(), AgentClientError> {
        self.session.interrupt().await
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), AgentClientError> {
        self.session.set_permission_mode(mode).await
    }

    pub async fn set_model(&self, model: &str) -> Result<(), AgentClientError> {
        self.session.set_model(model).await
    }

    pub async fn close(&self) -> Result<(), AgentClientError> {
        self.session.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.session_id()
    }

    pub fn raw_frames(&self) -> RawFrameStream {
        self.session.raw_frames()
    }

    /// The underlying session, for operations the reactive façade does not
    /// mirror.
    pub fn session(&self) -> &AgentSession {
        &self.session
    }
}

/// One prepared turn: three lazy views over the same underlying stream.
///
/// Subscribing to any producer takes the turn slot, sends the prompt if it
/// has not been sent yet, and streams until the turn's `result`.
#[derive(Clone)]
pub struct TurnHandle {
    session: AgentSession,
    prompt: String,
    sent: Arc<AtomicBool>,
}

impl TurnHandle {
    fn begin(&self) -> Result<TurnReceiver, AgentClientError> {
        let shared = self.session.connected_shared()?;
        let receiver = shared.router.subscribe();
        if !self.sent.swap(true, Ordering::SeqCst) {
            shared.send_user_message(&self.prompt)?;
        }
        Ok(receiver)
    }

    /// Every data-plane message of this turn, completing after its `result`.
    pub fn messages(&self) -> MessageStream {
        let handle = self.clone();
        Box::pin(
            stream::once(async move {
                match handle.begin() {
                    Ok(receiver) => UnboundedReceiverStream::new(receiver).boxed(),
                    Err(err) => stream::iter(vec![Err(err)]).boxed(),
                }
            })
            .flatten(),
        )
    }

    /// Assistant text fragments as they arrive, including partial-message
    /// deltas when the session streams them.
    pub fn text_stream(&self) -> TextStream {
        Box::pin(self.messages().filter_map(|item| async move {
            match item {
                Ok(AgentMessage::Assistant(assistant)) => {
                    let text = assistant.text();
                    (!text.is_empty()).then_some(Ok(text))
                }
                Ok(AgentMessage::StreamEvent(event)) => text_delta(&event).map(Ok),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            }
        }))
    }

    /// All assistant text for the turn, joined. Resolves when the turn
    /// completes.
    pub async fn text(&self) -> Result<String, AgentClientError> {
        let mut messages = self.messages();
        let mut out = String::new();
        while let Some(item) = messages.next().await {
            match item {
                Ok(AgentMessage::Assistant(assistant)) => out.push_str(&assistant.text()),
                Ok(_) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }
}

fn text_delta(event: &StreamEventMessage) -> Option<String> {
    let delta = event.event.get("delta")?;
    if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
        return None;
    }
    delta
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn producers_are_lazy_before_connect() {
        let session = ReactiveSession::new(AgentOptions::builder().build());
        // Constructing the handle and its producers performs no IO and no
        // connected check.
        let turn = session.query("hello");
        let mut messages = turn.messages();

        // The connected check fires on first poll.
        let first = messages.next().await.expect("one error item");
        assert!(matches!(first, Err(AgentClientError::NotConnected)));
    }

    #[test]
    fn text_delta_extracts_streamed_fragments() {
        let event: StreamEventMessage = serde_json::from_value(serde_json::json!({
            "event": {
                "type": "content_block_delta",
                "delta": {"type": "text_delta", "text": "par"}
            }
        }))
        .expect("parse");
        assert_eq!(text_delta(&event).as_deref(), Some("par"));

        let other: StreamEventMessage = serde_json::from_value(serde_json::json!({
            "event": {"type": "message_start"}
        }))
        .expect("parse");
        assert!(text_delta(&other).is_none());
    }
}
