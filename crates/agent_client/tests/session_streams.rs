//! Session-level stream semantics against fake agent binaries: the
//! unbounded message iterator, raw frame observability, process-initiated
//! initialize, interrupt, and the richer callback wire forms.

#![cfg(unix)]

use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use agent_client::{
    AgentClientError, AgentMessage, AgentOptions, AgentSession, HookCallback, HookEvent,
    HookOutput, HookPermissionOutput, InboundFrame, PermissionCallback, PermissionDecision,
    PermissionMode,
};
use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;

fn fake_agent(script: &str) -> (TempDir, PathBuf) {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("fake-agent");
    fs::write(&path, script).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    (dir, path)
}

// The unbounded iterator spans turns; the turn-2 subscriber only sees
// messages positioned after turn 1's result.
#[tokio::test]
async fn receive_messages_spans_turns_in_order() {
    let script = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"sess-10"}'
n=0
while read -r line; do
  case "$line" in
    *'"type":"user"'*)
      n=$((n+1))
      printf '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"reply %s"}]},"session_id":"sess-10"}\n' "$n"
      printf '{"type":"result","subtype":"success","is_error":false,"num_turns":%s,"session_id":"sess-10"}\n' "$n"
      ;;
  esac
done
"#;
    let (_dir, binary) = fake_agent(script);

    let session = AgentSession::new(AgentOptions::builder().binary(&binary).build());
    session.connect_with_prompt("one").await.expect("connect");

    let mut stream = session.receive_messages();
    let mut texts = Vec::new();
    let mut results = Vec::new();

    while results.len() < 2 {
        let item = stream.next().await.expect("stream is unbounded");
        match item.expect("no transport failure") {
            AgentMessage::Assistant(assistant) => texts.push(assistant.text()),
            AgentMessage::Result(result) => {
                results.push(result.num_turns);
                if results.len() == 1 {
                    session.query("two").await.expect("turn 2");
                }
            }
            _ => {}
        }
    }

    assert_eq!(texts, vec!["reply 1".to_string(), "reply 2".to_string()]);
    assert_eq!(results, vec![Some(1), Some(2)]);

    session.close().await.expect("close");
    assert!(stream.next().await.is_none(), "stream ends on close");
}

// Process-initiated initialize is recorded and acknowledged; interrupt is a
// correlated control request; raw subscribers observe control traffic.
#[tokio::test]
async fn initialize_interrupt_and_raw_frames() {
    let script = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"sess-11"}'
echo '{"type":"control_request","request_id":"srv-1","request":{"subtype":"initialize","version":"9.9.9","capabilities":{"interrupt":true}}}'
while read -r line; do
  case "$line" in
    *'"request_id":"srv-1"'*'"status":"ok"'*)
      :
      ;;
    *'"subtype":"interrupt"'*)
      id=$(printf '%s' "$line" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
      printf '{"type":"control_response","request_id":"%s","response":{}}\n' "$id"
      echo '{"type":"result","subtype":"interrupted","is_error":false,"session_id":"sess-11"}'
      ;;
    *'"type":"user"'*)
      echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"working..."}]},"session_id":"sess-11"}'
      ;;
  esac
done
"#;
    let (_dir, binary) = fake_agent(script);

    let session = AgentSession::new(AgentOptions::builder().binary(&binary).build());
    session.connect().await.expect("connect");

    // The initialize request is handled on a worker; give it a moment.
    let mut metadata = None;
    for _ in 0..50 {
        metadata = session.process_metadata();
        if metadata.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let metadata = metadata.expect("initialize recorded");
    assert_eq!(metadata["version"], "9.9.9");

    let raw = session.raw_frames();

    session.query("start something long").await.expect("query");
    session.interrupt().await.expect("interrupt acknowledged");

    let mut turn = session.receive_response();
    let mut subtypes = Vec::new();
    while let Some(item) = turn.next().await {
        if let AgentMessage::Result(result) = item.expect("no failure") {
            subtypes.push(result.subtype);
        }
    }
    assert_eq!(subtypes, vec!["interrupted".to_string()]);

    session.close().await.expect("close");

    let frames: Vec<_> = raw.collect().await;
    assert!(
        frames
            .iter()
            .any(|frame| matches!(frame, InboundFrame::ControlResponse(_))),
        "raw subscribers observe control traffic"
    );
    assert!(frames
        .iter()
        .any(|frame| matches!(frame, InboundFrame::Message(_))));
}

// The permission callback can rewrite tool input; the wire response carries
// behavior allow plus updatedInput. set_permission_mode round-trips and
// updates the session's view.
#[tokio::test]
async fn permission_rewrite_and_mode_change() {
    let script = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"sess-12"}'
while read -r line; do
  case "$line" in
    *'"subtype":"set_permission_mode"'*)
      case "$line" in
        *'"mode":"acceptEdits"'*)
          id=$(printf '%s' "$line" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
          printf '{"type":"control_response","request_id":"%s","response":{}}\n' "$id"
          ;;
      esac
      ;;
    *'"type":"user"'*)
      echo '{"type":"control_request","request_id":"srv-1","request":{"subtype":"can_use_tool","tool_name":"Write","input":{"path":"relative.txt"}}}'
      ;;
    *'"request_id":"srv-1"'*)
      case "$line" in
        *'"behavior":"allow"'*'"updatedInput":{"path":"/workspace/relative.txt"}'*)
          echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"rewritten"}]},"session_id":"sess-12"}'
          ;;
        *)
          echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"wrong"}]},"session_id":"sess-12"}'
          ;;
      esac
      echo '{"type":"result","subtype":"success","is_error":false,"session_id":"sess-12"}'
      ;;
  esac
done
"#;
    let (_dir, binary) = fake_agent(script);

    let callback: PermissionCallback = Arc::new(|_tool_name, input, _context| {
        Box::pin(async move {
            let path = input.get("path").and_then(|v| v.as_str()).unwrap_or("");
            if path.starts_with('/') {
                Ok(PermissionDecision::Allow)
            } else {
                Ok(PermissionDecision::AllowWithUpdatedInput(
                    json!({"path": format!("/workspace/{path}")}),
                ))
            }
        })
    });

    let session = AgentSession::new(
        AgentOptions::builder()
            .binary(&binary)
            .can_use_tool(callback)
            .build(),
    );
    session.connect().await.expect("connect");

    session
        .set_permission_mode(PermissionMode::AcceptEdits)
        .await
        .expect("mode change acknowledged");
    assert_eq!(
        session.current_permission_mode().as_deref(),
        Some("acceptEdits")
    );

    session.query("write the notes file").await.expect("query");
    let mut turn = session.receive_response();
    let mut text = String::new();
    while let Some(item) = turn.next().await {
        if let AgentMessage::Assistant(assistant) = item.expect("no failure") {
            text.push_str(&assistant.text());
        }
    }
    assert_eq!(text, "rewritten");

    session.close().await.expect("close");
}

// A permission hook's nested output reaches the wire under
// hookSpecificOutput with the rewritten input.
#[tokio::test]
async fn hook_specific_output_reaches_the_wire() {
    let script = r#"#!/bin/sh
read -r first
case "$first" in
  *'"subtype":"initialize"'*) : ;;
  *) exit 9 ;;
esac
id=$(printf '%s' "$first" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
printf '{"type":"control_response","request_id":"%s","response":{"status":"ok"}}\n' "$id"
echo '{"type":"system","subtype":"init","session_id":"sess-13"}'
while read -r line; do
  case "$line" in
    *'"type":"user"'*)
      echo '{"type":"control_request","request_id":"srv-1","request":{"subtype":"hook_callback","callback_id":"hook_0","input":{"hook_event_name":"PreToolUse","tool_name":"Write","tool_input":{"path":"tmp.txt"},"tool_use_id":"tu-9"}}}'
      ;;
    *'"request_id":"srv-1"'*)
      case "$line" in
        *'"hookSpecificOutput":{"permissionDecision":"allow","updatedInput":{"path":"/safe/tmp.txt"}}'*)
          echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hook output verified"}]},"session_id":"sess-13"}'
          ;;
        *)
          echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hook output wrong"}]},"session_id":"sess-13"}'
          ;;
      esac
      echo '{"type":"result","subtype":"success","is_error":false,"session_id":"sess-13"}'
      ;;
  esac
done
"#;
    let (_dir, binary) = fake_agent(script);

    let callback: HookCallback = Arc::new(|_input| {
        Box::pin(async move {
            Ok(HookOutput {
                permission: Some(HookPermissionOutput {
                    permission_decision: Some("allow".to_string()),
                    permission_decision_reason: None,
                    updated_input: Some(json!({"path": "/safe/tmp.txt"})),
                }),
                ..HookOutput::proceed()
            })
        })
    });

    let session = AgentSession::new(
        AgentOptions::builder()
            .binary(&binary)
            .hook(HookEvent::PreToolUse, None, callback)
            .expect("register hook")
            .build(),
    );
    session.connect().await.expect("connect");

    session.query("write it").await.expect("query");
    let mut turn = session.receive_response();
    let mut text = String::new();
    let mut failure: Option<AgentClientError> = None;
    while let Some(item) = turn.next().await {
        match item {
            Ok(AgentMessage::Assistant(assistant)) => text.push_str(&assistant.text()),
            Ok(_) => {}
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    assert!(failure.is_none(), "turn failed: {failure:?}");
    assert_eq!(text, "hook output verified");

    session.close().await.expect("close");
}
