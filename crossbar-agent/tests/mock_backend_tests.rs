// ABOUTME: Tests for the deterministic mock backend and its fluent builder.
// ABOUTME: Covers expectation matching, consumption, fallback, and cancel idempotence.

use crossbar_agent::backends::mock::MockBackend;
use crossbar_agent::{AgentEvent, ErrorCode};
use serde_json::json;

async fn drain(receiver: &mut crossbar_agent::EventReceiver) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(e) = receiver.recv().await {
        events.push(e);
    }
    events
}

#[tokio::test]
async fn ping_prompt_returns_canned_pong() {
    let handle = MockBackend::new()
        .on_prompt("ping")
        .respond_text("pong")
        .into_handle();

    let session_id = handle.new_session().await.unwrap();
    let mut receiver = handle.prompt(&session_id, "please ping the agent").await.unwrap();

    let events = drain(&mut receiver).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        AgentEvent::Result { text, .. } => assert_eq!(text, "pong"),
        other => panic!("expected Result, got {other:?}"),
    }
}

#[tokio::test]
async fn unmatched_prompt_gets_fallback_result_not_error() {
    let handle = MockBackend::new()
        .on_prompt("ping")
        .respond_text("pong")
        .into_handle();

    let session_id = handle.new_session().await.unwrap();
    let mut receiver = handle.prompt(&session_id, "something else").await.unwrap();

    let events = drain(&mut receiver).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        AgentEvent::Result { text, .. } => {
            assert!(text.contains("no expectation"), "got: {text}");
        }
        other => panic!("fallback must be a Result, got {other:?}"),
    }
}

#[tokio::test]
async fn expectations_are_consumed_first_match() {
    let handle = MockBackend::new()
        .on_prompt("greet")
        .respond_text("first")
        .on_prompt("greet")
        .respond_text("second")
        .into_handle();

    let session_id = handle.new_session().await.unwrap();

    let mut rx = handle.prompt(&session_id, "greet me").await.unwrap();
    let first = drain(&mut rx).await;
    assert!(matches!(&first[0], AgentEvent::Result { text, .. } if text == "first"));

    let mut rx = handle.prompt(&session_id, "greet me again").await.unwrap();
    let second = drain(&mut rx).await;
    assert!(matches!(&second[0], AgentEvent::Result { text, .. } if text == "second"));
}

#[tokio::test]
async fn full_event_script_replays_in_order() {
    let handle = MockBackend::new()
        .on_prompt("read file")
        .respond_with(vec![
            AgentEvent::ToolStart {
                id: "t1".to_string(),
                name: "Read".to_string(),
                input: json!({"path": "/tmp/notes"}),
            },
            AgentEvent::ToolEnd {
                id: "t1".to_string(),
                name: "Read".to_string(),
                output: json!({"content": "notes"}),
                success: true,
                duration_ms: 3,
            },
            AgentEvent::Result {
                text: "done reading".to_string(),
                usage: None,
                metadata: json!({}),
            },
        ])
        .into_handle();

    let session_id = handle.new_session().await.unwrap();
    let mut receiver = handle.prompt(&session_id, "read file please").await.unwrap();

    let events = drain(&mut receiver).await;
    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], AgentEvent::ToolStart { name, .. } if name == "Read"));
    assert!(matches!(&events[1], AgentEvent::ToolEnd { success: true, .. }));
    assert!(matches!(&events[2], AgentEvent::Result { .. }));
}

#[tokio::test]
async fn error_expectation_surfaces_typed_code() {
    let handle = MockBackend::new()
        .on_prompt("fail")
        .respond_error(ErrorCode::RateLimited, "slow down")
        .into_handle();

    let session_id = handle.new_session().await.unwrap();
    let mut receiver = handle.prompt(&session_id, "fail now").await.unwrap();

    let events = drain(&mut receiver).await;
    assert!(matches!(
        &events[0],
        AgentEvent::Error { code: ErrorCode::RateLimited, .. }
    ));
}

#[tokio::test]
async fn cancel_twice_after_completed_prompt_is_noop() {
    let handle = MockBackend::new()
        .on_prompt("ping")
        .respond_text("pong")
        .into_handle();

    let session_id = handle.new_session().await.unwrap();
    let mut receiver = handle.prompt(&session_id, "ping").await.unwrap();
    drain(&mut receiver).await;

    handle.cancel(&session_id).await.unwrap();
    handle.cancel(&session_id).await.unwrap();
}

#[tokio::test]
async fn sessions_get_distinct_ids() {
    let handle = MockBackend::new().into_handle();
    let a = handle.new_session().await.unwrap();
    let b = handle.new_session().await.unwrap();
    assert_ne!(a, b);
}

#[tokio::test]
async fn load_unknown_session_fails() {
    let handle = MockBackend::new().into_handle();
    assert!(handle.load_session("never-issued").await.is_err());
    assert!(handle.load_session("resumable-42").await.is_ok());
}
