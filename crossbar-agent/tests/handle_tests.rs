// ABOUTME: Tests for AgentHandle plumbing: Send/Sync, ordering, worker death.
// ABOUTME: Uses the mock backend and hand-built channels, no real processes.

use crossbar_agent::backends::mock::MockBackend;
use crossbar_agent::handle::{AgentHandle, EventReceiver};
use crossbar_agent::AgentEvent;
use tokio::sync::mpsc;

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[test]
fn handle_is_send_and_sync() {
    assert_send::<AgentHandle>();
    assert_sync::<AgentHandle>();
}

#[test]
fn event_receiver_is_send() {
    assert_send::<EventReceiver>();
}

#[tokio::test]
async fn event_receiver_yields_then_closes() {
    let (tx, rx) = mpsc::channel(8);
    let mut receiver = EventReceiver::new(rx);

    tx.send(AgentEvent::Text("a".to_string())).await.unwrap();
    tx.send(AgentEvent::Text("b".to_string())).await.unwrap();
    drop(tx);

    assert!(matches!(receiver.recv().await, Some(AgentEvent::Text(s)) if s == "a"));
    assert!(matches!(receiver.recv().await, Some(AgentEvent::Text(s)) if s == "b"));
    assert!(receiver.recv().await.is_none());
}

#[tokio::test]
async fn dead_worker_fails_every_command() {
    // Channel with no worker behind it: the receiver is dropped at once.
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let handle = AgentHandle::new(tx, "mock");

    assert!(handle.new_session().await.is_err());
    assert!(handle.load_session("s1").await.is_err());
    assert!(handle.prompt("s1", "hello").await.is_err());
    assert!(handle.cancel("s1").await.is_err());
}

#[tokio::test]
async fn clones_share_one_worker() {
    let handle = MockBackend::new().into_handle();
    let clone = handle.clone();

    // The session counter lives in the single backend instance, so ids
    // issued through different clones never collide.
    let a = handle.new_session().await.unwrap();
    let b = clone.new_session().await.unwrap();
    assert_ne!(a, b);
}

#[tokio::test]
async fn prompts_complete_in_submission_order() {
    let handle = MockBackend::new()
        .on_prompt("one")
        .respond_text("r1")
        .on_prompt("two")
        .respond_text("r2")
        .into_handle();

    let session_id = handle.new_session().await.unwrap();

    let mut rx1 = handle.prompt(&session_id, "one").await.unwrap();
    let mut rx2 = handle.prompt(&session_id, "two").await.unwrap();

    let first = rx1.recv().await.unwrap();
    let second = rx2.recv().await.unwrap();
    assert!(matches!(first, AgentEvent::Result { text, .. } if text == "r1"));
    assert!(matches!(second, AgentEvent::Result { text, .. } if text == "r2"));
}
