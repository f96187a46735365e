//! End-to-end: a chat turn carrying an inline `thinking:<level>` command
//! updates the session's live thinking level, publishes
//! `Topic::MessageInbound`, and returns a confirmation reply without ever
//! calling the broker — the degraded broker in these tests proves that.

use std::sync::Arc;
use std::time::Duration;

use agentcore::core::broker::BrokerClient;
use agentcore::core::bus::{EventBus, Topic};
use agentcore::core::chat_session::ChatSession;
use agentcore::core::thinking::ThinkingLevel;
use agentcore::core::workspace::Workspace;
use tempfile::TempDir;

/// `false` exits immediately, closing its stdio pipes, so the broker's
/// startup health check fails and the client stays permanently degraded
/// without needing a real broker process to answer it.
async fn degraded_broker() -> Arc<BrokerClient> {
    Arc::new(
        BrokerClient::spawn("false", &[], Duration::from_secs(2))
            .await
            .expect("spawning `false` itself never fails"),
    )
}

#[tokio::test]
async fn thinking_command_returns_confirmation_without_calling_the_broker() {
    let bus = Arc::new(EventBus::new(8));
    let mut inbound = bus.subscribe(Topic::MessageInbound).await;
    let dir = TempDir::new().unwrap();
    let workspace = Arc::new(Workspace::new(dir.path().to_path_buf(), 4096));
    let broker = degraded_broker().await;

    let session = ChatSession::new("alice", 20, broker, bus.clone(), workspace);
    assert_eq!(session.thinking_level(), ThinkingLevel::Medium);

    let result = session.handle_message("alice", "thinking:high please dig deeper").await;

    // The broker is degraded, so a turn that reached it would fail. This
    // one succeeds, which proves no broker call was made.
    let outcome = result.expect("thinking command must not invoke the broker");
    assert!(outcome.reply.contains("high"));
    assert!(outcome.file_writes.is_empty());
    assert_eq!(session.thinking_level(), ThinkingLevel::High);

    let event = inbound.receive().await.unwrap();
    assert_eq!(event.payload["caller"], "alice");
    assert_eq!(event.payload["text"], "thinking:high please dig deeper");
}

#[tokio::test]
async fn non_owner_is_rejected_before_any_side_effects() {
    let bus = Arc::new(EventBus::new(8));
    let mut inbound = bus.subscribe(Topic::MessageInbound).await;
    let dir = TempDir::new().unwrap();
    let workspace = Arc::new(Workspace::new(dir.path().to_path_buf(), 4096));
    let broker = degraded_broker().await;

    let session = ChatSession::new("alice", 20, broker, bus.clone(), workspace);
    let result = session.handle_message("mallory", "thinking:xhigh").await;

    assert!(result.is_err());
    assert_eq!(session.thinking_level(), ThinkingLevel::Medium);

    // No bus publish for a rejected caller.
    let timed_out = tokio::time::timeout(Duration::from_millis(50), inbound.receive()).await;
    assert!(timed_out.is_err(), "non-owner message must never reach the bus");
}
