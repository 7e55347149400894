//! Session actor integration tests against fake sandbox, storage and record
//! store.

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use skiff::session::SessionError;
use skiff::state::{PENDING_PERMISSIONS_KEY, PENDING_QUESTIONS_KEY, StateStore};
use skiff::storage::CopyFromStatus;
use skiff_protocol::{MessageRole, MessageType};

mod common;
use common::{Browser, FakeAgent, TestHarness, WAIT, fast_config};

fn start(session_id: &str) -> serde_json::Value {
    json!({"type": "start", "sessionId": session_id, "taskId": "task-7"})
}

/// Start the session and return the agent after it received `start`.
async fn start_session(harness: &TestHarness, browser: &mut Browser, session_id: &str) -> FakeAgent {
    browser.send(start(session_id)).await;
    let mut agent = harness.provider.next_agent().await;
    agent.expect_command("start").await;
    browser.expect_status("connected").await;
    agent
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_start_reports_progress_and_prepares_sandbox() {
    let harness = TestHarness::new();
    harness.storage.set_copy_from(CopyFromStatus::Restored);
    let mut browser = harness.connect("s1").await;

    browser.send(start("s1")).await;

    for expected in ["connecting", "restoring", "restored", "connected"] {
        let event = browser.next_event().await;
        assert_eq!(event["type"], "status");
        assert_eq!(event["status"], expected);
    }

    let mut agent = harness.provider.next_agent().await;
    let command = agent.expect_command("start").await;
    assert_eq!(command["sessionId"], "s1");
    assert_eq!(command["taskId"], "task-7");
    assert!(command.get("content").is_none());

    let env = harness.provider.last_sandbox().env();
    assert_eq!(env["SKIFF_SESSION_ID"], "s1");
    assert_eq!(env["SKIFF_TASK_ID"], "task-7");
    assert_eq!(env["SKIFF_MODE"], "test");
    assert_eq!(harness.storage.mounts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.storage.copy_from_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_start_is_idempotent_while_connected() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let mut agent = start_session(&harness, &mut browser, "s1").await;

    browser.send(start("s1")).await;
    browser.expect_status("connected").await;
    agent.expect_command("start").await;

    assert_eq!(harness.provider.provision_count(), 1);
}

#[tokio::test]
async fn test_start_for_other_session_is_rejected() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;

    browser.send(start("s2")).await;

    let event = browser.expect_event("error").await;
    assert!(event["message"].as_str().unwrap().contains("s2"));
    assert_eq!(harness.provider.provision_count(), 0);
}

#[tokio::test]
async fn test_provisioning_failure_is_reported_and_retryable() {
    let harness = TestHarness::new();
    harness.provider.set_fail_provision(true);
    let mut browser = harness.connect("s1").await;

    browser.send(start("s1")).await;
    let failed = browser.expect_status("failed").await;
    assert!(failed["message"].as_str().unwrap().contains("no capacity"));
    browser.expect_event("error").await;

    harness.provider.set_fail_provision(false);
    let _agent = start_session(&harness, &mut browser, "s1").await;
}

#[tokio::test]
async fn test_mount_failure_stops_sandbox() {
    let harness = TestHarness::new();
    harness.storage.set_fail_mount(true);
    let mut browser = harness.connect("s1").await;

    browser.send(start("s1")).await;
    let failed = browser.expect_status("failed").await;
    assert!(failed["message"].as_str().unwrap().contains("mount"));
    assert!(harness.provider.last_sandbox().is_stopped());
}

#[tokio::test]
async fn test_buffered_message_drains_before_newer_messages() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let mut agent = start_session(&harness, &mut browser, "s1").await;

    agent.disconnect();
    browser.expect_status("disconnected").await;

    // Sandbox gone: buffered, then reconnected with the last start.
    browser
        .send(json!({"type": "message", "content": "hello"}))
        .await;
    let mut agent = harness.provider.next_agent().await;
    agent.expect_command("start").await;
    let drained = agent.expect_command("message").await;
    assert_eq!(drained["content"], "hello");

    browser
        .send(json!({"type": "message", "content": "newer"}))
        .await;
    let newer = agent.expect_command("message").await;
    assert_eq!(newer["content"], "newer");

    let records = harness.wait_for_records("s1", 2).await;
    let contents: Vec<_> = records.iter().map(|(_, r)| r.content.as_str()).collect();
    assert_eq!(contents, vec!["hello", "newer"]);
    assert_eq!(harness.provider.provision_count(), 2);
}

#[tokio::test]
async fn test_message_before_start_is_delivered_after_start() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;

    browser
        .send(json!({"type": "message", "content": "early"}))
        .await;
    let error = browser.expect_event("error").await;
    assert!(error["message"].as_str().unwrap().contains("not started"));

    browser.send(start("s1")).await;
    let mut agent = harness.provider.next_agent().await;
    agent.expect_command("start").await;
    let message = agent.expect_command("message").await;
    assert_eq!(message["content"], "early");
}

#[tokio::test]
async fn test_turn_complete_persists_text_and_requests_sync() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let agent = start_session(&harness, &mut browser, "s1").await;

    agent.emit(json!({"type": "text_delta", "text": "Hel"})).await;
    agent.emit(json!({"type": "text_delta", "text": "lo"})).await;
    agent
        .emit(json!({
            "type": "turn_complete",
            "usage": {"inputTokens": 12, "outputTokens": 2},
            "stopReason": "end_turn",
        }))
        .await;

    let delta = browser.expect_event("text_delta").await;
    assert_eq!(delta["text"], "Hel");
    let complete = browser.expect_event("message_complete").await;
    assert_eq!(complete["content"], "Hello");
    assert_eq!(complete["stopReason"], "end_turn");

    let records = harness.wait_for_records("s1", 1).await;
    let (message_id, record) = &records[0];
    assert_eq!(complete["messageId"], message_id.as_str());
    assert_eq!(record.role, MessageRole::Assistant);
    assert_eq!(record.message_type, MessageType::Message);
    let metadata = record.metadata.as_ref().unwrap();
    assert_eq!(metadata.input_tokens, Some(12));
    assert_eq!(metadata.output_tokens, Some(2));

    let storage = harness.storage.clone();
    wait_until(move || storage.copy_to_count() == 1).await;
}

#[tokio::test]
async fn test_empty_turn_is_not_persisted() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let agent = start_session(&harness, &mut browser, "s1").await;

    agent.emit(json!({"type": "turn_complete"})).await;

    let complete = browser.expect_event("message_complete").await;
    assert!(complete.get("messageId").is_none());
    assert_eq!(complete["content"], "");
    assert!(harness.records.records("s1").is_empty());
}

#[tokio::test]
async fn test_unknown_agent_events_are_forwarded_verbatim() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let agent = start_session(&harness, &mut browser, "s1").await;

    let raw = json!({"type": "tool_progress", "pct": 40, "nested": {"a": [1, 2]}});
    agent.emit(raw.clone()).await;
    agent
        .emit(json!({"type": "error", "message": "model overloaded"}))
        .await;

    assert_eq!(browser.next_event().await, raw);
    let error = browser.next_event().await;
    assert_eq!(error["message"], "model overloaded");
}

#[tokio::test]
async fn test_permission_request_and_response_persist_as_adjacent_pair() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let mut agent = start_session(&harness, &mut browser, "s1").await;

    browser
        .send(json!({"type": "message", "content": "list files"}))
        .await;
    agent.expect_command("message").await;

    agent
        .emit(json!({
            "type": "permission_request",
            "requestId": "perm-1",
            "toolName": "bash",
            "input": {"command": "ls"},
        }))
        .await;
    let forwarded = browser.expect_event("permission_request").await;
    assert_eq!(forwarded["requestId"], "perm-1");
    assert!(
        harness
            .state
            .get("s1", PENDING_PERMISSIONS_KEY)
            .await
            .unwrap()
            .is_some()
    );

    browser
        .send(json!({
            "type": "permission_response",
            "requestId": "perm-1",
            "decision": "allow",
        }))
        .await;
    let response = agent.expect_command("permission_response").await;
    assert_eq!(response["requestId"], "perm-1");
    assert_eq!(response["decision"], "allow");

    let records = harness.wait_for_records("s1", 3).await;
    let kinds: Vec<_> = records
        .iter()
        .map(|(_, r)| (r.role, r.message_type))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (MessageRole::User, MessageType::Message),
            (MessageRole::Assistant, MessageType::PermissionRequest),
            (MessageRole::User, MessageType::PermissionResponse),
        ]
    );
    let request: serde_json::Value = serde_json::from_str(&records[1].1.content).unwrap();
    assert_eq!(request["toolName"], "bash");

    assert!(
        harness
            .state
            .get("s1", PENDING_PERMISSIONS_KEY)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_question_answer_pairs_and_clears() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let mut agent = start_session(&harness, &mut browser, "s1").await;

    agent
        .emit(json!({
            "type": "ask_user",
            "requestId": "q-1",
            "questions": [{"question": "Which branch?"}],
        }))
        .await;
    browser.expect_event("ask_user").await;

    browser
        .send(json!({
            "type": "ask_user_answer",
            "requestId": "q-1",
            "answers": {"0": "main"},
        }))
        .await;
    let answer = agent.expect_command("ask_user_answer").await;
    assert_eq!(answer["answers"]["0"], "main");

    let records = harness.wait_for_records("s1", 2).await;
    assert_eq!(records[0].1.message_type, MessageType::Question);
    assert_eq!(records[1].1.message_type, MessageType::QuestionAnswer);
    assert!(
        harness
            .state
            .get("s1", PENDING_QUESTIONS_KEY)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_response_to_unknown_request_is_still_forwarded() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let mut agent = start_session(&harness, &mut browser, "s1").await;

    browser
        .send(json!({
            "type": "permission_response",
            "requestId": "ghost",
            "decision": "deny",
        }))
        .await;

    let response = agent.expect_command("permission_response").await;
    assert_eq!(response["requestId"], "ghost");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.records.records("s1").is_empty());
}

#[tokio::test]
async fn test_agent_cancellation_removes_pending_interaction() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let agent = start_session(&harness, &mut browser, "s1").await;

    agent
        .emit(json!({
            "type": "ask_user",
            "requestId": "q-1",
            "questions": [],
        }))
        .await;
    agent
        .emit(json!({"type": "interaction_cancelled", "requestId": "q-1"}))
        .await;

    let cancelled = browser.expect_event("interaction_cancelled").await;
    assert_eq!(cancelled["requestId"], "q-1");
    assert!(
        harness
            .state
            .get("s1", PENDING_QUESTIONS_KEY)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(browser.handle.status().await.unwrap().pending_interactions, 0);
}

#[tokio::test]
async fn test_abort_cancels_pending_interactions() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let mut agent = start_session(&harness, &mut browser, "s1").await;

    agent
        .emit(json!({
            "type": "permission_request",
            "requestId": "perm-1",
            "toolName": "write",
            "input": {},
        }))
        .await;
    browser.expect_event("permission_request").await;

    browser.send(json!({"type": "abort"})).await;

    agent.expect_command("abort").await;
    let cancelled = browser.expect_event("interaction_cancelled").await;
    assert_eq!(cancelled["requestId"], "perm-1");
    assert!(
        harness
            .state
            .get("s1", PENDING_PERMISSIONS_KEY)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_reconnecting_browser_gets_pending_interactions_replayed() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let mut agent = start_session(&harness, &mut browser, "s1").await;

    agent
        .emit(json!({
            "type": "permission_request",
            "requestId": "perm-1",
            "toolName": "bash",
            "input": {"command": "make"},
        }))
        .await;
    browser.expect_event("permission_request").await;

    browser.detach().await;
    // Browser loss schedules a forced sync.
    let storage = harness.storage.clone();
    wait_until(move || storage.copy_to_count() == 1).await;

    let mut browser = harness.connect("s1").await;
    browser.send(start("s1")).await;

    let replayed = browser.expect_event("permission_request").await;
    assert_eq!(replayed["requestId"], "perm-1");
    assert_eq!(replayed["input"]["command"], "make");
    let start_again = agent.expect_command("start").await;
    assert!(start_again.get("content").is_none());
    assert_eq!(harness.provider.provision_count(), 1);
}

#[tokio::test]
async fn test_start_on_live_sandbox_replays_without_continue() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let mut agent = start_session(&harness, &mut browser, "s1").await;

    agent
        .emit(json!({
            "type": "ask_user",
            "requestId": "q-1",
            "questions": [{"question": "Which branch?"}],
        }))
        .await;
    browser.expect_event("ask_user").await;

    // Same browser, same live agent: a page reload re-sends start.
    browser.send(start("s1")).await;

    let mut seen = Vec::new();
    loop {
        let event = browser.next_event().await;
        if event["type"] == "status" && event["status"] == "connected" {
            break;
        }
        seen.push(event);
    }
    assert!(seen.iter().any(|e| e["type"] == "ask_user" && e["requestId"] == "q-1"));
    assert!(seen.iter().all(|e| e["type"] != "interaction_cancelled"));

    let start_again = agent.expect_command("start").await;
    assert!(start_again.get("content").is_none());
    assert!(agent.try_command().is_none());
    assert_eq!(harness.provider.provision_count(), 1);

    // The interaction is still open and can be answered.
    browser
        .send(json!({
            "type": "ask_user_answer",
            "requestId": "q-1",
            "answers": {"0": "main"},
        }))
        .await;
    let answer = agent.expect_command("ask_user_answer").await;
    assert_eq!(answer["requestId"], "q-1");
}

#[tokio::test]
async fn test_reconnect_waits_for_previous_sandbox_sync() {
    let harness = TestHarness::new();
    harness.storage.set_copy_delay(Duration::from_millis(300));
    let mut browser = harness.connect("s1").await;
    let mut agent = start_session(&harness, &mut browser, "s1").await;

    // Sandbox loss forces a slow final sync of the old sandbox.
    agent.disconnect();
    browser.expect_status("disconnected").await;

    // A new message reconnects while that sync is still copying.
    browser
        .send(json!({"type": "message", "content": "again"}))
        .await;
    let mut agent = harness.provider.next_agent().await;
    agent.expect_command("start").await;
    agent.expect_command("message").await;

    agent.emit(json!({"type": "text_delta", "text": "ok"})).await;
    agent.emit(json!({"type": "turn_complete"})).await;
    browser.expect_event("message_complete").await;

    let storage = harness.storage.clone();
    wait_until(move || storage.copy_to_count() >= 2).await;
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(harness.storage.max_concurrent_copies(), 1);
}

#[tokio::test]
async fn test_resumed_session_continues_unresolved_interaction() {
    let mut config = fast_config();
    config.idle_timeout = Duration::from_millis(100);
    let harness = TestHarness::with(config, 0);

    let mut browser = harness.connect("s1").await;
    let mut agent = start_session(&harness, &mut browser, "s1").await;
    agent
        .emit(json!({
            "type": "permission_request",
            "requestId": "perm-1",
            "toolName": "bash",
            "input": {},
        }))
        .await;
    browser.expect_event("permission_request").await;

    // Browser leaves, the agent dies and the actor is evicted.
    browser.detach().await;
    agent.disconnect();
    let registry = harness.registry.clone();
    wait_until(move || registry.get("s1").is_none()).await;

    let mut browser = harness.connect("s1").await;
    browser.send(start("s1")).await;

    let cancelled = browser.expect_event("interaction_cancelled").await;
    assert_eq!(cancelled["requestId"], "perm-1");
    let mut agent = harness.provider.next_agent().await;
    let resumed = agent.expect_command("start").await;
    assert_eq!(resumed["content"], "continue");
    browser.expect_status("connected").await;

    assert!(
        harness
            .state
            .get("s1", PENDING_PERMISSIONS_KEY)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_records_stay_ordered_when_store_is_flaky() {
    let harness = TestHarness::with(fast_config(), 3);
    let mut browser = harness.connect("s1").await;
    let mut agent = start_session(&harness, &mut browser, "s1").await;

    for content in ["one", "two", "three"] {
        browser
            .send(json!({"type": "message", "content": content}))
            .await;
        agent.expect_command("message").await;
    }

    let records = harness.wait_for_records("s1", 3).await;
    let contents: Vec<_> = records.iter().map(|(_, r)| r.content.as_str()).collect();
    assert_eq!(contents, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_protocol_error_is_reported_and_ignored() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;

    browser
        .handle
        .report_protocol_error("malformed message: expected value")
        .await
        .unwrap();

    let error = browser.expect_event("error").await;
    assert!(error["message"].as_str().unwrap().contains("malformed"));
    assert!(!browser.handle.status().await.unwrap().sandbox_connected);
}

#[tokio::test]
async fn test_status_reports_connections_and_sync() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;

    let status = browser.handle.status().await.unwrap();
    assert!(status.browser_connected);
    assert!(!status.sandbox_connected);
    assert!(status.sync.is_none());

    let _agent = start_session(&harness, &mut browser, "s1").await;
    let status = browser.handle.status().await.unwrap();
    assert!(status.sandbox_connected);
    assert_eq!(status.buffered_messages, 0);
    assert_eq!(status.sync.unwrap().retry_count, 0);
}

#[tokio::test]
async fn test_registry_reuses_live_actor_and_validates_ids() {
    let harness = TestHarness::new();

    let first = harness.registry.get_or_spawn("s1").unwrap();
    let second = harness.registry.get_or_spawn("s1").unwrap();
    first.status().await.unwrap();
    second.status().await.unwrap();
    assert_eq!(harness.registry.len(), 1);

    let err = harness.registry.get_or_spawn("../etc").unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)));
    assert!(harness.registry.get("s2").is_none());
}

#[tokio::test]
async fn test_idle_actor_is_evicted_and_respawned() {
    let mut config = fast_config();
    config.idle_timeout = Duration::from_millis(50);
    let harness = TestHarness::with(config, 0);

    let handle = harness.registry.get_or_spawn("s1").unwrap();
    let registry = harness.registry.clone();
    wait_until(move || registry.get("s1").is_none()).await;
    assert!(handle.is_closed());

    let handle = harness.registry.get_or_spawn("s1").unwrap();
    assert!(!handle.is_closed());
    handle.status().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_syncs_and_stops_sandboxes() {
    let harness = TestHarness::new();
    let mut browser = harness.connect("s1").await;
    let _agent = start_session(&harness, &mut browser, "s1").await;

    assert!(harness.registry.shutdown(Duration::from_secs(5)).await);

    assert!(harness.provider.last_sandbox().is_stopped());
    assert_eq!(harness.storage.copy_to_count(), 1);
    assert!(harness.registry.is_empty());
    assert!(matches!(
        harness.registry.get_or_spawn("s1"),
        Err(SessionError::ActorShutdown)
    ));
}
