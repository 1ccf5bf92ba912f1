//! Integration tests for the end-to-end sync pipeline.
//!
//! These tests start a real host and connect real clients over
//! localhost WebSockets, verifying the join handshake, operation
//! broadcast, version stamping, rejection, and session teardown.

use formsync::client::{ClientConfig, ClientError, ClientEvent, CollabClient, ConnectionState};
use formsync::document::{Document, Operation};
use formsync::host::{HostConfig, SessionHost};
use formsync::protocol::{SessionMetadata, UserInfo};
use formsync::registry::SessionRegistry;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a host on a free port, return the port and its registry.
async fn start_test_host() -> (u16, Arc<SessionRegistry>) {
    let port = free_port().await;
    let registry = Arc::new(SessionRegistry::new());
    let config = HostConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        heartbeat_interval_secs: 30,
    };
    let host = SessionHost::new(config, registry.clone());
    tokio::spawn(async move {
        host.run().await.unwrap();
    });
    // Give the host time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, registry)
}

fn metadata() -> SessionMetadata {
    SessionMetadata {
        name: "Plan review".into(),
        host_name: "Alice".into(),
        document_type: "plan".into(),
    }
}

/// Wait for an event matching the predicate, skipping others.
async fn wait_for<F>(
    rx: &mut tokio::sync::mpsc::Receiver<ClientEvent>,
    mut predicate: F,
) -> Option<ClientEvent>
where
    F: FnMut(&ClientEvent) -> bool,
{
    loop {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(event)) if predicate(&event) => return Some(event),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn test_host_accepts_connections() {
    let (port, _registry) = start_test_host().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to host");
}

#[tokio::test]
async fn test_join_receives_consistent_snapshot() {
    let (port, registry) = start_test_host().await;
    let session = registry
        .create_session(Document::new(json!({"title": "A"})), metadata())
        .await;

    let mut client = CollabClient::new(UserInfo::new("Bob"));
    let mut events = client.take_event_rx().unwrap();

    let ack = client
        .connect("127.0.0.1", port, session.id())
        .await
        .unwrap();

    assert_eq!(ack.version, 0);
    assert_eq!(ack.document.data, json!({"title": "A"}));
    assert_eq!(ack.users.len(), 1);
    assert_eq!(ack.metadata.document_type, "plan");
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.participant_id().await, Some(ack.user_id));

    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
    assert!(event.is_some(), "Should receive Connected event");
}

#[tokio::test]
async fn test_join_unknown_session_is_structured_failure() {
    let (port, _registry) = start_test_host().await;

    let mut client = CollabClient::new(UserInfo::new("Bob"));
    let err = client
        .connect("127.0.0.1", port, Uuid::new_v4())
        .await
        .unwrap_err();

    assert!(
        matches!(err, ClientError::SessionNotFound),
        "expected SessionNotFound, got {err:?}"
    );
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connection_refused_is_distinct_from_timeout() {
    // Nothing is listening on this port.
    let port = free_port().await;

    let mut client = CollabClient::with_config(
        UserInfo::new("Bob"),
        ClientConfig {
            connect_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        },
    );
    let err = client.connect("127.0.0.1", port, Uuid::new_v4()).await.unwrap_err();
    assert!(
        matches!(err, ClientError::ConnectionFailed(_)),
        "expected ConnectionFailed, got {err:?}"
    );
}

#[tokio::test]
async fn test_update_propagates_to_other_participants() {
    let (port, registry) = start_test_host().await;
    let session = registry
        .create_session(Document::new(json!({"title": "A"})), metadata())
        .await;

    let mut client1 = CollabClient::new(UserInfo::new("Alice"));
    let mut events1 = client1.take_event_rx().unwrap();
    client1.connect("127.0.0.1", port, session.id()).await.unwrap();

    let mut client2 = CollabClient::new(UserInfo::new("Bob"));
    let mut events2 = client2.take_event_rx().unwrap();
    client2.connect("127.0.0.1", port, session.id()).await.unwrap();

    // Client 1 edits the title.
    let sent = client1
        .send_update(Operation::Set {
            path: "title".into(),
            value: json!("B"),
        })
        .await;
    assert!(sent, "connected send should transmit immediately");

    // Client 2 receives the stamped broadcast.
    let event = wait_for(&mut events2, |e| {
        matches!(e, ClientEvent::DocumentUpdated { .. })
    })
    .await
    .expect("client2 should receive the update");

    match event {
        ClientEvent::DocumentUpdated { version, user_id, .. } => {
            assert_eq!(version, 1);
            assert_eq!(Some(user_id), client1.participant_id().await);
        }
        _ => unreachable!(),
    }

    assert_eq!(client2.version().await, 1);
    assert_eq!(client2.document().await.get("title"), Some(&json!("B")));

    // The submitter never gets its own operation echoed back.
    let echo = wait_for(&mut events1, |e| {
        matches!(e, ClientEvent::DocumentUpdated { .. })
    });
    let echo = timeout(Duration::from_millis(300), echo).await;
    assert!(echo.is_err() || echo.unwrap().is_none(), "no echo expected");
}

#[tokio::test]
async fn test_late_joiner_sees_converged_state() {
    let (port, registry) = start_test_host().await;
    let session = registry
        .create_session(Document::new(json!({"title": "A"})), metadata())
        .await;

    let mut client1 = CollabClient::new(UserInfo::new("Alice"));
    client1.connect("127.0.0.1", port, session.id()).await.unwrap();
    client1
        .send_update(Operation::Set {
            path: "title".into(),
            value: json!("B"),
        })
        .await;

    // Wait for the host to commit.
    timeout(Duration::from_secs(2), async {
        while session.version().await < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // A participant joining after N commits sees exactly those commits.
    let mut client2 = CollabClient::new(UserInfo::new("Bob"));
    let ack = client2.connect("127.0.0.1", port, session.id()).await.unwrap();
    assert_eq!(ack.version, 1);
    assert_eq!(ack.document.data, json!({"title": "B"}));
    assert_eq!(ack.users.len(), 2);
}

#[tokio::test]
async fn test_array_operations_through_the_network() {
    let (port, registry) = start_test_host().await;
    let session = registry
        .create_session(Document::new(json!({"outcomes": ["Y"]})), metadata())
        .await;

    let mut client = CollabClient::new(UserInfo::new("Alice"));
    client.connect("127.0.0.1", port, session.id()).await.unwrap();

    client
        .send_update(Operation::ArrayInsert {
            path: "outcomes".into(),
            index: 0,
            value: json!("X"),
        })
        .await;
    // Out-of-bounds removal: committed no-op, version still advances.
    client
        .send_update(Operation::ArrayRemove {
            path: "outcomes".into(),
            index: 5,
        })
        .await;

    timeout(Duration::from_secs(2), async {
        while session.version().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let doc = session.document().await;
    assert_eq!(doc.data, json!({"outcomes": ["X", "Y"]}));
    assert_eq!(session.version().await, 2);
}

#[tokio::test]
async fn test_rejected_operation_reaches_author_only() {
    let (port, registry) = start_test_host().await;
    let session = registry
        .create_session(Document::new(json!({"title": "A"})), metadata())
        .await;

    let mut client1 = CollabClient::new(UserInfo::new("Alice"));
    let mut events1 = client1.take_event_rx().unwrap();
    client1.connect("127.0.0.1", port, session.id()).await.unwrap();

    let mut client2 = CollabClient::new(UserInfo::new("Bob"));
    let mut events2 = client2.take_event_rx().unwrap();
    client2.connect("127.0.0.1", port, session.id()).await.unwrap();

    // Array op against a string field: the host must reject.
    client1
        .send_update(Operation::ArrayInsert {
            path: "title".into(),
            index: 0,
            value: json!("x"),
        })
        .await;

    let event = wait_for(&mut events1, |e| {
        matches!(e, ClientEvent::UpdateRejected { .. })
    })
    .await
    .expect("author should receive the rejection");
    if let ClientEvent::UpdateRejected { reason } = event {
        assert!(reason.contains("not an array"), "reason: {reason}");
    }

    // Nothing committed, nothing broadcast, version unmoved.
    assert_eq!(session.version().await, 0);
    assert_eq!(session.document().await.data, json!({"title": "A"}));

    let stray = timeout(
        Duration::from_millis(300),
        wait_for(&mut events2, |e| {
            matches!(e, ClientEvent::DocumentUpdated { .. })
        }),
    )
    .await;
    assert!(
        stray.is_err() || stray.unwrap().is_none(),
        "observers must not see rejected operations"
    );
}

#[tokio::test]
async fn test_stale_submission_commits_with_conflict_notice() {
    let (port, registry) = start_test_host().await;
    let session = registry
        .create_session(Document::new(json!({"n": 0})), metadata())
        .await;

    let mut client = CollabClient::new(UserInfo::new("Alice"));
    let mut events = client.take_event_rx().unwrap();
    client.connect("127.0.0.1", port, session.id()).await.unwrap();

    // First submission: tagged v0 against host v0, no conflict.
    client
        .send_update(Operation::Set {
            path: "n".into(),
            value: json!(1),
        })
        .await;
    // Second submission: the client never adopts its own commit (no
    // echo), so this is tagged v0 against host v1 — stale, advisory
    // conflict, but last writer still wins.
    client
        .send_update(Operation::Set {
            path: "n".into(),
            value: json!(2),
        })
        .await;

    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Conflict(_)))
        .await
        .expect("stale submitter should receive a conflict notice");
    if let ClientEvent::Conflict(notice) = event {
        assert_eq!(notice.expected_version, 1);
        assert_eq!(notice.received_version, 0);
    }

    timeout(Duration::from_secs(2), async {
        while session.version().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(session.document().await.data, json!({"n": 2}));
}

#[tokio::test]
async fn test_stop_session_disconnects_participants() {
    let (port, registry) = start_test_host().await;
    let session = registry
        .create_session(Document::default(), metadata())
        .await;
    let session_id = session.id();

    let mut client = CollabClient::new(UserInfo::new("Alice"));
    let mut events = client.take_event_rx().unwrap();
    client.connect("127.0.0.1", port, session_id).await.unwrap();

    assert!(registry.stop_session(session_id).await);

    let ended = wait_for(&mut events, |e| matches!(e, ClientEvent::SessionEnded)).await;
    assert!(ended.is_some(), "participants are notified");

    let disconnected =
        wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    assert!(disconnected.is_some(), "and then disconnected");
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_pending_operations_replay_on_reconnect() {
    let (port, registry) = start_test_host().await;
    let session = registry
        .create_session(Document::new(json!({"title": "A"})), metadata())
        .await;

    let mut client = CollabClient::new(UserInfo::new("Alice"));

    // Author while disconnected: queued, not lost.
    assert!(
        !client
            .send_update(Operation::Set {
                path: "title".into(),
                value: json!("B"),
            })
            .await
    );
    assert!(
        !client
            .send_update(Operation::Set {
                path: "subtitle".into(),
                value: json!("C"),
            })
            .await
    );
    assert_eq!(client.pending_len().await, 2);

    client.connect("127.0.0.1", port, session.id()).await.unwrap();
    assert_eq!(client.pending_len().await, 0);

    timeout(Duration::from_secs(2), async {
        while session.version().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let doc = session.document().await;
    assert_eq!(doc.get("title"), Some(&json!("B")));
    assert_eq!(doc.get("subtitle"), Some(&json!("C")));
}

#[tokio::test]
async fn test_disconnected_client_clears_state_keeps_queue() {
    let (port, registry) = start_test_host().await;
    let session = registry
        .create_session(Document::default(), metadata())
        .await;

    let mut client = CollabClient::new(UserInfo::new("Alice"));
    let mut events = client.take_event_rx().unwrap();
    client.connect("127.0.0.1", port, session.id()).await.unwrap();
    let _ = wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;

    client.disconnect().await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert!(client.participant_id().await.is_none());
    assert_eq!(client.version().await, 0);
    assert!(client.participants().await.is_empty());

    // Post-disconnect edits queue up for the next connect.
    assert!(
        !client
            .send_update(Operation::Set {
                path: "x".into(),
                value: json!(1),
            })
            .await
    );
    assert_eq!(client.pending_len().await, 1);
}

#[tokio::test]
async fn test_ping_pong() {
    let (port, registry) = start_test_host().await;
    let session = registry
        .create_session(Document::default(), metadata())
        .await;

    let mut client = CollabClient::new(UserInfo::new("Alice"));
    client.connect("127.0.0.1", port, session.id()).await.unwrap();
    client.send_ping().await.unwrap();
}

#[tokio::test]
async fn test_user_joined_and_left_events() {
    let (port, registry) = start_test_host().await;
    let session = registry
        .create_session(Document::default(), metadata())
        .await;

    let mut client1 = CollabClient::new(UserInfo::new("Alice"));
    let mut events1 = client1.take_event_rx().unwrap();
    client1.connect("127.0.0.1", port, session.id()).await.unwrap();

    let mut client2 = CollabClient::new(UserInfo::new("Bob"));
    client2.connect("127.0.0.1", port, session.id()).await.unwrap();

    let joined = wait_for(&mut events1, |e| matches!(e, ClientEvent::UserJoined(_)))
        .await
        .expect("client1 should see Bob join");
    if let ClientEvent::UserJoined(info) = joined {
        assert_eq!(info.name, "Bob");
    }
    assert_eq!(client1.participants().await.len(), 2);

    client2.disconnect().await;

    let left = wait_for(&mut events1, |e| matches!(e, ClientEvent::UserLeft(_))).await;
    assert!(left.is_some(), "client1 should see Bob leave");
    assert_eq!(client1.participants().await.len(), 1);
}
