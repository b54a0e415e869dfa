//! Integration tests for end-to-end session collaboration.
//!
//! These tests start a real server and connect real channels,
//! verifying join/presence, patch propagation, cursors, and leave.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use umlflow_collab::channel::{ChannelState, SessionChannel, SessionEvent};
use umlflow_collab::protocol::{Credential, Participant, SessionMessage};
use umlflow_collab::server::{ServerConfig, SessionServer};
use umlflow_core::{DiagramPatch, DocumentStore, Point, UmlClass};
use umlflow_core::Diagram;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return (port, server handle).
async fn start_test_server(shared_store_path: Option<std::path::PathBuf>) -> (u16, Arc<SessionServer>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        shared_store_path,
    };
    let server = Arc::new(SessionServer::new(config).unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, server)
}

/// Connect a channel and wait until the session is active.
async fn join(
    name: &str,
    diagram_id: &str,
    url: &str,
) -> (SessionChannel, tokio::sync::mpsc::Receiver<SessionEvent>) {
    let mut channel = SessionChannel::new(Participant::new(name), diagram_id, url);
    let mut events = channel.take_event_rx().unwrap();
    channel
        .connect(Credential::Bearer("test-jwt".to_string()))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("should receive event within timeout")
        .expect("channel closed unexpectedly");
    match event {
        SessionEvent::Active(_) => {}
        other => panic!("Expected Active event, got {other:?}"),
    }
    (channel, events)
}

/// Pull events until one matches, within a deadline.
async fn wait_for<F>(
    events: &mut tokio::sync::mpsc::Receiver<SessionEvent>,
    mut pred: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (port, _server) = start_test_server(None).await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(format!("{url}/d-1")).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_channel_joins_and_becomes_active() {
    let (port, _server) = start_test_server(None).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (channel, _events) = join("Alice", "d-1", &url).await;
    assert_eq!(channel.state().await, ChannelState::Active);
    assert_eq!(channel.diagram_id(), "d-1");
}

#[tokio::test]
async fn test_presence_on_second_join() {
    let (port, _server) = start_test_server(None).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (_alice, mut alice_events) = join("Alice", "d-1", &url).await;
    let (_bob, _bob_events) = join("Bob", "d-1", &url).await;

    let event = wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::UserJoined(_))
    })
    .await;
    match event {
        SessionEvent::UserJoined(participant) => assert_eq!(participant.name, "Bob"),
        other => panic!("Expected UserJoined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_patch_propagates_and_applies() {
    let (port, _server) = start_test_server(None).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, _alice_events) = join("Alice", "d-1", &url).await;
    let (_bob, mut bob_events) = join("Bob", "d-1", &url).await;

    // Bob's local replica of the session document
    let mut bob_store = DocumentStore::new(Diagram::new("d-1"));

    let patch = DiagramPatch::CreateClass {
        class: UmlClass::new("c1", "Invoice", Point::new(120.0, 80.0)),
    };
    alice.send_patch(&patch).await.unwrap();

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::RemotePatch { .. })
    })
    .await;
    match event {
        SessionEvent::RemotePatch { patch: received, .. } => {
            assert_eq!(received, patch);
            assert!(bob_store.apply_remote(&received));
            // Replay of the same patch is a no-op
            assert!(!bob_store.apply_remote(&received));
        }
        other => panic!("Expected RemotePatch, got {other:?}"),
    }

    assert_eq!(bob_store.classes().len(), 1);
    assert_eq!(bob_store.classes()[0].name, "Invoice");
}

#[tokio::test]
async fn test_concurrent_moves_last_patch_wins() {
    let (port, _server) = start_test_server(None).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, _alice_events) = join("Alice", "d-1", &url).await;
    let (_bob, mut bob_events) = join("Bob", "d-1", &url).await;

    let mut bob_store = DocumentStore::new(Diagram::new("d-1"));
    bob_store
        .add_class(UmlClass::new("c1", "User", Point::new(0.0, 0.0)))
        .unwrap();

    // Two moves from the same peer arrive in send order
    alice
        .send_patch(&DiagramPatch::MoveClass {
            id: "c1".to_string(),
            position: Point::new(10.0, 10.0),
        })
        .await
        .unwrap();
    alice
        .send_patch(&DiagramPatch::MoveClass {
            id: "c1".to_string(),
            position: Point::new(50.0, 50.0),
        })
        .await
        .unwrap();

    for _ in 0..2 {
        let event = wait_for(&mut bob_events, |e| {
            matches!(e, SessionEvent::RemotePatch { .. })
        })
        .await;
        if let SessionEvent::RemotePatch { patch, .. } = event {
            bob_store.apply_remote(&patch);
        }
    }

    assert_eq!(bob_store.class("c1").unwrap().position, Point::new(50.0, 50.0));
}

#[tokio::test]
async fn test_cursor_updates_between_peers() {
    let (port, _server) = start_test_server(None).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, _alice_events) = join("Alice", "d-1", &url).await;
    let (bob, mut bob_events) = join("Bob", "d-1", &url).await;

    alice.send_cursor(Point::new(300.5, 120.0)).await.unwrap();

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::CursorUpdate(_))
    })
    .await;
    match event {
        SessionEvent::CursorUpdate(cursor) => {
            assert_eq!(cursor.position, Point::new(300.5, 120.0));
            assert_eq!(cursor.peer_id, alice.participant().peer_id);
        }
        other => panic!("Expected CursorUpdate, got {other:?}"),
    }

    assert_eq!(bob.remote_cursors().await.len(), 1);
}

#[tokio::test]
async fn test_leave_notifies_peers_and_clears_cursors() {
    let (port, _server) = start_test_server(None).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (mut alice, _alice_events) = join("Alice", "d-1", &url).await;
    let (bob, mut bob_events) = join("Bob", "d-1", &url).await;

    // Bob has seen Alice's cursor
    alice.send_cursor(Point::new(5.0, 5.0)).await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SessionEvent::CursorUpdate(_))).await;

    let alice_id = alice.participant().peer_id;
    alice.leave().await;
    assert_eq!(alice.state().await, ChannelState::Closed);
    assert!(alice.remote_cursors().await.is_empty());

    let event = wait_for(&mut bob_events, |e| matches!(e, SessionEvent::UserLeft(_))).await;
    match event {
        SessionEvent::UserLeft(peer_id) => assert_eq!(peer_id, alice_id),
        other => panic!("Expected UserLeft, got {other:?}"),
    }

    // Bob's copy of Alice's cursor is gone
    assert!(bob.remote_cursors().await.is_empty());
}

#[tokio::test]
async fn test_unknown_share_token_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _server) = start_test_server(Some(dir.path().join("shared"))).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut channel = SessionChannel::new(
        Participant::new("Mallory"),
        "shared-NOPE0000",
        &url,
    );
    let mut events = channel.take_event_rx().unwrap();
    channel
        .connect(Credential::ShareToken("NOPE0000".to_string()))
        .await
        .unwrap();

    // Server drops the connection instead of sending presence
    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("should observe rejection")
        .expect("event channel open");
    match event {
        SessionEvent::Closed => {}
        other => panic!("Expected Closed, got {other:?}"),
    }
    assert_eq!(channel.state().await, ChannelState::Closed);
}

#[tokio::test]
async fn test_rejected_join_releases_connection_count() {
    let (port, server) = start_test_server(None).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/d-1"))
        .await
        .unwrap();

    // Empty bearer fails credential validation before any room is joined
    let join = SessionMessage::join("d-1", &Participant::new("Eve"), Credential::Bearer(String::new()));
    ws.send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();

    // Drain until the server drops us
    while let Some(msg) = ws.next().await {
        if msg.is_err() {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 0);
}

#[tokio::test]
async fn test_share_token_join_seeds_room() {
    let dir = tempfile::tempdir().unwrap();
    let (port, server) = start_test_server(Some(dir.path().join("shared"))).await;
    let url = format!("ws://127.0.0.1:{port}");

    // Issue a token against a seeded snapshot
    let registry = server.registry().unwrap();
    let data = umlflow_core::DiagramData::example();
    let token = registry.issue("d-1", &data).unwrap();
    let diagram_id = format!("shared-{token}");

    let mut channel = SessionChannel::new(Participant::new("Carol"), &diagram_id, &url);
    let mut events = channel.take_event_rx().unwrap();
    channel
        .connect(Credential::ShareToken(token.clone()))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("should receive event")
        .expect("channel open");
    match event {
        SessionEvent::Active(roster) => {
            assert_eq!(roster.len(), 1);
            assert_eq!(roster[0].name, "Carol");
        }
        other => panic!("Expected Active, got {other:?}"),
    }
    assert_eq!(channel.state().await, ChannelState::Active);
}
