//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients, verifying
//! handshake auth, join/snapshot, edit broadcast, and cursor relay over
//! the wire.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scribe_collab::auth::StaticTokenValidator;
use scribe_collab::client::{ClientEvent, CollabClient, ConnectionState};
use scribe_collab::delta::Delta;
use scribe_collab::lock::MemoryLockService;
use scribe_collab::protocol::{CursorRange, ServerMessage};
use scribe_collab::server::{CollabServer, ServerConfig};
use scribe_collab::store::MemoryStore;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server with alice/bob tokens and one shared document.
/// Returns the url and the document id.
async fn start_test_server() -> (String, Uuid) {
    let port = free_port().await;
    let validator = StaticTokenValidator::new()
        .with_token("alice-token", "alice")
        .with_token("bob-token", "bob");
    let server = Arc::new(CollabServer::new(
        ServerConfig { bind_addr: format!("127.0.0.1:{port}"), ..ServerConfig::default() },
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryLockService::new()),
        Arc::new(validator),
    ));

    let doc = server
        .service()
        .create_document("Shared", "alice", vec!["bob".into()])
        .await
        .unwrap();

    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give the server time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("ws://127.0.0.1:{port}"), doc.id)
}

/// Wait for a specific event, skipping others.
async fn wait_for<F>(rx: &mut tokio::sync::mpsc::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_unauthenticated_connection_rejected() {
    let (url, _doc_id) = start_test_server().await;

    // Raw connection with no Authorization header.
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (_, mut reader) = ws_stream.split();

    let frame = timeout(Duration::from_secs(2), reader.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .unwrap();
    match frame {
        Message::Text(text) => match ServerMessage::decode(text.as_str()).unwrap() {
            ServerMessage::Error { message } => assert!(message.contains("unauthorized")),
            other => panic!("expected error frame, got {other:?}"),
        },
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bad_token_rejected() {
    let (url, _doc_id) = start_test_server().await;

    let mut client = CollabClient::new(Uuid::new_v4(), &url, "wrong-token");
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::ServerError { .. })).await;
    match event {
        ClientEvent::ServerError { message } => assert!(message.contains("unauthorized")),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_join_receives_snapshot() {
    let (url, doc_id) = start_test_server().await;

    let mut client = CollabClient::new(doc_id, &url, "alice-token");
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Synced { .. })).await;
    match event {
        ClientEvent::Synced { version } => assert_eq!(version, 0),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_edit_is_acked_and_broadcast() {
    let (url, doc_id) = start_test_server().await;

    let mut alice = CollabClient::new(doc_id, &url, "alice-token");
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Synced { .. })).await;

    let mut bob = CollabClient::new(doc_id, &url, "bob-token");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::Synced { .. })).await;

    alice.edit(Delta::new().insert("Hello")).await.unwrap();

    let event = wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Acked { .. })).await;
    match event {
        ClientEvent::Acked { version } => assert_eq!(version, 1),
        other => panic!("unexpected event {other:?}"),
    }

    let event = wait_for(&mut bob_events, |e| matches!(e, ClientEvent::RemoteEdit { .. })).await;
    match event {
        ClientEvent::RemoteEdit { user_id, version } => {
            assert_eq!(user_id, "alice");
            assert_eq!(version, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert_eq!(alice.document().lock().await.text(), "Hello");
    assert_eq!(bob.document().lock().await.text(), "Hello");
}

#[tokio::test]
async fn test_interleaved_edits_converge() {
    let (url, doc_id) = start_test_server().await;

    let mut alice = CollabClient::new(doc_id, &url, "alice-token");
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Synced { .. })).await;

    let mut bob = CollabClient::new(doc_id, &url, "bob-token");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::Synced { .. })).await;

    alice.edit(Delta::new().insert("A")).await.unwrap();
    bob.edit(Delta::new().insert("B")).await.unwrap();

    // Each side settles: its own ack plus the other's edit.
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Acked { .. })).await;
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::RemoteEdit { .. })).await;
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::Acked { .. })).await;
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::RemoteEdit { .. })).await;

    let alice_text = alice.document().lock().await.text();
    let bob_text = bob.document().lock().await.text();
    assert_eq!(alice_text, bob_text, "clients diverged");
    assert_eq!(alice_text.len(), 2);
}

#[tokio::test]
async fn test_cursor_relay() {
    let (url, doc_id) = start_test_server().await;

    let mut alice = CollabClient::new(doc_id, &url, "alice-token");
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Synced { .. })).await;

    let mut bob = CollabClient::new(doc_id, &url, "bob-token");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::Synced { .. })).await;

    alice.send_cursor(Some(CursorRange::selection(1, 4))).await.unwrap();

    let event = wait_for(&mut bob_events, |e| matches!(e, ClientEvent::RemoteCursor { .. })).await;
    match event {
        ClientEvent::RemoteCursor { user_id, range } => {
            assert_eq!(user_id, "alice");
            assert_eq!(range, Some(CursorRange::selection(1, 4)));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_join_unknown_document_errors() {
    let (url, _doc_id) = start_test_server().await;

    let mut client = CollabClient::new(Uuid::new_v4(), &url, "alice-token");
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::ServerError { .. })).await;
    match event {
        ClientEvent::ServerError { message } => assert!(message.contains("not found")),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_leave_notifies_peers() {
    let (url, doc_id) = start_test_server().await;

    let mut alice = CollabClient::new(doc_id, &url, "alice-token");
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Synced { .. })).await;

    let mut bob = CollabClient::new(doc_id, &url, "bob-token");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::Synced { .. })).await;

    alice.leave().await.unwrap();

    let event = wait_for(&mut bob_events, |e| matches!(e, ClientEvent::UserLeft { .. })).await;
    match event {
        ClientEvent::UserLeft { user_id } => assert_eq!(user_id, "alice"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_gets_error_not_disconnect() {
    let (url, doc_id) = start_test_server().await;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer alice-token".parse().unwrap());
    let (ws_stream, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    let (mut writer, mut reader) = ws_stream.split();

    writer.send(Message::Text("this is not json".into())).await.unwrap();

    let frame = timeout(Duration::from_secs(2), reader.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .unwrap();
    match frame {
        Message::Text(text) => {
            assert!(matches!(
                ServerMessage::decode(text.as_str()).unwrap(),
                ServerMessage::Error { .. }
            ));
        }
        other => panic!("expected text frame, got {other:?}"),
    }

    // The connection survives: a valid join still works.
    let join = format!(r#"{{"event":"join-doc","docId":"{doc_id}"}}"#);
    writer.send(Message::Text(join.into())).await.unwrap();
    let frame = timeout(Duration::from_secs(2), reader.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .unwrap();
    match frame {
        Message::Text(text) => {
            assert!(matches!(
                ServerMessage::decode(text.as_str()).unwrap(),
                ServerMessage::DocSnapshot { .. }
            ));
        }
        other => panic!("expected text frame, got {other:?}"),
    }
}
