//! Integration tests for the game-timer synchronization stack
//!
//! These tests run a real WebSocket server on an ephemeral port and drive it
//! with the sync client, or with raw socket clients where the scenario needs
//! transport-level control.

use client::{ClientEvent, SyncClient};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use server::network::Server;
use shared::session::PlayerProfile;
use shared::SessionPatch;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> SocketAddr {
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

async fn raw_connect(addr: SocketAddr) -> RawWs {
    let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    ws
}

/// Reads raw frames until one with the given "type" tag arrives.
async fn raw_recv_type(ws: &mut RawWs, message_type: &str) -> Value {
    loop {
        let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == message_type {
                return value;
            }
        }
    }
}

async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<ClientEvent>) -> ClientEvent {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

/// SESSION LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// Creating a game yields a valid shareable code and host role.
    #[tokio::test]
    async fn create_game_roundtrip() {
        let addr = start_server().await;
        let sync = SyncClient::connect(&format!("ws://{}", addr), "p1")
            .await
            .unwrap();
        let mut events = sync.subscribe();

        sync.create_game(Some(PlayerProfile {
            name: Some("Alice".into()),
            color: None,
        }))
        .unwrap();

        match next_event(&mut events).await {
            ClientEvent::GameCreated { game_id, state } => {
                assert_eq!(game_id.len(), 6);
                assert!(game_id
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
                assert_eq!(state.host_id, "p1");
                assert_eq!(state.connected_participants.len(), 1);
                assert_eq!(state.players.len(), 1);
                assert_eq!(state.players[0].name, "Alice");
                assert_approx_eq::assert_approx_eq!(state.players[0].precise_elapsed_seconds, 0.0);
            }
            other => panic!("expected GameCreated, got {:?}", other),
        }
    }

    /// The wire format uses camelCase field names and tagged types.
    #[tokio::test]
    async fn wire_format_field_names() {
        let addr = start_server().await;
        let mut ws = raw_connect(addr).await;

        ws.send(Message::Text(
            json!({"type": "CREATE_GAME", "playerId": "p1"}).to_string(),
        ))
        .await
        .unwrap();

        let created = raw_recv_type(&mut ws, "GAME_CREATED").await;
        assert!(created["gameId"].is_string());
        let state = &created["gameState"];
        assert_eq!(state["hostId"], "p1");
        assert!(state["allowGuestControl"].is_boolean());
        assert!(state["connectedParticipants"].is_object());
        assert!(state["updatedAt"].is_u64());
    }

    /// A joiner receives the full current snapshot, including state written
    /// before it arrived.
    #[tokio::test]
    async fn join_receives_current_snapshot() {
        let addr = start_server().await;
        let host = SyncClient::connect(&format!("ws://{}", addr), "p1")
            .await
            .unwrap();
        let mut host_events = host.subscribe();
        host.create_game(None).unwrap();
        let game_id = match next_event(&mut host_events).await {
            ClientEvent::GameCreated { game_id, .. } => game_id,
            other => panic!("expected GameCreated, got {:?}", other),
        };

        host.update_game_state(
            &game_id,
            SessionPatch {
                current_game_name: Some("Friday chess".into()),
                players: Some(vec![
                    shared::Player::new(1, "Alice", "#e6194b"),
                    shared::Player::new(2, "Bob", "#3cb44b"),
                ]),
                ..Default::default()
            },
        )
        .unwrap();
        // The host's own echo is discarded, so give the write a moment to
        // land instead of waiting on the host's event stream.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let guest = SyncClient::connect(&format!("ws://{}", addr), "p2")
            .await
            .unwrap();
        let mut guest_events = guest.subscribe();
        guest.join_game(&game_id, None).unwrap();

        match next_event(&mut guest_events).await {
            ClientEvent::GameJoined { state, .. } => {
                assert_eq!(state.current_game_name.as_deref(), Some("Friday chess"));
                assert_eq!(state.players.len(), 2);
                assert_eq!(state.players[0].name, "Alice");
                assert_eq!(state.connected_participants.len(), 2);
            }
            other => panic!("expected GameJoined, got {:?}", other),
        }
    }
}

/// PERMISSION TESTS
mod permission_tests {
    use super::*;

    /// A guest's timer write bounces with PERMISSION_DENIED when guest
    /// control is off, and the session stays untouched.
    #[tokio::test]
    async fn guest_control_denied() {
        let addr = start_server().await;
        let host = SyncClient::connect(&format!("ws://{}", addr), "p1")
            .await
            .unwrap();
        let mut host_events = host.subscribe();
        host.create_game(None).unwrap();
        let game_id = match next_event(&mut host_events).await {
            ClientEvent::GameCreated { game_id, .. } => game_id,
            other => panic!("expected GameCreated, got {:?}", other),
        };

        host.update_game_state(
            &game_id,
            SessionPatch {
                allow_guest_control: Some(false),
                allow_guest_name_edit: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let guest = SyncClient::connect(&format!("ws://{}", addr), "p2")
            .await
            .unwrap();
        let mut guest_events = guest.subscribe();
        guest.join_game(&game_id, None).unwrap();
        match next_event(&mut guest_events).await {
            ClientEvent::GameJoined { .. } => {}
            other => panic!("expected GameJoined, got {:?}", other),
        }

        guest
            .update_game_state(
                &game_id,
                SessionPatch {
                    running: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        match next_event(&mut guest_events).await {
            ClientEvent::ErrorReceived { code, .. } => {
                assert_eq!(code, shared::ErrorCode::PermissionDenied);
            }
            other => panic!("expected ErrorReceived, got {:?}", other),
        }

        // The denied write produced no broadcast: a fresh joiner still sees
        // the clock stopped.
        let observer = SyncClient::connect(&format!("ws://{}", addr), "p3")
            .await
            .unwrap();
        let mut observer_events = observer.subscribe();
        observer.join_game(&game_id, None).unwrap();
        match next_event(&mut observer_events).await {
            ClientEvent::GameJoined { state, .. } => assert!(!state.running),
            other => panic!("expected GameJoined, got {:?}", other),
        }
    }
}

/// DISCONNECT TESTS
mod disconnect_tests {
    use super::*;

    /// An abrupt TCP drop removes the participant, transfers the host role,
    /// and notifies the remaining clients.
    #[tokio::test]
    async fn abrupt_drop_transfers_host() {
        let addr = start_server().await;

        // The creator uses a raw socket so the test can kill the transport
        // without a close handshake.
        let mut creator = raw_connect(addr).await;
        creator
            .send(Message::Text(
                json!({"type": "CREATE_GAME", "playerId": "p1"}).to_string(),
            ))
            .await
            .unwrap();
        let created = raw_recv_type(&mut creator, "GAME_CREATED").await;
        let game_id = created["gameId"].as_str().unwrap().to_string();

        let survivor = SyncClient::connect(&format!("ws://{}", addr), "p2")
            .await
            .unwrap();
        let mut events = survivor.subscribe();
        survivor.join_game(&game_id, None).unwrap();
        match next_event(&mut events).await {
            ClientEvent::GameJoined { .. } => {}
            other => panic!("expected GameJoined, got {:?}", other),
        }

        drop(creator);

        match next_event(&mut events).await {
            ClientEvent::PlayerLeft {
                player_id, state, ..
            } => {
                assert_eq!(player_id, "p1");
                assert_eq!(state.host_id, "p2");
                assert_eq!(state.connected_participants.len(), 1);
            }
            other => panic!("expected PlayerLeft, got {:?}", other),
        }
    }
}

/// RECONNECTION AND QUEUEING TESTS
mod reconnect_tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Writes issued while the transport is down are queued and flushed in
    /// order after the client reconnects.
    #[tokio::test]
    async fn offline_writes_flush_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let received = tokio::spawn(async move {
            // First connection: accept the handshake, then drop immediately.
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);

            // Second connection: record the frames the client flushes.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut types = Vec::new();
            while types.len() < 3 {
                match timeout(WAIT, ws.next()).await.unwrap() {
                    Some(Ok(Message::Text(text))) => {
                        let value: Value = serde_json::from_str(&text).unwrap();
                        types.push(value["type"].as_str().unwrap().to_string());
                    }
                    _ => break,
                }
            }
            types
        });

        let sync = SyncClient::connect(&format!("ws://{}", addr), "p1")
            .await
            .unwrap();
        // Give the worker a moment to notice the dropped transport.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sync.is_connected());

        sync.create_game(None).unwrap();
        sync.ping().unwrap();
        sync.update_game_state(
            "AAAAAA",
            SessionPatch {
                running: Some(true),
                ..Default::default()
            },
        )
        .unwrap();

        // The first reconnect attempt fires after one second.
        let types = timeout(Duration::from_secs(10), received)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(types, vec!["CREATE_GAME", "PING", "UPDATE_GAME_STATE"]);
        assert!(sync.is_connected());
    }

    /// Malformed frames get an ERROR reply and the connection survives.
    #[tokio::test]
    async fn malformed_frame_keeps_connection() {
        let addr = start_server().await;
        let mut ws = raw_connect(addr).await;

        ws.send(Message::Text("{not json".to_string()))
            .await
            .unwrap();
        let error = raw_recv_type(&mut ws, "ERROR").await;
        assert_eq!(error["code"], "INVALID_MESSAGE");

        ws.send(Message::Text(
            json!({"type": "TELEPORT", "playerId": "p1"}).to_string(),
        ))
        .await
        .unwrap();
        let error = raw_recv_type(&mut ws, "ERROR").await;
        assert_eq!(error["code"], "UNKNOWN_MESSAGE_TYPE");

        // Still usable afterwards.
        ws.send(Message::Text(json!({"type": "PING"}).to_string()))
            .await
            .unwrap();
        let pong = raw_recv_type(&mut ws, "PONG").await;
        assert!(pong["timestamp"].is_u64());
    }
}
