//! Long-lived server substrate: WebSocket accept loop over the shared engine
//!
//! This adapter owns the transport. Each connection gets a reader loop and a
//! writer task joined by an unbounded channel; all protocol decisions are
//! delegated to [`crate::engine`], and the registry/broadcast modules carry
//! the effects out.

use crate::broadcast::fan_out;
use crate::engine::{decode_error_reply, Effect, Engine};
use crate::registry::{ConnId, ConnectionRegistry};
use crate::store::MemorySessions;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::message::{decode_client_message, ConnState};
use shared::{now_ms, ServerMessage};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Connections with no inbound traffic for this long get reaped.
pub const STALE_AFTER: Duration = Duration::from_secs(30);
/// Interval of the background reap sweep.
pub const REAP_INTERVAL: Duration = Duration::from_secs(10);

/// Shared state of the long-lived process: the protocol engine over the
/// in-memory session table, plus the connection registry.
pub struct ServerState {
    pub engine: Engine<MemorySessions>,
    pub registry: ConnectionRegistry,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            engine: Engine::new(MemorySessions::new()),
            registry: ConnectionRegistry::new(),
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// The long-lived session synchronization server.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub async fn bind(addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!("server listening on {}", listener.local_addr()?);
        Ok(Server {
            listener,
            state: Arc::new(ServerState::new()),
        })
    }

    /// The bound address; handy when binding to port 0 in tests.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the listener fails. Spawns one task per
    /// connection plus the background reap sweep.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        spawn_reaper(Arc::clone(&self.state));

        loop {
            let (stream, peer) = self.listener.accept().await?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                handle_connection(state, stream, peer).await;
            });
        }
    }
}

/// Periodically removes connections that went silent and runs the same
/// departure cascade an explicit LEAVE_GAME would.
fn spawn_reaper(state: Arc<ServerState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            for conn in state.registry.stale(STALE_AFTER).await {
                debug!("reaping stale connection {}", conn);
                disconnect_cleanup(&state, conn).await;
            }
        }
    });
}

async fn handle_connection(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("websocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = state.registry.register(tx).await;
    info!("connection {} established from {}", conn_id, peer);

    // Writer task: drains the outbound queue into the socket.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        debug!("outbound send failed, peer closed");
                        break;
                    }
                }
                Err(e) => error!("failed to serialize outbound message: {}", e),
            }
        }
    });

    let _ = state
        .registry
        .send(
            conn_id,
            &ServerMessage::ConnectionStatus {
                status: ConnState::Connected,
                timestamp: now_ms(),
            },
        )
        .await;

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.registry.touch(conn_id).await;
                match decode_client_message(&text) {
                    Ok(message) => {
                        let effects = state.engine.handle(message, now_ms()).await;
                        apply_effects(&state, conn_id, effects).await;
                    }
                    Err(err) => {
                        // A malformed message gets an error reply, never a
                        // hangup.
                        warn!("connection {}: {}", conn_id, err);
                        let _ = state
                            .registry
                            .send(conn_id, &decode_error_reply(&err))
                            .await;
                    }
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                state.registry.touch(conn_id).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("connection {} transport error: {}", conn_id, e);
                break;
            }
        }
    }

    disconnect_cleanup(&state, conn_id).await;
    writer.abort();
    info!("connection {} closed", conn_id);
}

/// Removes a connection and, if it was bound to a session, runs the departure
/// cascade: player strip, host transfer, PLAYER_LEFT to the remainder.
pub(crate) fn disconnect_cleanup(
    state: &ServerState,
    conn_id: ConnId,
) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
    Box::pin(async move {
        if let Some(entry) = state.registry.remove(conn_id).await {
            if let (Some(code), Some(participant_id)) = (entry.code, entry.participant_id) {
                let effects = state.engine.depart(&code, &participant_id, now_ms()).await;
                apply_effects(state, conn_id, effects).await;
            }
        }
    })
}

pub(crate) async fn apply_effects(state: &ServerState, conn_id: ConnId, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Reply(message) => {
                let _ = state.registry.send(conn_id, &message).await;
            }
            Effect::Bind {
                code,
                participant_id,
            } => {
                state.registry.bind(conn_id, &code, &participant_id).await;
            }
            Effect::Unbind => state.registry.unbind(conn_id).await,
            Effect::Broadcast {
                code,
                message,
                exclude,
            } => {
                let failed = fan_out(&state.registry, &code, &message, exclude.as_deref()).await;
                for (failed_conn, _) in failed {
                    // A recipient whose transport is gone is a disconnect we
                    // learned about from the send itself.
                    disconnect_cleanup(state, failed_conn).await;
                }
            }
        }
    }
}
