//! Device-side sync client: connection lifecycle, offline queue, keep-alive
//!
//! The client runs a background worker task that owns the WebSocket. The
//! application talks to it through [`SyncClient`] handles (cheap to clone) and
//! hears back through a broadcast event stream, so one slow subscriber never
//! stalls the socket.
//!
//! When the transport drops, the worker reconnects with exponential backoff
//! and rejoins the current game. Writes issued while offline are queued in
//! order and flushed on reconnect.

use crate::authority::{LocalAuthorityGuard, UpdateVerdict};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::session::{is_valid_game_code, PlayerProfile};
use shared::{now_ms, ClientMessage, PlayerPatch, ServerMessage, Session, SessionPatch};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Maximum consecutive reconnection attempts before giving up.
pub const RECONNECT_ATTEMPTS: u32 = 5;
/// First reconnection delay; doubles per attempt.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Ceiling on the reconnection delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Application-level keep-alive interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid game code: {0}")]
    InvalidGameCode(String),
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("client worker is no longer running")]
    Closed,
}

/// Everything the application can observe from the sync layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// Reconnection gave up after [`RECONNECT_ATTEMPTS`] tries.
    ReconnectFailed,
    GameCreated {
        game_id: String,
        state: Session,
    },
    GameJoined {
        game_id: String,
        state: Session,
    },
    StateUpdated {
        state: Session,
        updated_by: String,
    },
    PlayerJoined {
        game_id: String,
        player_id: String,
        state: Session,
    },
    PlayerLeft {
        game_id: String,
        player_id: String,
        state: Session,
    },
    ErrorReceived {
        code: shared::ErrorCode,
        message: String,
    },
    Pong {
        timestamp: u64,
    },
}

enum Command {
    Send(ClientMessage),
    Disconnect,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Handle to the sync worker. Cloning is cheap; all clones drive the same
/// connection.
#[derive(Clone)]
pub struct SyncClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    connected: Arc<AtomicBool>,
    player_id: String,
}

impl SyncClient {
    /// Dials the server and spawns the background worker. Fails only when the
    /// initial connection cannot be established; later drops are handled by
    /// the reconnect loop.
    pub async fn connect(url: &str, player_id: &str) -> Result<Self, ClientError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
        info!("connected to {}", url);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let connected = Arc::new(AtomicBool::new(true));

        let worker = Worker {
            url: url.to_string(),
            cmd_rx,
            events: events.clone(),
            connected: Arc::clone(&connected),
            guard: LocalAuthorityGuard::new(player_id),
            queue: VecDeque::new(),
            current_game: None,
            player_id: player_id.to_string(),
        };
        tokio::spawn(worker.run(ws));

        let client = SyncClient {
            cmd_tx,
            events,
            connected,
            player_id: player_id.to_string(),
        };
        let _ = client.events.send(ClientEvent::Connected);
        Ok(client)
    }

    /// Subscribes to the event stream. Each subscriber gets every event from
    /// the point of subscription onward.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn create_game(&self, profile: Option<PlayerProfile>) -> Result<(), ClientError> {
        self.send(ClientMessage::CreateGame {
            player_id: self.player_id.clone(),
            player_data: profile,
        })
    }

    /// Validates the code shape locally before going to the network, so typos
    /// fail immediately instead of after a round trip.
    pub fn join_game(&self, code: &str, profile: Option<PlayerProfile>) -> Result<(), ClientError> {
        let code = code.trim().to_uppercase();
        if !is_valid_game_code(&code) {
            return Err(ClientError::InvalidGameCode(code));
        }
        self.send(ClientMessage::JoinGame {
            game_id: code,
            player_id: self.player_id.clone(),
            player_data: profile,
        })
    }

    pub fn update_game_state(&self, game_id: &str, data: SessionPatch) -> Result<(), ClientError> {
        self.send(ClientMessage::UpdateGameState {
            game_id: game_id.to_string(),
            player_id: self.player_id.clone(),
            data,
        })
    }

    pub fn update_player(&self, game_id: &str, patch: PlayerPatch) -> Result<(), ClientError> {
        self.send(ClientMessage::UpdatePlayer {
            game_id: game_id.to_string(),
            player_id: self.player_id.clone(),
            player_data: patch,
        })
    }

    pub fn leave_game(&self, game_id: &str) -> Result<(), ClientError> {
        self.send(ClientMessage::LeaveGame {
            game_id: game_id.to_string(),
            player_id: self.player_id.clone(),
        })
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Ping)
    }

    /// Shuts the worker down. No reconnection is attempted afterwards.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.cmd_tx
            .send(Command::Send(message))
            .map_err(|_| ClientError::Closed)
    }
}

struct Worker {
    url: String,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    connected: Arc<AtomicBool>,
    guard: LocalAuthorityGuard,
    /// Writes issued while offline, flushed in order on reconnect.
    queue: VecDeque<ClientMessage>,
    /// Game to rejoin automatically after a reconnect.
    current_game: Option<String>,
    player_id: String,
}

/// Why the per-connection loop ended.
enum LoopExit {
    TransportLost,
    DisconnectRequested,
}

impl Worker {
    async fn run(mut self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let (mut sink, mut source) = ws.split();

        loop {
            let exit = self.drive_connection(&mut sink, &mut source).await;
            self.connected.store(false, Ordering::SeqCst);
            let _ = self.events.send(ClientEvent::Disconnected);

            if matches!(exit, LoopExit::DisconnectRequested) {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }

            match self.reconnect().await {
                Some(ws) => {
                    let (new_sink, new_source) = ws.split();
                    sink = new_sink;
                    source = new_source;
                }
                None => {
                    let _ = self.events.send(ClientEvent::ReconnectFailed);
                    return;
                }
            }
        }
    }

    /// Pumps one live connection: inbound frames, application commands, and
    /// the keep-alive tick. Returns when the transport drops or the
    /// application asks to disconnect.
    async fn drive_connection(&mut self, sink: &mut WsSink, source: &mut WsSource) -> LoopExit {
        if !self.flush_queue(sink).await {
            return LoopExit::TransportLost;
        }

        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Close(_))) | None => return LoopExit::TransportLost,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("transport error: {}", e);
                            return LoopExit::TransportLost;
                        }
                    }
                }

                command = self.cmd_rx.recv() => {
                    match command {
                        Some(Command::Send(message)) => {
                            self.note_outbound(&message);
                            if !self.transmit(sink, &message).await {
                                // Keep the write; it goes out after reconnect.
                                self.queue.push_back(message);
                                return LoopExit::TransportLost;
                            }
                        }
                        Some(Command::Disconnect) | None => return LoopExit::DisconnectRequested,
                    }
                }

                _ = keepalive.tick() => {
                    if !self.transmit(sink, &ClientMessage::Ping).await {
                        return LoopExit::TransportLost;
                    }
                }
            }
        }
    }

    /// Reconnects with exponential backoff. Commands issued meanwhile are
    /// drained into the offline queue; a disconnect request aborts.
    async fn reconnect(&mut self) -> Option<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let mut delay = RECONNECT_BASE_DELAY;

        for attempt in 1..=RECONNECT_ATTEMPTS {
            info!(
                "reconnect attempt {}/{} in {:?}",
                attempt, RECONNECT_ATTEMPTS, delay
            );
            sleep(delay).await;
            if !self.drain_commands_while_offline() {
                return None;
            }

            match connect_async(&self.url).await {
                Ok((ws, _)) => {
                    info!("reconnected to {}", self.url);
                    self.connected.store(true, Ordering::SeqCst);
                    // Old writes can no longer echo back on a new connection.
                    self.guard.reset();
                    if let Some(game_id) = &self.current_game {
                        self.queue.push_front(ClientMessage::JoinGame {
                            game_id: game_id.clone(),
                            player_id: self.player_id.clone(),
                            player_data: None,
                        });
                    }
                    let _ = self.events.send(ClientEvent::Connected);
                    return Some(ws);
                }
                Err(e) => {
                    warn!("reconnect attempt {} failed: {}", attempt, e);
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                }
            }
        }

        error!("giving up after {} reconnect attempts", RECONNECT_ATTEMPTS);
        None
    }

    /// Returns false when a disconnect was requested.
    fn drain_commands_while_offline(&mut self) -> bool {
        while let Ok(command) = self.cmd_rx.try_recv() {
            match command {
                Command::Send(message) => {
                    self.note_outbound(&message);
                    self.queue.push_back(message);
                }
                Command::Disconnect => return false,
            }
        }
        true
    }

    async fn flush_queue(&mut self, sink: &mut WsSink) -> bool {
        while let Some(message) = self.queue.pop_front() {
            debug!("flushing queued {}", message.type_name());
            if !self.transmit(sink, &message).await {
                self.queue.push_front(message);
                return false;
            }
        }
        true
    }

    async fn transmit(&self, sink: &mut WsSink, message: &ClientMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(json) => sink.send(Message::Text(json)).await.is_ok(),
            Err(e) => {
                error!("failed to serialize {}: {}", message.type_name(), e);
                true
            }
        }
    }

    /// Bookkeeping before a message leaves (or is queued): the authority
    /// guard windows and the game to rejoin after a reconnect.
    fn note_outbound(&mut self, message: &ClientMessage) {
        match message {
            ClientMessage::UpdateGameState { data, .. } => {
                let authority_change = data.authoritative_timer_owner.is_some();
                self.guard.note_local_write(now_ms(), authority_change);
            }
            ClientMessage::UpdatePlayer { .. } => {
                self.guard.note_local_write(now_ms(), false);
            }
            ClientMessage::JoinGame { game_id, .. } => {
                self.current_game = Some(game_id.clone());
            }
            ClientMessage::LeaveGame { .. } => {
                self.current_game = None;
            }
            _ => {}
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("unparseable server frame: {}", e);
                return;
            }
        };

        let event = match message {
            ServerMessage::ConnectionStatus { .. } => None,
            ServerMessage::GameCreated { game_id, game_state } => {
                self.current_game = Some(game_id.clone());
                Some(ClientEvent::GameCreated {
                    game_id,
                    state: game_state,
                })
            }
            ServerMessage::GameJoined { game_id, game_state } => {
                self.current_game = Some(game_id.clone());
                Some(ClientEvent::GameJoined {
                    game_id,
                    state: game_state,
                })
            }
            ServerMessage::GameStateUpdate {
                game_state,
                updated_by,
                ..
            } => match self.guard.observe_update(&updated_by, now_ms()) {
                UpdateVerdict::Apply => Some(ClientEvent::StateUpdated {
                    state: game_state,
                    updated_by,
                }),
                UpdateVerdict::OwnEcho => {
                    debug!("discarding own echo from {}", updated_by);
                    None
                }
                UpdateVerdict::Suppressed => {
                    debug!("suppressing remote update from {}", updated_by);
                    None
                }
            },
            ServerMessage::PlayerJoined {
                game_id,
                player_id,
                game_state,
            } => Some(ClientEvent::PlayerJoined {
                game_id,
                player_id,
                state: game_state,
            }),
            ServerMessage::PlayerLeft {
                game_id,
                player_id,
                game_state,
            } => Some(ClientEvent::PlayerLeft {
                game_id,
                player_id,
                state: game_state,
            }),
            ServerMessage::Error { message, code } => {
                warn!("server error {:?}: {}", code, message);
                Some(ClientEvent::ErrorReceived { code, message })
            }
            ServerMessage::Pong { timestamp } => Some(ClientEvent::Pong { timestamp }),
        };

        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_rejects_bad_code_locally() {
        // The handle methods only need the channels, not a live socket.
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(8);
        let client = SyncClient {
            cmd_tx,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            player_id: "p1".to_string(),
        };

        assert!(matches!(
            client.join_game("abc", None),
            Err(ClientError::InvalidGameCode(_))
        ));
        assert!(matches!(
            client.join_game("ABC12!", None),
            Err(ClientError::InvalidGameCode(_))
        ));
        // Lowercase input is normalized, not rejected.
        assert!(client.join_game("abc123", None).is_ok());
    }

    #[test]
    fn test_backoff_schedule() {
        let mut delay = RECONNECT_BASE_DELAY;
        let mut schedule = Vec::new();
        for _ in 0..RECONNECT_ATTEMPTS {
            schedule.push(delay.as_secs());
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }
        assert_eq!(schedule, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_send_after_worker_gone() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        drop(cmd_rx);
        let (events, _) = broadcast::channel(8);
        let client = SyncClient {
            cmd_tx,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            player_id: "p1".to_string(),
        };
        assert!(matches!(client.ping(), Err(ClientError::Closed)));
    }
}
