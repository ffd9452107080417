//! Stateless server substrate: per-request handling over a key/value store
//!
//! In this deployment the process holds no session or connection state at
//! all. Every piece of state lives in the key/value store: session records
//! (via [`crate::kv::KvSessions`]), one record per connection, and one roster
//! per session mapping connection ids to participants. Outbound delivery goes
//! through a [`PushSender`], the hosting platform's server-push primitive.
//!
//! The protocol itself is still [`crate::engine::Engine`]; this module only
//! translates effects into key/value writes and pushes.

use crate::engine::{decode_error_reply, Effect, Engine};
use crate::kv::{KeyValueStore, KvSessions};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::message::{decode_client_message, ConnState};
use shared::{now_ms, ServerMessage};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PushError {
    /// The connection no longer exists at the push service.
    #[error("connection is gone")]
    Gone,
    #[error("push transport error: {0}")]
    Transport(String),
}

/// Server-push seam. Implemented over whatever one-way push primitive the
/// hosting platform provides.
#[async_trait::async_trait]
pub trait PushSender: Send + Sync {
    async fn push(&self, conn_id: &str, payload: &str) -> Result<(), PushError>;
}

/// Per-connection record persisted between requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConnRecord {
    code: Option<String>,
    participant_id: Option<String>,
}

fn conn_key(conn_id: &str) -> String {
    format!("conn:{}", conn_id)
}

fn roster_key(code: &str) -> String {
    format!("sessconns:{}", code)
}

pub struct StatelessGateway<K, P> {
    kv: Arc<K>,
    engine: Engine<KvSessions<K>>,
    push: P,
}

impl<K: KeyValueStore, P: PushSender> StatelessGateway<K, P> {
    pub fn new(kv: Arc<K>, push: P) -> Self {
        Self {
            engine: Engine::new(KvSessions::new(Arc::clone(&kv))),
            kv,
            push,
        }
    }

    pub fn engine(&self) -> &Engine<KvSessions<K>> {
        &self.engine
    }

    /// Handles the platform's connect event: records the connection and
    /// confirms it to the client.
    pub async fn on_connect(&self, conn_id: &str) {
        self.write_conn(conn_id, &ConnRecord::default()).await;
        info!("connection {} registered", conn_id);
        self.push_message(
            conn_id,
            &ServerMessage::ConnectionStatus {
                status: ConnState::Connected,
                timestamp: now_ms(),
            },
        )
        .await;
    }

    /// Handles the platform's disconnect event. Runs the same departure
    /// cascade as an explicit LEAVE_GAME when the connection was in a game.
    pub fn on_disconnect<'a>(
        &'a self,
        conn_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let record = self.read_conn(conn_id).await;
            self.kv.delete(&conn_key(conn_id)).await;
            if let Some(ConnRecord {
                code: Some(code),
                participant_id: Some(participant_id),
            }) = record
            {
                self.remove_from_roster(&code, conn_id).await;
                let effects = self.engine.depart(&code, &participant_id, now_ms()).await;
                self.deliver(conn_id, effects).await;
            }
        })
    }

    /// Handles one inbound frame. `route_key` is the message type the
    /// platform routed on; the body is authoritative, a mismatch is only
    /// logged. Decode failures become an ERROR push to the sender.
    pub async fn on_message(&self, conn_id: &str, route_key: &str, body: &str, now: u64) {
        match decode_client_message(body) {
            Ok(message) => {
                if message.type_name() != route_key {
                    debug!(
                        "route key {} disagrees with body type {}",
                        route_key,
                        message.type_name()
                    );
                }
                let effects = self.engine.handle(message, now).await;
                self.deliver(conn_id, effects).await;
            }
            Err(err) => {
                warn!("connection {}: {}", conn_id, err);
                self.push_message(conn_id, &decode_error_reply(&err)).await;
            }
        }
    }

    async fn deliver(&self, conn_id: &str, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Reply(message) => {
                    if let Err(PushError::Gone) = self.push_result(conn_id, &message).await {
                        self.on_disconnect(conn_id).await;
                        // Remaining effects would only target the dead
                        // connection's session binding, which is now gone.
                        return;
                    }
                }
                Effect::Bind {
                    code,
                    participant_id,
                } => {
                    self.write_conn(
                        conn_id,
                        &ConnRecord {
                            code: Some(code.clone()),
                            participant_id: Some(participant_id.clone()),
                        },
                    )
                    .await;
                    let mut roster = self.read_roster(&code).await;
                    roster.insert(conn_id.to_string(), participant_id);
                    self.write_roster(&code, &roster).await;
                }
                Effect::Unbind => {
                    // Skipped entirely when the record is already deleted by
                    // a disconnect; a gone connection must stay gone.
                    if let Some(record) = self.read_conn(conn_id).await {
                        if let Some(code) = &record.code {
                            self.remove_from_roster(code, conn_id).await;
                        }
                        self.write_conn(conn_id, &ConnRecord::default()).await;
                    }
                }
                Effect::Broadcast {
                    code,
                    message,
                    exclude,
                } => {
                    self.broadcast(&code, &message, exclude.as_deref()).await;
                }
            }
        }
    }

    /// Pushes to every roster member, minus the excluded participant. A push
    /// failure against one member never stops the rest; `Gone` members get
    /// the departure cascade.
    async fn broadcast(&self, code: &str, message: &ServerMessage, exclude: Option<&str>) {
        let roster = self.read_roster(code).await;
        for (member_conn, participant_id) in roster {
            if exclude == Some(participant_id.as_str()) {
                continue;
            }
            match self.push_result(&member_conn, message).await {
                Ok(()) => {}
                Err(PushError::Gone) => {
                    debug!("push target {} is gone, evicting", member_conn);
                    self.on_disconnect(&member_conn).await;
                }
                Err(PushError::Transport(e)) => {
                    warn!("push to {} in game {} failed: {}", member_conn, code, e);
                }
            }
        }
    }

    async fn push_result(
        &self,
        conn_id: &str,
        message: &ServerMessage,
    ) -> Result<(), PushError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| PushError::Transport(e.to_string()))?;
        self.push.push(conn_id, &payload).await
    }

    async fn push_message(&self, conn_id: &str, message: &ServerMessage) {
        if let Err(e) = self.push_result(conn_id, message).await {
            warn!("push to {} failed: {}", conn_id, e);
        }
    }

    async fn read_conn(&self, conn_id: &str) -> Option<ConnRecord> {
        let raw = self.kv.get(&conn_key(conn_id)).await?;
        serde_json::from_str(&raw).ok()
    }

    async fn write_conn(&self, conn_id: &str, record: &ConnRecord) {
        if let Ok(json) = serde_json::to_string(record) {
            self.kv.put(&conn_key(conn_id), json).await;
        }
    }

    async fn read_roster(&self, code: &str) -> HashMap<String, String> {
        match self.kv.get(&roster_key(code)).await {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => HashMap::new(),
        }
    }

    async fn write_roster(&self, code: &str, roster: &HashMap<String, String>) {
        if roster.is_empty() {
            self.kv.delete(&roster_key(code)).await;
            return;
        }
        if let Ok(json) = serde_json::to_string(roster) {
            self.kv.put(&roster_key(code), json).await;
        }
    }

    async fn remove_from_roster(&self, code: &str, conn_id: &str) {
        let mut roster = self.read_roster(code).await;
        if roster.remove(conn_id).is_some() {
            self.write_roster(code, &roster).await;
        }
    }
}
