//! Connection registry for the long-lived substrate
//!
//! Maps live transport connections to their participant/session binding and
//! tracks liveness for the background reap sweep. Owned by the process that
//! owns the transport handles; never shared across processes.

use log::info;
use shared::ServerMessage;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

pub type ConnId = u64;

/// Metadata for one live connection.
#[derive(Debug, Clone)]
pub struct ConnEntry {
    pub participant_id: Option<String>,
    pub code: Option<String>,
    pub connected_at: Instant,
    pub last_seen: Instant,
}

struct Inner {
    next_id: ConnId,
    entries: HashMap<ConnId, ConnEntry>,
    senders: HashMap<ConnId, UnboundedSender<ServerMessage>>,
}

pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: HashMap::new(),
                senders: HashMap::new(),
            }),
        }
    }

    /// Registers a new connection and its outbound channel.
    pub async fn register(&self, sender: UnboundedSender<ServerMessage>) -> ConnId {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        let now = Instant::now();
        inner.entries.insert(
            id,
            ConnEntry {
                participant_id: None,
                code: None,
                connected_at: now,
                last_seen: now,
            },
        );
        inner.senders.insert(id, sender);
        id
    }

    /// Associates a connection with a session and participant.
    pub async fn bind(&self, conn: ConnId, code: &str, participant_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&conn) {
            entry.code = Some(code.to_string());
            entry.participant_id = Some(participant_id.to_string());
        }
    }

    pub async fn unbind(&self, conn: ConnId) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&conn) {
            entry.code = None;
            entry.participant_id = None;
        }
    }

    /// Refreshes liveness; called for every inbound frame.
    pub async fn touch(&self, conn: ConnId) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&conn) {
            entry.last_seen = Instant::now();
        }
    }

    /// The session/participant binding of a connection, if both are set.
    pub async fn lookup(&self, conn: ConnId) -> Option<(String, String)> {
        let inner = self.inner.lock().await;
        let entry = inner.entries.get(&conn)?;
        match (&entry.code, &entry.participant_id) {
            (Some(code), Some(pid)) => Some((code.clone(), pid.clone())),
            _ => None,
        }
    }

    /// Removes a connection entirely, returning its final entry.
    pub async fn remove(&self, conn: ConnId) -> Option<ConnEntry> {
        let mut inner = self.inner.lock().await;
        inner.senders.remove(&conn);
        let entry = inner.entries.remove(&conn);
        if entry.is_some() {
            info!("connection {} removed from registry", conn);
        }
        entry
    }

    /// Every connection bound to the given session code.
    pub async fn participants_in(&self, code: &str) -> Vec<(ConnId, String)> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.code.as_deref() == Some(code))
            .filter_map(|(id, entry)| {
                entry.participant_id.as_ref().map(|pid| (*id, pid.clone()))
            })
            .collect()
    }

    /// Connections with no inbound traffic within the staleness window.
    pub async fn stale(&self, stale_after: Duration) -> Vec<ConnId> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() > stale_after)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Queues a message to one connection. Returns false when the outbound
    /// channel is gone, which the caller treats as a disconnect.
    pub async fn send(&self, conn: ConnId, message: &ServerMessage) -> bool {
        let inner = self.inner.lock().await;
        match inner.senders.get(&conn) {
            Some(sender) => sender.send(message.clone()).is_ok(),
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_register_bind_lookup() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.register(tx).await;

        assert_eq!(registry.lookup(conn).await, None);
        registry.bind(conn, "ABC123", "p1").await;
        assert_eq!(
            registry.lookup(conn).await,
            Some(("ABC123".to_string(), "p1".to_string()))
        );

        registry.unbind(conn).await;
        assert_eq!(registry.lookup(conn).await, None);
    }

    #[tokio::test]
    async fn test_participants_in_session() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (tx3, _rx3) = mpsc::unbounded_channel();

        let c1 = registry.register(tx1).await;
        let c2 = registry.register(tx2).await;
        let c3 = registry.register(tx3).await;
        registry.bind(c1, "ABC123", "p1").await;
        registry.bind(c2, "ABC123", "p2").await;
        registry.bind(c3, "XYZ789", "p3").await;

        let mut members = registry.participants_in("ABC123").await;
        members.sort();
        assert_eq!(
            members,
            vec![(c1, "p1".to_string()), (c2, "p2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.register(tx).await;

        drop(rx);
        let delivered = registry
            .send(conn, &ServerMessage::Pong { timestamp: 1 })
            .await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_remove_returns_binding() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.register(tx).await;
        registry.bind(conn, "ABC123", "p1").await;

        let entry = registry.remove(conn).await.unwrap();
        assert_eq!(entry.code.as_deref(), Some("ABC123"));
        assert_eq!(entry.participant_id.as_deref(), Some("p1"));
        assert_eq!(registry.len().await, 0);
        assert!(registry.remove(conn).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_detection() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.register(tx).await;

        assert!(registry.stale(Duration::from_secs(30)).await.is_empty());
        assert_eq!(registry.stale(Duration::from_nanos(0)).await, vec![conn]);

        registry.touch(conn).await;
        assert!(registry.stale(Duration::from_secs(30)).await.is_empty());
    }
}
