//! Key/value persistence for the stateless substrate
//!
//! Session records are stored as JSON strings under `session:{code}`. The
//! store itself is behind [`KeyValueStore`] so tests and the in-process demo
//! can run against [`MemoryKv`] while a deployment plugs in a real service.
//!
//! Unlike [`crate::store::MemorySessions`], a key/value store gives us no
//! cross-request critical section: `apply` is read-modify-write and two
//! concurrent handlers racing on the same code resolve last-write-wins.

use crate::store::{Mutator, SessionBackend, UpdateOutcome};
use async_trait::async_trait;
use log::{debug, error, warn};
use shared::session::SESSION_TTL_MS;
use shared::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Minimal string key/value interface.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn put(&self, key: &str, value: String);
    async fn delete(&self, key: &str);
    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
}

/// In-memory key/value store for tests and local runs.
pub struct MemoryKv {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.lock().await.get(key).cloned()
    }

    async fn put(&self, key: &str, value: String) {
        self.map.lock().await.insert(key.to_string(), value);
    }

    async fn delete(&self, key: &str) {
        self.map.lock().await.remove(key);
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.map
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

const SESSION_PREFIX: &str = "session:";

fn session_key(code: &str) -> String {
    format!("{}{}", SESSION_PREFIX, code)
}

/// [`SessionBackend`] over a key/value store.
pub struct KvSessions<K> {
    kv: Arc<K>,
}

impl<K: KeyValueStore> KvSessions<K> {
    pub fn new(kv: Arc<K>) -> Self {
        Self { kv }
    }

    async fn load(&self, code: &str) -> Option<Session> {
        let raw = self.kv.get(&session_key(code)).await?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                // A corrupt record is unrecoverable; treat the session as
                // gone rather than poisoning every request that touches it.
                error!("corrupt session record for {}: {}", code, e);
                None
            }
        }
    }

    async fn persist(&self, session: &Session) {
        match serde_json::to_string(session) {
            Ok(json) => self.kv.put(&session_key(&session.code), json).await,
            Err(e) => error!("failed to serialize session {}: {}", session.code, e),
        }
    }

    /// Deletes sessions whose last update is older than the retention window.
    /// Intended for a scheduled sweep in the stateless deployment.
    pub async fn reap_expired(&self, now: u64) -> usize {
        let mut reaped = 0;
        for key in self.kv.keys_with_prefix(SESSION_PREFIX).await {
            let code = key.trim_start_matches(SESSION_PREFIX).to_string();
            match self.load(&code).await {
                Some(session) if now.saturating_sub(session.updated_at) > SESSION_TTL_MS => {
                    debug!("reaping expired session {}", code);
                    self.kv.delete(&key).await;
                    reaped += 1;
                }
                Some(_) => {}
                None => {
                    // Unparseable records get swept too.
                    self.kv.delete(&key).await;
                    reaped += 1;
                }
            }
        }
        reaped
    }
}

#[async_trait]
impl<K: KeyValueStore> SessionBackend for KvSessions<K> {
    async fn insert_if_absent(&self, session: Session) -> bool {
        // get-then-put; the collision window is accepted for code generation
        // because codes are random and retried.
        if self.kv.get(&session_key(&session.code)).await.is_some() {
            return false;
        }
        self.persist(&session).await;
        true
    }

    async fn read(&self, code: &str) -> Option<Session> {
        self.load(code).await
    }

    async fn apply(&self, code: &str, mutate: Mutator<'_>) -> Option<Session> {
        let mut session = self.load(code).await?;
        match mutate(&mut session) {
            UpdateOutcome::Keep => {
                self.persist(&session).await;
                Some(session)
            }
            UpdateOutcome::Delete => {
                self.kv.delete(&session_key(code)).await;
                Some(session)
            }
        }
    }

    async fn remove(&self, code: &str) {
        warn!("removing session {} from key/value store", code);
        self.kv.delete(&session_key(code)).await;
    }
}
