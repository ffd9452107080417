//! Session store: the single mutation point for session state
//!
//! The store is an explicit object with injected concurrency control, never
//! process-global state. Both substrates talk to it through the
//! [`SessionBackend`] trait; they differ only in where the bytes live.

use async_trait::async_trait;
use shared::Session;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// What to do with the session record after a mutation closure ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Keep,
    Delete,
}

/// A mutation applied to one stored session. The closure runs against the
/// current record; the backend persists (or deletes) the result.
pub type Mutator<'a> = Box<dyn FnOnce(&mut Session) -> UpdateOutcome + Send + 'a>;

/// Persistence seam between the protocol engine and a substrate.
///
/// `apply` is the read-modify-write path. The in-process backend runs the
/// closure inside its table lock, so all mutation for a given code is
/// linearized; the key/value backend cannot offer that and is documented
/// last-write-wins.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Inserts a new session unless its code is already taken. Returns
    /// whether the insert happened; the caller retries with a fresh code.
    async fn insert_if_absent(&self, session: Session) -> bool;

    /// Snapshot of a session, if it exists.
    async fn read(&self, code: &str) -> Option<Session>;

    /// Runs `mutate` against the stored session and persists the outcome.
    /// Returns the post-mutation snapshot, or `None` when the code is absent.
    async fn apply(&self, code: &str, mutate: Mutator<'_>) -> Option<Session>;

    async fn remove(&self, code: &str);
}

/// In-memory session table for the long-lived server process.
///
/// A table-wide lock held briefly per operation; the mutation closure runs
/// inside the critical section, which is what linearizes concurrent patches
/// to the same code.
pub struct MemorySessions {
    table: Mutex<HashMap<String, Session>>,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Number of active sessions, for logging and tests.
    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }
}

impl Default for MemorySessions {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionBackend for MemorySessions {
    async fn insert_if_absent(&self, session: Session) -> bool {
        let mut table = self.table.lock().await;
        if table.contains_key(&session.code) {
            return false;
        }
        table.insert(session.code.clone(), session);
        true
    }

    async fn read(&self, code: &str) -> Option<Session> {
        self.table.lock().await.get(code).cloned()
    }

    async fn apply(&self, code: &str, mutate: Mutator<'_>) -> Option<Session> {
        let mut table = self.table.lock().await;
        let session = table.get_mut(code)?;
        match mutate(session) {
            UpdateOutcome::Keep => Some(session.clone()),
            UpdateOutcome::Delete => table.remove(code),
        }
    }

    async fn remove(&self, code: &str) {
        self.table.lock().await.remove(code);
    }
}
