//! Local authority guard: protects in-flight local writes from stale echoes
//!
//! Writes are applied locally first and sent to the server after. Until the
//! server has rebroadcast a write, any inbound state update is either our own
//! echo (already applied locally) or a remote update serialized before ours,
//! which would roll the local view back. The guard sequences local writes and
//! suppresses inbound updates while any write is still inside its window.

use std::collections::VecDeque;

/// How long a routine local write suppresses inbound remote state.
pub const ECHO_WINDOW_MS: u64 = 300;
/// Suppression window for timer-authority handoffs, which take longer to
/// settle because every participant reacts to them.
pub const AUTHORITY_WINDOW_MS: u64 = 1000;

/// What to do with an inbound `GAME_STATE_UPDATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateVerdict {
    /// Remote update; apply it to the local view.
    Apply,
    /// Our own write coming back; the local view is already ahead of it.
    OwnEcho,
    /// Remote update racing a local write still in flight; drop it.
    Suppressed,
}

pub struct LocalAuthorityGuard {
    local_id: String,
    next_seq: u64,
    /// Outstanding local writes as (sequence, suppression deadline in ms).
    pending: VecDeque<(u64, u64)>,
}

impl LocalAuthorityGuard {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            next_seq: 1,
            pending: VecDeque::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Records a local write about to be sent. `authority_change` selects the
    /// longer window used for timer-authority handoffs.
    pub fn note_local_write(&mut self, now: u64, authority_change: bool) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let window = if authority_change {
            AUTHORITY_WINDOW_MS
        } else {
            ECHO_WINDOW_MS
        };
        self.pending.push_back((seq, now + window));
        seq
    }

    /// Judges one inbound state update against the pending writes.
    pub fn observe_update(&mut self, updated_by: &str, now: u64) -> UpdateVerdict {
        self.expire(now);

        if updated_by == self.local_id {
            // The oldest pending write is the one echoing back.
            self.pending.pop_front();
            return UpdateVerdict::OwnEcho;
        }

        if self.pending.is_empty() {
            UpdateVerdict::Apply
        } else {
            UpdateVerdict::Suppressed
        }
    }

    /// Drops writes whose window elapsed without an echo. The server may have
    /// rejected them; holding the suppression any longer would blind us to
    /// legitimate remote state.
    fn expire(&mut self, now: u64) {
        while let Some((_, deadline)) = self.pending.front() {
            if *deadline <= now {
                self.pending.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Clears all pending state, e.g. after a reconnect where the old writes
    /// can no longer echo back.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
