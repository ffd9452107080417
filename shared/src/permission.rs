//! Permission filter deciding whose writes win
//!
//! A pure, deterministic function with no side effects: the single point
//! governing who can change what. Both the long-lived server process and the
//! stateless per-request handler invoke it identically.

use crate::session::{Session, SessionPatch};

/// Returns the subset of `patch` that `actor_id` is allowed to apply.
///
/// The host has unrestricted structural authority. Guests always keep the
/// session display name; the timer-state group (`activeTurnPlayerId`,
/// `running`, `authoritativeTimerOwner`) passes only under
/// `allowGuestControl`, and the player roster only under
/// `allowGuestNameEdit`. Every other key is dropped.
pub fn filter_patch(session: &Session, actor_id: &str, patch: &SessionPatch) -> SessionPatch {
    if actor_id == session.host_id {
        return patch.clone();
    }

    let mut allowed = SessionPatch {
        current_game_name: patch.current_game_name.clone(),
        ..Default::default()
    };

    if session.allow_guest_control {
        allowed.active_turn_player_id = patch.active_turn_player_id;
        allowed.running = patch.running;
        allowed.authoritative_timer_owner = patch.authoritative_timer_owner.clone();
    }
    if session.allow_guest_name_edit {
        allowed.players = patch.players.clone();
    }

    allowed
}

/// Whether `actor_id` may merge an `UPDATE_PLAYER` patch.
pub fn can_edit_players(session: &Session, actor_id: &str) -> bool {
    actor_id == session.host_id || session.allow_guest_name_edit
}
