//! Session and player data model, typed patch application, and game codes
//!
//! Everything that both server substrates must agree on lives here: the full
//! session snapshot that crosses the wire, the typed partial-update structures,
//! and the merge rules that keep the invariants (single active turn, bounded
//! roster, sanitized names) in one place.

use crate::error::SyncError;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Length of a game code.
pub const GAME_CODE_LEN: usize = 6;
/// Characters a game code is drawn from.
pub const GAME_CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Upper bound on the player roster; keeps broadcast payloads bounded.
pub const MAX_PLAYERS: usize = 9;
/// Display names are truncated to this many characters after sanitizing.
pub const MAX_NAME_LEN: usize = 32;
/// Sub-second elapsed accumulator clamp, in seconds (8 hours).
pub const MAX_PRECISE_ELAPSED: f64 = 28_800.0;
/// Sessions expire this long after their last mutation (durable substrate).
pub const SESSION_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Fixed color palette for player slots. Uniqueness within a session is
/// preferred (new slots pick the first unused entry) but never enforced.
pub const PLAYER_COLORS: [&str; 20] = [
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0",
    "#f032e6", "#bcf60c", "#fabebe", "#008080", "#e6beff", "#9a6324", "#fffac8",
    "#800000", "#aaffc3", "#808000", "#ffd8b1", "#000075", "#808080",
];

/// Whether the active player's clock counts up from zero or down from
/// `initialSeconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimerMode {
    CountUp,
    CountDown,
}

/// Liveness record for one connected participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub joined_at: u64,
    pub last_seen: u64,
}

/// One in-game timer slot. Distinct from a participant: a participant may or
/// may not currently own a slot, and a slot survives its owner's rename or
/// recolor (the `id` is stable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: u32,
    pub name: String,
    pub color: String,
    pub elapsed_seconds: i64,
    pub precise_elapsed_seconds: f64,
    pub turn_count: u32,
    pub total_turn_duration_ms: u64,
    pub turn_started_at: Option<u64>,
    /// Participant that owns this slot, if any. Used to strip the slot when
    /// its owner leaves the session.
    pub participant_id: Option<String>,
}

impl Player {
    pub fn new(id: u32, name: &str, color: &str) -> Self {
        Self {
            id,
            name: sanitize_name(name),
            color: color.to_string(),
            elapsed_seconds: 0,
            precise_elapsed_seconds: 0.0,
            turn_count: 0,
            total_turn_duration_ms: 0,
            turn_started_at: None,
            participant_id: None,
        }
    }

    /// Re-applies the field-level invariants after any merge.
    fn normalize(&mut self) {
        self.name = sanitize_name(&self.name);
        self.precise_elapsed_seconds =
            self.precise_elapsed_seconds.clamp(0.0, MAX_PRECISE_ELAPSED);
    }
}

/// Plain profile data supplied by the surrounding application on create/join.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

/// Partial update for a single player slot, addressed by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerPatch {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precise_elapsed_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_turn_duration_ms: Option<u64>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub turn_started_at: Option<Option<u64>>,
}

/// Typed partial session update. A field that is present wholly replaces the
/// prior value (no deep merge); `None` means "not part of this patch".
///
/// Nullable session fields use a double `Option` so "set to null" (present as
/// JSON `null`) is distinguishable from "absent".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_game_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<Vec<Player>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub active_turn_player_id: Option<Option<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_mode: Option<TimerMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_guest_control: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_guest_name_edit: Option<bool>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub authoritative_timer_owner: Option<Option<String>>,
}

impl SessionPatch {
    /// True when no field survived (or was ever proposed); an empty patch is
    /// rejected as a no-op rather than stamping the session.
    pub fn is_empty(&self) -> bool {
        self.current_game_name.is_none()
            && self.players.is_none()
            && self.active_turn_player_id.is_none()
            && self.running.is_none()
            && self.started.is_none()
            && self.timer_mode.is_none()
            && self.initial_seconds.is_none()
            && self.allow_guest_control.is_none()
            && self.allow_guest_name_edit.is_none()
            && self.authoritative_timer_owner.is_none()
    }
}

/// Outcome of removing a participant from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Host role moved to this participant, if the host left.
    pub new_host: Option<String>,
    /// No connected participants remain; the session must be deleted.
    pub delete: bool,
}

/// One active multiplayer game-timer instance, addressed by a short code.
/// This is the full snapshot that crosses the wire as `gameState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub code: String,
    pub host_id: String,
    pub current_game_name: Option<String>,
    pub players: Vec<Player>,
    pub active_turn_player_id: Option<u32>,
    pub running: bool,
    pub started: bool,
    pub timer_mode: TimerMode,
    pub initial_seconds: u32,
    pub allow_guest_control: bool,
    pub allow_guest_name_edit: bool,
    pub authoritative_timer_owner: Option<String>,
    pub connected_participants: HashMap<String, Participant>,
    pub last_action_by: String,
    pub updated_at: u64,
    pub expires_at: u64,
}

impl Session {
    /// Creates a fresh session with the host as its sole connected participant.
    pub fn new(code: &str, host_id: &str, now: u64) -> Self {
        let mut connected_participants = HashMap::new();
        connected_participants.insert(
            host_id.to_string(),
            Participant {
                joined_at: now,
                last_seen: now,
            },
        );

        Self {
            code: code.to_string(),
            host_id: host_id.to_string(),
            current_game_name: None,
            players: Vec::new(),
            active_turn_player_id: None,
            running: false,
            started: false,
            timer_mode: TimerMode::CountUp,
            initial_seconds: 0,
            allow_guest_control: true,
            allow_guest_name_edit: true,
            authoritative_timer_owner: None,
            connected_participants,
            last_action_by: host_id.to_string(),
            updated_at: now,
            expires_at: now + SESSION_TTL_MS,
        }
    }

    pub fn player(&self, id: u32) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    fn player_mut(&mut self, id: u32) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.id == id)
    }

    /// Stamps the bookkeeping fields after an accepted mutation.
    pub fn touch(&mut self, actor_id: &str, now: u64) {
        self.last_action_by = actor_id.to_string();
        self.updated_at = now;
        self.expires_at = now + SESSION_TTL_MS;
        if let Some(entry) = self.connected_participants.get_mut(actor_id) {
            entry.last_seen = now;
        }
    }

    /// Registers a connected participant. Rejoining refreshes liveness but
    /// keeps the original `joinedAt` so host succession stays deterministic.
    pub fn add_participant(&mut self, participant_id: &str, now: u64) {
        self.connected_participants
            .entry(participant_id.to_string())
            .and_modify(|p| p.last_seen = now)
            .or_insert(Participant {
                joined_at: now,
                last_seen: now,
            });
    }

    /// Removes a participant, strips their player slot, and transfers the host
    /// role if needed. Returns what the caller must do about it.
    pub fn drop_participant(&mut self, participant_id: &str) -> Departure {
        self.connected_participants.remove(participant_id);
        self.players
            .retain(|p| p.participant_id.as_deref() != Some(participant_id));

        if let Some(active) = self.active_turn_player_id {
            if self.player(active).is_none() {
                self.active_turn_player_id = None;
            }
        }
        if self.authoritative_timer_owner.as_deref() == Some(participant_id) {
            self.authoritative_timer_owner = None;
        }

        if self.connected_participants.is_empty() {
            return Departure {
                new_host: None,
                delete: true,
            };
        }

        let mut new_host = None;
        if self.host_id == participant_id {
            if let Some(successor) = self.successor() {
                self.host_id = successor.clone();
                new_host = Some(successor);
            }
        }

        Departure {
            new_host,
            delete: false,
        }
    }

    /// Deterministic host successor: earliest `joinedAt`, participant id as
    /// the tiebreak.
    fn successor(&self) -> Option<String> {
        self.connected_participants
            .iter()
            .min_by_key(|(id, p)| (p.joined_at, (*id).clone()))
            .map(|(id, _)| id.clone())
    }

    /// Seeds a player slot for `participant_id` from a profile. Returns the
    /// new slot id, or `None` when the roster is full or the participant
    /// already owns a slot (participants and players stay independent, so
    /// neither case is an error).
    pub fn seed_player(
        &mut self,
        participant_id: &str,
        profile: &PlayerProfile,
    ) -> Option<u32> {
        if self.players.len() >= MAX_PLAYERS {
            return None;
        }
        if self
            .players
            .iter()
            .any(|p| p.participant_id.as_deref() == Some(participant_id))
        {
            return None;
        }

        let id = self.players.iter().map(|p| p.id).max().unwrap_or(0) + 1;
        let name = match &profile.name {
            Some(n) => sanitize_name(n),
            None => format!("Player {}", id),
        };
        let color = profile
            .color
            .clone()
            .unwrap_or_else(|| self.next_color().to_string());

        let mut player = Player::new(id, &name, &color);
        player.participant_id = Some(participant_id.to_string());
        self.players.push(player);
        Some(id)
    }

    /// First palette color not taken by an existing slot.
    fn next_color(&self) -> &'static str {
        PLAYER_COLORS
            .iter()
            .find(|c| !self.players.iter().any(|p| p.color == **c))
            .copied()
            .unwrap_or(PLAYER_COLORS[0])
    }

    /// Applies an already permission-filtered patch by field replacement.
    /// Does not stamp `lastActionBy`/`updatedAt`; callers do that only after
    /// the merge is accepted.
    pub fn merge_patch(&mut self, patch: &SessionPatch, now: u64) -> Result<(), SyncError> {
        if let Some(players) = &patch.players {
            if players.len() > MAX_PLAYERS {
                return Err(SyncError::TooManyPlayers(MAX_PLAYERS));
            }
        }

        if let Some(name) = &patch.current_game_name {
            self.current_game_name = Some(sanitize_name(name));
        }
        if let Some(players) = &patch.players {
            self.players = players.clone();
            for player in &mut self.players {
                player.normalize();
            }
            // The roster replacement may have removed the active player.
            if let Some(active) = self.active_turn_player_id {
                if self.player(active).is_none() {
                    self.active_turn_player_id = None;
                }
            }
        }
        if let Some(running) = patch.running {
            self.running = running;
        }
        if let Some(started) = patch.started {
            self.started = started;
        }
        if let Some(mode) = patch.timer_mode {
            self.timer_mode = mode;
        }
        if let Some(seconds) = patch.initial_seconds {
            self.initial_seconds = seconds;
        }
        if let Some(allow) = patch.allow_guest_control {
            self.allow_guest_control = allow;
        }
        if let Some(allow) = patch.allow_guest_name_edit {
            self.allow_guest_name_edit = allow;
        }
        if let Some(owner) = &patch.authoritative_timer_owner {
            self.authoritative_timer_owner = owner.clone();
        }
        if let Some(next) = patch.active_turn_player_id {
            self.set_active_turn(next, now);
        }

        Ok(())
    }

    /// Moves the active-turn pointer, closing out the previous player's turn
    /// statistics. A target that references no existing player clears the
    /// pointer instead of dangling.
    pub fn set_active_turn(&mut self, next: Option<u32>, now: u64) {
        let next = next.filter(|id| self.player(*id).is_some());
        if self.active_turn_player_id == next {
            return;
        }

        if let Some(prev) = self.active_turn_player_id {
            if let Some(player) = self.player_mut(prev) {
                if let Some(started) = player.turn_started_at.take() {
                    player.turn_count += 1;
                    player.total_turn_duration_ms += now.saturating_sub(started);
                }
            }
        }

        self.active_turn_player_id = next;
        if let Some(id) = next {
            if let Some(player) = self.player_mut(id) {
                player.turn_started_at = Some(now);
            }
        }
    }

    /// Merges a partial player update into the matching slot by id.
    pub fn merge_player(&mut self, patch: &PlayerPatch) -> Result<(), SyncError> {
        let player = self
            .player_mut(patch.id)
            .ok_or(SyncError::UnknownPlayer(patch.id))?;

        if let Some(name) = &patch.name {
            player.name = name.clone();
        }
        if let Some(color) = &patch.color {
            player.color = color.clone();
        }
        if let Some(elapsed) = patch.elapsed_seconds {
            player.elapsed_seconds = elapsed;
        }
        if let Some(precise) = patch.precise_elapsed_seconds {
            player.precise_elapsed_seconds = precise;
        }
        if let Some(count) = patch.turn_count {
            player.turn_count = count;
        }
        if let Some(total) = patch.total_turn_duration_ms {
            player.total_turn_duration_ms = total;
        }
        if let Some(started) = patch.turn_started_at {
            player.turn_started_at = started;
        }
        player.normalize();
        Ok(())
    }
}

/// Strips control and markup characters from a display name and bounds its
/// length.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control() && !matches!(c, '<' | '>'))
        .take(MAX_NAME_LEN)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Generates a random 6-character game code from `[A-Z0-9]`.
pub fn generate_game_code<R: Rng>(rng: &mut R) -> String {
    (0..GAME_CODE_LEN)
        .map(|_| GAME_CODE_CHARS[rng.gen_range(0..GAME_CODE_CHARS.len())] as char)
        .collect()
}

/// Validates a game code against `^[A-Z0-9]{6}$`.
pub fn is_valid_game_code(code: &str) -> bool {
    code.len() == GAME_CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}
