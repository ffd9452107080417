//! Protocol engine: one shared message→effect mapping for both substrates
//!
//! The engine decodes nothing and sends nothing. It takes an already-decoded
//! [`ClientMessage`], mutates session state through a [`SessionBackend`], and
//! returns the [`Effect`]s the substrate adapter must carry out. The long-lived
//! WebSocket process and the stateless key/value gateway both consume this
//! module, so protocol behavior cannot drift between them.

use crate::store::{SessionBackend, UpdateOutcome};
use log::{info, warn};
use shared::permission;
use shared::session::{generate_game_code, Departure, PlayerProfile};
use shared::{
    ClientMessage, DecodeError, PlayerPatch, ServerMessage, Session, SessionPatch, SyncError,
};

/// Bounded retry count for game-code generation collisions.
pub const CODE_ATTEMPTS: usize = 10;

/// An action the substrate adapter must perform after handling a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send to the originating connection.
    Reply(ServerMessage),
    /// Fan out to every connection of the session, minus the excluded
    /// participant.
    Broadcast {
        code: String,
        message: ServerMessage,
        exclude: Option<String>,
    },
    /// Associate the originating connection with a session and participant.
    Bind {
        code: String,
        participant_id: String,
    },
    /// Drop the originating connection's session association.
    Unbind,
}

/// Builds the `ERROR` reply for a frame that never became a message.
pub fn decode_error_reply(err: &DecodeError) -> ServerMessage {
    ServerMessage::Error {
        message: err.to_string(),
        code: err.wire_code(),
    }
}

fn error_reply(err: &SyncError) -> ServerMessage {
    ServerMessage::Error {
        message: err.to_string(),
        code: err.wire_code(),
    }
}

pub struct Engine<B> {
    backend: B,
}

impl<B: SessionBackend> Engine<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Maps one inbound message to the effects it produces. Never panics and
    /// never returns a transport error; every failure becomes an `ERROR`
    /// reply effect.
    pub async fn handle(&self, message: ClientMessage, now: u64) -> Vec<Effect> {
        match message {
            ClientMessage::CreateGame {
                player_id,
                player_data,
            } => self.create_game(&player_id, player_data.as_ref(), now).await,
            ClientMessage::JoinGame {
                game_id,
                player_id,
                player_data,
            } => {
                self.join_game(&game_id, &player_id, player_data.as_ref(), now)
                    .await
            }
            ClientMessage::UpdateGameState {
                game_id,
                player_id,
                data,
            } => self.update_game_state(&game_id, &player_id, &data, now).await,
            ClientMessage::UpdatePlayer {
                game_id,
                player_id,
                player_data,
            } => {
                self.update_player(&game_id, &player_id, &player_data, now)
                    .await
            }
            ClientMessage::LeaveGame { game_id, player_id } => {
                self.depart(&game_id, &player_id, now).await
            }
            ClientMessage::Ping => vec![Effect::Reply(ServerMessage::Pong { timestamp: now })],
        }
    }

    async fn create_game(
        &self,
        player_id: &str,
        profile: Option<&PlayerProfile>,
        now: u64,
    ) -> Vec<Effect> {
        for _ in 0..CODE_ATTEMPTS {
            let code = generate_game_code(&mut rand::thread_rng());
            let mut session = Session::new(&code, player_id, now);
            if let Some(profile) = profile {
                let _ = session.seed_player(player_id, profile);
            }

            if self.backend.insert_if_absent(session.clone()).await {
                info!("game {} created by {}", code, player_id);
                return vec![
                    Effect::Bind {
                        code: code.clone(),
                        participant_id: player_id.to_string(),
                    },
                    Effect::Reply(ServerMessage::GameCreated {
                        game_id: code,
                        game_state: session,
                    }),
                ];
            }
        }

        warn!("exhausted {} game-code attempts", CODE_ATTEMPTS);
        vec![Effect::Reply(error_reply(&SyncError::CodeSpaceExhausted))]
    }

    async fn join_game(
        &self,
        game_id: &str,
        player_id: &str,
        profile: Option<&PlayerProfile>,
        now: u64,
    ) -> Vec<Effect> {
        let snapshot = self
            .backend
            .apply(
                game_id,
                Box::new(|session| {
                    session.add_participant(player_id, now);
                    if let Some(profile) = profile {
                        let _ = session.seed_player(player_id, profile);
                    }
                    session.touch(player_id, now);
                    UpdateOutcome::Keep
                }),
            )
            .await;

        match snapshot {
            None => vec![Effect::Reply(error_reply(&SyncError::SessionNotFound(
                game_id.to_string(),
            )))],
            Some(state) => {
                info!("{} joined game {}", player_id, game_id);
                vec![
                    Effect::Bind {
                        code: game_id.to_string(),
                        participant_id: player_id.to_string(),
                    },
                    Effect::Reply(ServerMessage::GameJoined {
                        game_id: game_id.to_string(),
                        game_state: state.clone(),
                    }),
                    Effect::Broadcast {
                        code: game_id.to_string(),
                        message: ServerMessage::PlayerJoined {
                            game_id: game_id.to_string(),
                            player_id: player_id.to_string(),
                            game_state: state,
                        },
                        exclude: Some(player_id.to_string()),
                    },
                ]
            }
        }
    }

    async fn update_game_state(
        &self,
        game_id: &str,
        player_id: &str,
        patch: &SessionPatch,
        now: u64,
    ) -> Vec<Effect> {
        let mut verdict: Result<(), SyncError> = Ok(());
        let snapshot = self
            .backend
            .apply(
                game_id,
                Box::new(|session| {
                    let allowed = permission::filter_patch(session, player_id, patch);
                    if allowed.is_empty() {
                        verdict = Err(SyncError::PermissionDenied);
                        return UpdateOutcome::Keep;
                    }
                    match session.merge_patch(&allowed, now) {
                        Ok(()) => session.touch(player_id, now),
                        Err(e) => verdict = Err(e),
                    }
                    UpdateOutcome::Keep
                }),
            )
            .await;

        match snapshot {
            None => vec![Effect::Reply(error_reply(&SyncError::SessionNotFound(
                game_id.to_string(),
            )))],
            Some(state) => match verdict {
                Ok(()) => vec![Effect::Broadcast {
                    code: game_id.to_string(),
                    message: ServerMessage::GameStateUpdate {
                        game_id: game_id.to_string(),
                        game_state: state,
                        updated_by: player_id.to_string(),
                    },
                    exclude: None,
                }],
                Err(err) => {
                    warn!("patch from {} on {} rejected: {}", player_id, game_id, err);
                    vec![Effect::Reply(error_reply(&err))]
                }
            },
        }
    }

    async fn update_player(
        &self,
        game_id: &str,
        player_id: &str,
        patch: &PlayerPatch,
        now: u64,
    ) -> Vec<Effect> {
        let mut verdict: Result<(), SyncError> = Ok(());
        let snapshot = self
            .backend
            .apply(
                game_id,
                Box::new(|session| {
                    if !permission::can_edit_players(session, player_id) {
                        verdict = Err(SyncError::PermissionDenied);
                        return UpdateOutcome::Keep;
                    }
                    match session.merge_player(patch) {
                        Ok(()) => session.touch(player_id, now),
                        Err(e) => verdict = Err(e),
                    }
                    UpdateOutcome::Keep
                }),
            )
            .await;

        match snapshot {
            None => vec![Effect::Reply(error_reply(&SyncError::SessionNotFound(
                game_id.to_string(),
            )))],
            Some(state) => match verdict {
                Ok(()) => vec![Effect::Broadcast {
                    code: game_id.to_string(),
                    message: ServerMessage::GameStateUpdate {
                        game_id: game_id.to_string(),
                        game_state: state,
                        updated_by: player_id.to_string(),
                    },
                    exclude: None,
                }],
                Err(err) => vec![Effect::Reply(error_reply(&err))],
            },
        }
    }

    /// Removes a participant and runs the cleanup cascade: strip their player
    /// slot, transfer the host role, delete the session when nobody is left,
    /// and tell the remainder. Shared by `LEAVE_GAME`, socket close, the reap
    /// sweep, and stateless push failures; idempotent when the session or
    /// participant is already gone.
    pub async fn depart(&self, game_id: &str, player_id: &str, now: u64) -> Vec<Effect> {
        let mut departure: Option<Departure> = None;
        let snapshot = self
            .backend
            .apply(
                game_id,
                Box::new(|session| {
                    let outcome = session.drop_participant(player_id);
                    let verdict = if outcome.delete {
                        UpdateOutcome::Delete
                    } else {
                        session.touch(player_id, now);
                        UpdateOutcome::Keep
                    };
                    departure = Some(outcome);
                    verdict
                }),
            )
            .await;

        let mut effects = Vec::new();
        match (snapshot, departure) {
            (Some(state), Some(outcome)) => {
                if outcome.delete {
                    info!("game {} deleted: last participant {} left", game_id, player_id);
                } else {
                    if let Some(new_host) = &outcome.new_host {
                        info!("game {}: host transferred to {}", game_id, new_host);
                    }
                    effects.push(Effect::Broadcast {
                        code: game_id.to_string(),
                        message: ServerMessage::PlayerLeft {
                            game_id: game_id.to_string(),
                            player_id: player_id.to_string(),
                            game_state: state,
                        },
                        exclude: Some(player_id.to_string()),
                    });
                }
            }
            _ => {
                // Leaving a game that no longer exists is a no-op.
            }
        }
        effects.push(Effect::Unbind);
        effects
    }
}
