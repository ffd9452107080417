//! JSON wire protocol between sync clients and the server
//!
//! Every frame is a JSON object tagged by `type`. Client→server messages carry
//! intents; server→client messages carry full session snapshots so receivers
//! never need to reconstruct state from deltas.

use crate::session::{PlayerPatch, PlayerProfile, Session, SessionPatch};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inbound (client→server) messages, one per protocol operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "CREATE_GAME", rename_all = "camelCase")]
    CreateGame {
        player_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_data: Option<PlayerProfile>,
    },
    #[serde(rename = "JOIN_GAME", rename_all = "camelCase")]
    JoinGame {
        game_id: String,
        player_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_data: Option<PlayerProfile>,
    },
    #[serde(rename = "UPDATE_GAME_STATE", rename_all = "camelCase")]
    UpdateGameState {
        game_id: String,
        player_id: String,
        data: SessionPatch,
    },
    #[serde(rename = "UPDATE_PLAYER", rename_all = "camelCase")]
    UpdatePlayer {
        game_id: String,
        player_id: String,
        player_data: PlayerPatch,
    },
    #[serde(rename = "LEAVE_GAME", rename_all = "camelCase")]
    LeaveGame { game_id: String, player_id: String },
    #[serde(rename = "PING")]
    Ping,
}

impl ClientMessage {
    /// The wire tag, also used as the routing key by the stateless substrate.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::CreateGame { .. } => "CREATE_GAME",
            ClientMessage::JoinGame { .. } => "JOIN_GAME",
            ClientMessage::UpdateGameState { .. } => "UPDATE_GAME_STATE",
            ClientMessage::UpdatePlayer { .. } => "UPDATE_PLAYER",
            ClientMessage::LeaveGame { .. } => "LEAVE_GAME",
            ClientMessage::Ping => "PING",
        }
    }
}

/// Transport-level connection status pushed to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Connected,
    Disconnected,
}

/// Protocol error codes carried in `ERROR` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    GameNotFound,
    PermissionDenied,
    InvalidMessage,
    UnknownMessageType,
    InternalError,
}

/// Outbound (server→client) messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "CONNECTION_STATUS")]
    ConnectionStatus { status: ConnState, timestamp: u64 },
    #[serde(rename = "GAME_CREATED", rename_all = "camelCase")]
    GameCreated { game_id: String, game_state: Session },
    #[serde(rename = "GAME_JOINED", rename_all = "camelCase")]
    GameJoined { game_id: String, game_state: Session },
    #[serde(rename = "GAME_STATE_UPDATE", rename_all = "camelCase")]
    GameStateUpdate {
        game_id: String,
        game_state: Session,
        updated_by: String,
    },
    #[serde(rename = "PLAYER_JOINED", rename_all = "camelCase")]
    PlayerJoined {
        game_id: String,
        player_id: String,
        game_state: Session,
    },
    #[serde(rename = "PLAYER_LEFT", rename_all = "camelCase")]
    PlayerLeft {
        game_id: String,
        player_id: String,
        game_state: Session,
    },
    #[serde(rename = "ERROR")]
    Error { message: String, code: ErrorCode },
    #[serde(rename = "PONG")]
    Pong { timestamp: u64 },
}

const CLIENT_MESSAGE_TYPES: [&str; 6] = [
    "CREATE_GAME",
    "JOIN_GAME",
    "UPDATE_GAME_STATE",
    "UPDATE_PLAYER",
    "LEAVE_GAME",
    "PING",
];

/// Why an inbound frame could not be turned into a [`ClientMessage`].
/// The two cases surface as different protocol error codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Invalid(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl DecodeError {
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            DecodeError::Invalid(_) => ErrorCode::InvalidMessage,
            DecodeError::UnknownType(_) => ErrorCode::UnknownMessageType,
        }
    }
}

/// Decodes one inbound text frame, distinguishing an undecodable payload from
/// a well-formed frame with an unrecognized `type`.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Invalid(e.to_string()))?;

    let message_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| DecodeError::Invalid("missing \"type\" field".to_string()))?;

    if !CLIENT_MESSAGE_TYPES.contains(&message_type) {
        return Err(DecodeError::UnknownType(message_type.to_string()));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::Invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PlayerProfile;

    #[test]
    fn test_decode_create_game() {
        let msg = decode_client_message(
            r#"{"type":"CREATE_GAME","playerId":"p1","playerData":{"name":"Alice"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::CreateGame {
                player_id,
                player_data,
            } => {
                assert_eq!(player_id, "p1");
                assert_eq!(player_data.unwrap().name.as_deref(), Some("Alice"));
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_decode_ping_without_payload() {
        let msg = decode_client_message(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = decode_client_message(r#"{"type":"TELEPORT","gameId":"ABC123"}"#)
            .unwrap_err();
        assert_eq!(err, DecodeError::UnknownType("TELEPORT".to_string()));
        assert_eq!(err.wire_code(), ErrorCode::UnknownMessageType);
    }

    #[test]
    fn test_decode_malformed_payloads() {
        let err = decode_client_message("not json at all").unwrap_err();
        assert!(matches!(err, DecodeError::Invalid(_)));
        assert_eq!(err.wire_code(), ErrorCode::InvalidMessage);

        // Well-formed JSON but missing the tag.
        let err = decode_client_message(r#"{"gameId":"ABC123"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Invalid(_)));

        // Known type, wrong field shape.
        let err =
            decode_client_message(r#"{"type":"JOIN_GAME","gameId":42}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Invalid(_)));
    }

    #[test]
    fn test_client_message_wire_tags() {
        let msg = ClientMessage::JoinGame {
            game_id: "ABC123".into(),
            player_id: "p2".into(),
            player_data: Some(PlayerProfile::default()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"JOIN_GAME\""));
        assert!(json.contains("\"gameId\":\"ABC123\""));
        assert!(json.contains("\"playerId\":\"p2\""));
        assert_eq!(msg.type_name(), "JOIN_GAME");
    }

    #[test]
    fn test_server_message_roundtrip() {
        let session = crate::session::Session::new("XYZ789", "p1", 500);
        let messages = vec![
            ServerMessage::ConnectionStatus {
                status: ConnState::Connected,
                timestamp: 123,
            },
            ServerMessage::GameCreated {
                game_id: "XYZ789".into(),
                game_state: session.clone(),
            },
            ServerMessage::GameStateUpdate {
                game_id: "XYZ789".into(),
                game_state: session.clone(),
                updated_by: "p1".into(),
            },
            ServerMessage::PlayerLeft {
                game_id: "XYZ789".into(),
                player_id: "p2".into(),
                game_state: session,
            },
            ServerMessage::Error {
                message: "game XYZ789 not found".into(),
                code: ErrorCode::GameNotFound,
            },
            ServerMessage::Pong { timestamp: 42 },
        ];

        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let back: ServerMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(msg, back);
        }
    }

    #[test]
    fn test_error_code_wire_values() {
        let json = serde_json::to_string(&ErrorCode::GameNotFound).unwrap();
        assert_eq!(json, "\"GAME_NOT_FOUND\"");
        let json = serde_json::to_string(&ErrorCode::PermissionDenied).unwrap();
        assert_eq!(json, "\"PERMISSION_DENIED\"");
        let json = serde_json::to_string(&ErrorCode::UnknownMessageType).unwrap();
        assert_eq!(json, "\"UNKNOWN_MESSAGE_TYPE\"");
    }

    #[test]
    fn test_connection_status_wire_value() {
        let msg = ServerMessage::ConnectionStatus {
            status: ConnState::Connected,
            timestamp: 9,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"status\":\"connected\""));
        assert!(json.contains("\"type\":\"CONNECTION_STATUS\""));
    }
}
