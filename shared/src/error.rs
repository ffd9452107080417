//! Error taxonomy shared by both server substrates and the client.

use crate::message::ErrorCode;
use thiserror::Error;

/// Failures a session operation can signal. Every variant maps onto a
/// protocol-level error reply; none of them may crash a handling loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("game {0} not found")]
    SessionNotFound(String),

    /// The permission filter rejected every field of the proposed patch.
    #[error("patch rejected by the permission filter")]
    PermissionDenied,

    #[error("player roster is limited to {0} entries")]
    TooManyPlayers(usize),

    #[error("no player with id {0} in this game")]
    UnknownPlayer(u32),

    /// Code generation collided on every attempt within the retry bound.
    #[error("could not allocate an unused game code")]
    CodeSpaceExhausted,
}

impl SyncError {
    /// The wire error code carried in an `ERROR` reply.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            SyncError::SessionNotFound(_) => ErrorCode::GameNotFound,
            SyncError::PermissionDenied => ErrorCode::PermissionDenied,
            SyncError::TooManyPlayers(_) | SyncError::UnknownPlayer(_) => {
                ErrorCode::InvalidMessage
            }
            SyncError::CodeSpaceExhausted => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_mapping() {
        assert_eq!(
            SyncError::SessionNotFound("ABC123".into()).wire_code(),
            ErrorCode::GameNotFound
        );
        assert_eq!(
            SyncError::PermissionDenied.wire_code(),
            ErrorCode::PermissionDenied
        );
        assert_eq!(
            SyncError::TooManyPlayers(9).wire_code(),
            ErrorCode::InvalidMessage
        );
        assert_eq!(
            SyncError::UnknownPlayer(4).wire_code(),
            ErrorCode::InvalidMessage
        );
        assert_eq!(
            SyncError::CodeSpaceExhausted.wire_code(),
            ErrorCode::InternalError
        );
    }

    #[test]
    fn test_display_messages() {
        let err = SyncError::SessionNotFound("QWERTY".to_string());
        assert_eq!(err.to_string(), "game QWERTY not found");

        let err = SyncError::TooManyPlayers(9);
        assert!(err.to_string().contains('9'));
    }
}
