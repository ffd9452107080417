//! Shared protocol and data model for the game-timer synchronization engine
//!
//! This crate holds everything the server substrates and the device-side sync
//! client must agree on byte for byte:
//!
//! - the JSON wire protocol ([`message`])
//! - the session/player data model and typed patch merging ([`session`])
//! - the permission filter governing whose writes win ([`permission`])
//! - the error taxonomy mapped onto protocol error codes ([`error`])
//!
//! Keeping the protocol decision logic here means the long-lived server
//! process and the stateless per-request handler cannot drift apart.

pub mod error;
pub mod message;
pub mod permission;
pub mod session;

pub use error::SyncError;
pub use message::{ClientMessage, ConnState, DecodeError, ErrorCode, ServerMessage};
pub use session::{
    Participant, Player, PlayerPatch, PlayerProfile, Session, SessionPatch, TimerMode,
};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock timestamp in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_monotonic_enough() {
        let first = now_ms();
        std::thread::sleep(Duration::from_millis(2));
        let second = now_ms();
        assert!(second > first);
    }
}
