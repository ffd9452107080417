//! Broadcast router: session-wide fan-out with per-recipient isolation

use crate::registry::{ConnId, ConnectionRegistry};
use log::warn;
use shared::ServerMessage;

/// Delivers `message` to every connection of `code`, except the optionally
/// excluded participant. A failure against one recipient never aborts
/// delivery to the rest; the failed recipients are returned so the caller can
/// run the disconnect cascade for them.
pub async fn fan_out(
    registry: &ConnectionRegistry,
    code: &str,
    message: &ServerMessage,
    exclude: Option<&str>,
) -> Vec<(ConnId, String)> {
    let mut failed = Vec::new();
    for (conn, participant_id) in registry.participants_in(code).await {
        if exclude == Some(participant_id.as_str()) {
            continue;
        }
        if !registry.send(conn, message).await {
            warn!(
                "broadcast to connection {} ({}) in game {} failed",
                conn, participant_id, code
            );
            failed.push((conn, participant_id));
        }
    }
    failed
}
