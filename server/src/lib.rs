//! Server side of the game-timer synchronization engine
//!
//! The protocol lives in [`engine`]; everything else is substrate. Two
//! deployment shapes share that engine:
//!
//! - [`network`]: a long-lived process owning WebSocket connections directly,
//!   with sessions in [`store::MemorySessions`] and live connections in
//!   [`registry`].
//! - [`stateless`]: a per-request gateway for platforms that terminate the
//!   socket for us, with all state in a key/value store ([`kv`]) and outbound
//!   delivery through a server-push seam.

pub mod broadcast;
pub mod engine;
pub mod kv;
pub mod network;
pub mod registry;
pub mod stateless;
pub mod store;
