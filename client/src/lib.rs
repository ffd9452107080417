//! Device-side synchronization client for shared game timers
//!
//! [`client::SyncClient`] owns the connection lifecycle (reconnection,
//! offline queueing, keep-alive); [`authority`] decides which inbound state
//! updates are allowed to overwrite the local view.

pub mod authority;
pub mod client;

pub use authority::{LocalAuthorityGuard, UpdateVerdict};
pub use client::{ClientError, ClientEvent, SyncClient};
