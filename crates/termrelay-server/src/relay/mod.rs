//! Realtime fan-out: client connections and the relay hub.

pub mod client;
pub mod hub;

pub use client::ClientConnection;
pub use hub::{ActiveSession, RelayHub};
