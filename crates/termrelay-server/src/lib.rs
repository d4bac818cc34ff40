//! Multi-client terminal relay server.
//!
//! Hosts shell processes under pseudo-terminals, relays their output to
//! any number of joined WebSocket clients, and persists session metadata
//! across restarts. The binary in `main.rs` is a thin wrapper around
//! [`server::RelayServer`].

pub mod config;
pub mod control;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;
