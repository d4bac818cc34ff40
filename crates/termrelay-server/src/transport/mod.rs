//! Realtime transports.

pub mod websocket;
