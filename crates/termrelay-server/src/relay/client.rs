//! Client connection bookkeeping.
//!
//! One `ClientConnection` per realtime transport connection. The hub owns
//! these; the transport task only sees the client id and the outbound
//! event channel.

use std::time::Instant;
use tokio::sync::mpsc;
use termrelay_core::ServerEvent;

/// One connected client.
pub struct ClientConnection {
    /// Opaque id generated on connect.
    pub id: String,
    /// Channel into the connection's transport task.
    pub outbound: mpsc::Sender<ServerEvent>,
    /// Session this client is joined to, if any. A weak reference by id;
    /// many clients may name the same session.
    pub session_id: Option<String>,
    /// Client-side tab tag from the join message, for diagnostics.
    pub terminal_id: Option<String>,
    /// Last time a liveness response arrived.
    pub last_heartbeat: Instant,
}

impl ClientConnection {
    pub fn new(id: String, outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id,
            outbound,
            session_id: None,
            terminal_id: None,
            last_heartbeat: Instant::now(),
        }
    }
}

/// Generate a random client ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_client_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_opaque() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
