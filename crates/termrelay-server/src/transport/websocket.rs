//! WebSocket transport: listener plus JSON text framing.
//!
//! Accepts TCP connections, performs the WebSocket handshake, and wraps
//! each accepted socket in a framed connection speaking the relay protocol:
//! server events out, client messages in. The frame size cap and JSON
//! decoding live here, so the relay core only ever sees well-formed
//! messages.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use termrelay_core::messages::{decode_client, encode_event};
use termrelay_core::{ClientMessage, RelayError, RelayResult, ServerEvent};

/// Maximum inbound text frame size (1 MiB). Larger frames are dropped.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// An accepted, handshake-complete WebSocket connection.
pub struct WebSocketConnection {
    ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

impl WebSocketConnection {
    /// Split into the outbound event sink and the inbound frame source.
    pub fn split(self) -> (EventSink, FrameSource) {
        let (sink, stream) = self.ws_stream.split();
        (
            EventSink { sink },
            FrameSource {
                stream,
                remote_addr: self.remote_addr,
            },
        )
    }
}

/// Outbound half: serializes server events onto the socket.
pub struct EventSink {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

impl EventSink {
    /// Send one server event as a JSON text frame.
    pub async fn send_event(&mut self, event: &ServerEvent) -> RelayResult<()> {
        let text = encode_event(event)?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| RelayError::TransportSend(e.to_string()))
    }

    /// Reply to a protocol-level ping.
    pub async fn pong(&mut self, payload: Vec<u8>) -> RelayResult<()> {
        self.sink
            .send(Message::Pong(payload))
            .await
            .map_err(|e| RelayError::TransportSend(e.to_string()))
    }
}

/// One inbound item, after framing and decoding.
pub enum Inbound {
    /// A well-formed client message.
    Message(ClientMessage),
    /// Protocol-level ping from the peer; reply via [`EventSink::pong`].
    Ping(Vec<u8>),
    /// Protocol-level pong (liveness response).
    Pong,
    /// The peer closed the connection or the socket failed.
    Closed,
}

/// Inbound half: applies the frame size cap and JSON decoding, skipping
/// frames the relay core should never see.
pub struct FrameSource {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    remote_addr: SocketAddr,
}

impl FrameSource {
    pub async fn next(&mut self) -> Inbound {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > MAX_FRAME_SIZE {
                        warn!(remote = %self.remote_addr, len = text.len(), "oversized frame dropped");
                        continue;
                    }
                    match decode_client(&text) {
                        Ok(message) => return Inbound::Message(message),
                        // Unknown or malformed messages are non-fatal.
                        Err(e) => {
                            warn!(remote = %self.remote_addr, error = %e, "ignoring invalid message");
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => return Inbound::Ping(payload),
                Some(Ok(Message::Pong(_))) => return Inbound::Pong,
                Some(Ok(Message::Close(_))) | None => return Inbound::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(remote = %self.remote_addr, error = %e, "WebSocket receive failed");
                    return Inbound::Closed;
                }
            }
        }
    }
}

/// Bind the listener and start accepting connections.
///
/// Returns the bound address (useful when binding port 0) and a receiver
/// yielding handshake-complete connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> RelayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| RelayError::Transport(format!("WS local addr: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn framing_skips_garbage_and_yields_messages() {
        let (addr, mut conns) = start_listener("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("listener");
        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("connect");
        let conn = timeout(WAIT, conns.recv())
            .await
            .expect("accept timed out")
            .expect("listener task gone");
        let (mut sink, mut frames) = conn.split();

        // Malformed and oversized frames are dropped; the next valid
        // message still comes through.
        client
            .send(Message::Text("not json".into()))
            .await
            .expect("send");
        client
            .send(Message::Text("x".repeat(MAX_FRAME_SIZE + 1)))
            .await
            .expect("send");
        client
            .send(Message::Text(r#"{"type":"join","sessionId":"s1"}"#.into()))
            .await
            .expect("send");

        let inbound = timeout(WAIT, frames.next()).await.expect("inbound");
        assert!(matches!(
            inbound,
            Inbound::Message(ClientMessage::Join { ref session_id, .. }) if session_id == "s1"
        ));

        sink.send_event(&ServerEvent::Pong { timestamp: 7 })
            .await
            .expect("send_event");
        let frame = timeout(WAIT, client.next())
            .await
            .expect("reply timed out")
            .expect("client stream ended")
            .expect("client receive");
        assert_eq!(frame, Message::Text(r#"{"type":"pong","timestamp":7}"#.into()));

        client.close(None).await.expect("close");
        let closed = timeout(WAIT, frames.next()).await.expect("close frame");
        assert!(matches!(closed, Inbound::Closed));
    }
}
