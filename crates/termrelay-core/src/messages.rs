//! Wire messages exchanged over the realtime transport.
//!
//! Both directions use a tagged JSON union: the `type` field selects the
//! variant, remaining fields are camelCase. Timestamps are Unix epoch
//! milliseconds.

use crate::error::RelayResult;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Convert a `SystemTime` to Unix epoch milliseconds.
pub fn to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Messages a client may send to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a session's output, creating the session if absent.
    #[serde(rename_all = "camelCase")]
    Join {
        session_id: String,
        /// Client-side tab identifier, kept for diagnostics only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terminal_id: Option<String>,
    },
    /// Unsubscribe from a session. The PTY itself stays alive.
    #[serde(rename_all = "camelCase")]
    Leave { session_id: String },
    /// Raw keystrokes for the session's PTY. No terminator is appended.
    #[serde(rename_all = "camelCase")]
    Input { session_id: String, data: String },
    /// Client-initiated liveness probe.
    Ping,
    /// Response to a server `ping`.
    Pong,
}

/// Events the relay pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Acknowledges a successful join.
    #[serde(rename_all = "camelCase")]
    Connected { session_id: String, timestamp: u64 },
    /// A chunk of PTY output.
    Output { content: String, timestamp: u64 },
    /// A caller-visible failure, delivered on the same channel as output.
    Error { data: String, timestamp: u64 },
    /// The session's shell process exited.
    Exit { code: i32, timestamp: u64 },
    /// Join-set size changed; lets UIs show "N viewers".
    ClientsCount { count: usize, timestamp: u64 },
    /// The session was destroyed (explicit close or idle timeout).
    #[serde(rename_all = "camelCase")]
    SessionClosed { session_id: String, timestamp: u64 },
    /// Server-initiated liveness probe; clients answer with a `pong`
    /// message.
    Ping { timestamp: u64 },
    /// Response to a client `ping`.
    Pong { timestamp: u64 },
}

/// Encode a server event as a JSON text frame.
pub fn encode_event(event: &ServerEvent) -> RelayResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode a client message from a JSON text frame.
pub fn decode_client(text: &str) -> RelayResult<ClientMessage> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_wire_format() {
        let msg = decode_client(r#"{"type":"join","sessionId":"s1","terminalId":"tab-2"}"#)
            .expect("decode");
        assert_eq!(
            msg,
            ClientMessage::Join {
                session_id: "s1".into(),
                terminal_id: Some("tab-2".into()),
            }
        );
    }

    #[test]
    fn join_without_terminal_id() {
        let msg = decode_client(r#"{"type":"join","sessionId":"s1"}"#).expect("decode");
        assert_eq!(
            msg,
            ClientMessage::Join {
                session_id: "s1".into(),
                terminal_id: None,
            }
        );
    }

    #[test]
    fn input_carries_raw_data() {
        let msg = decode_client(r#"{"type":"input","sessionId":"s1","data":"\u000c"}"#)
            .expect("decode");
        assert_eq!(
            msg,
            ClientMessage::Input {
                session_id: "s1".into(),
                data: "\u{c}".into(),
            }
        );
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(decode_client(r#"{"type":"resize","sessionId":"s1"}"#).is_err());
    }

    #[test]
    fn event_tags_match_protocol() {
        let cases = [
            (
                ServerEvent::Connected {
                    session_id: "s1".into(),
                    timestamp: 1,
                },
                r#"{"type":"connected","sessionId":"s1","timestamp":1}"#,
            ),
            (
                ServerEvent::ClientsCount {
                    count: 2,
                    timestamp: 1,
                },
                r#"{"type":"clients_count","count":2,"timestamp":1}"#,
            ),
            (
                ServerEvent::SessionClosed {
                    session_id: "s1".into(),
                    timestamp: 1,
                },
                r#"{"type":"session_closed","sessionId":"s1","timestamp":1}"#,
            ),
            (
                ServerEvent::Exit {
                    code: 0,
                    timestamp: 1,
                },
                r#"{"type":"exit","code":0,"timestamp":1}"#,
            ),
            (
                ServerEvent::Ping { timestamp: 1 },
                r#"{"type":"ping","timestamp":1}"#,
            ),
        ];
        for (event, expected) in cases {
            assert_eq!(encode_event(&event).expect("encode"), expected);
        }
    }

    #[test]
    fn ping_pong_round_trip() {
        assert_eq!(
            decode_client(r#"{"type":"ping"}"#).expect("decode"),
            ClientMessage::Ping
        );
        let pong = encode_event(&ServerEvent::Pong { timestamp: 42 }).expect("encode");
        assert_eq!(pong, r#"{"type":"pong","timestamp":42}"#);
    }
}
