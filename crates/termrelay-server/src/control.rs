//! Control-plane surface for non-realtime callers.
//!
//! Synchronous request/response calls into the registry and hub, returning
//! JSON-serializable bodies. An HTTP or CLI layer sits on top of this; it
//! carries no framing requirements of its own.

use crate::relay::RelayHub;
use crate::session::SessionRegistry;
use serde::Serialize;
use std::sync::Arc;
use termrelay_core::messages::to_millis;
use termrelay_core::{RelayError, RelayResult};

/// One session as reported by the listing call. Timestamps are Unix epoch
/// milliseconds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub connected_clients: usize,
}

/// Response body for the session listing call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListing {
    pub sessions: Vec<SessionSummary>,
    pub total_connected_clients: usize,
}

/// Response body for a single session's status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub id: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub connected_clients: usize,
    pub client_ids: Vec<String>,
}

/// The control-plane API.
#[derive(Clone)]
pub struct ControlApi {
    registry: Arc<SessionRegistry>,
    hub: Arc<RelayHub>,
}

impl ControlApi {
    pub fn new(registry: Arc<SessionRegistry>, hub: Arc<RelayHub>) -> Self {
        Self { registry, hub }
    }

    /// All live sessions with their join-set sizes.
    pub async fn list_sessions(&self) -> SessionListing {
        let mut sessions = Vec::new();
        for session in self.registry.list().await {
            let connected_clients = self.hub.get_session_clients(&session.id).await.len();
            sessions.push(SessionSummary {
                id: session.id.clone(),
                created_at: to_millis(session.created_at()),
                last_activity: to_millis(session.last_activity()),
                connected_clients,
            });
        }
        SessionListing {
            sessions,
            total_connected_clients: self.hub.connected_clients().await,
        }
    }

    /// Status of one session, including joined client ids.
    pub async fn session_status(&self, session_id: &str) -> RelayResult<SessionStatus> {
        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        let client_ids = self.hub.get_session_clients(session_id).await;
        Ok(SessionStatus {
            id: session.id.clone(),
            created_at: to_millis(session.created_at()),
            last_activity: to_millis(session.last_activity()),
            connected_clients: client_ids.len(),
            client_ids,
        })
    }

    /// Send a full command line to a session, creating it if absent.
    pub async fn send_command(&self, session_id: &str, command: &str) -> RelayResult<()> {
        self.hub.send_command_to_session(session_id, command).await
    }

    /// Destroy a session, notifying joined clients first. Returns false if
    /// no such session existed.
    pub async fn destroy_session(&self, session_id: &str) -> bool {
        self.hub.close_session(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionOptions, SessionStore};
    use std::time::Duration;

    async fn test_control() -> (ControlApi, Arc<RelayHub>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SessionStore::new(dir.path().join("sessions.json")));
        let (registry, events) = SessionRegistry::new(store, Duration::from_secs(600), 100);
        let hub = Arc::new(RelayHub::new(registry.clone()));
        hub.spawn_lifecycle_pump(events);
        (ControlApi::new(registry, hub.clone()), hub, dir)
    }

    #[tokio::test]
    async fn listing_reflects_live_sessions() {
        let (control, hub, _dir) = test_control().await;
        assert!(control.list_sessions().await.sessions.is_empty());

        hub.registry()
            .create(
                "s1",
                SessionOptions {
                    command: Some("cat".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("create");

        let listing = control.list_sessions().await;
        assert_eq!(listing.sessions.len(), 1);
        assert_eq!(listing.sessions[0].id, "s1");
        assert_eq!(listing.sessions[0].connected_clients, 0);
    }

    #[tokio::test]
    async fn status_of_unknown_session_is_not_found() {
        let (control, _hub, _dir) = test_control().await;
        let err = control
            .session_status("nope")
            .await
            .expect_err("absent session");
        assert!(matches!(err, RelayError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn send_command_creates_the_session() {
        let (control, hub, _dir) = test_control().await;
        control
            .send_command("fresh", "echo hi")
            .await
            .expect("send_command");
        assert!(hub.registry().get("fresh").await.is_some());

        let status = control.session_status("fresh").await.expect("status");
        assert_eq!(status.connected_clients, 0);
    }

    #[tokio::test]
    async fn destroy_session_round_trip() {
        let (control, hub, _dir) = test_control().await;
        control
            .send_command("s1", "echo hi")
            .await
            .expect("send_command");
        assert!(control.destroy_session("s1").await);
        assert!(!control.destroy_session("s1").await);
        assert!(hub.registry().get("s1").await.is_none());
    }
}
