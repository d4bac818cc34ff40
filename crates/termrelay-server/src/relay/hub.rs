//! Relay hub: fans PTY session output out to joined clients and routes
//! client input back to the right session.
//!
//! The hub tracks connected clients, the per-session join-sets, and one
//! output forwarder task per session with a non-empty join-set. Forwarders
//! are attached on first join and detached on last leave, so a session
//! with no viewers costs nothing and never double-delivers.

use super::client::{generate_client_id, ClientConnection};
use crate::session::{
    DestroyReason, PtySession, SessionEvent, SessionLifecycle, SessionOptions, SessionRegistry,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use termrelay_core::messages::now_millis;
use termrelay_core::{RelayError, RelayResult, ClientMessage, ServerEvent};

/// Per-session join-set size, as reported on the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub session_id: String,
    pub client_count: usize,
}

/// The fan-out router between client connections and PTY sessions.
pub struct RelayHub {
    registry: Arc<SessionRegistry>,
    clients: RwLock<HashMap<String, ClientConnection>>,
    /// Join-sets: sessionId -> set of clientIds subscribed to its output.
    session_clients: RwLock<HashMap<String, HashSet<String>>>,
    /// Output forwarder tasks, keyed by sessionId. An entry exists iff the
    /// session's join-set is non-empty.
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RelayHub {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            clients: RwLock::new(HashMap::new()),
            session_clients: RwLock::new(HashMap::new()),
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a new connection and return its generated client id.
    pub async fn on_connect(&self, outbound: mpsc::Sender<ServerEvent>) -> String {
        let client_id = generate_client_id();
        self.clients.write().await.insert(
            client_id.clone(),
            ClientConnection::new(client_id.clone(), outbound),
        );
        info!(client_id, "client connected");
        client_id
    }

    /// Dispatch one decoded client message.
    pub async fn on_message(self: &Arc<Self>, client_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::Join {
                session_id,
                terminal_id,
            } => self.handle_join(client_id, session_id, terminal_id).await,
            ClientMessage::Leave { session_id } => self.handle_leave(client_id, &session_id).await,
            ClientMessage::Input { session_id, data } => {
                self.handle_input(client_id, &session_id, data).await
            }
            ClientMessage::Ping => {
                self.send_to_client(
                    client_id,
                    ServerEvent::Pong {
                        timestamp: now_millis(),
                    },
                )
                .await;
            }
            ClientMessage::Pong => self.record_pong(client_id).await,
        }
    }

    /// Remove a client and its join-set membership. Idempotent: the second
    /// call for the same id is a no-op, whichever path (close handler,
    /// error handler, probe timeout) got there first.
    pub async fn on_disconnect(&self, client_id: &str) {
        let removed = self.clients.write().await.remove(client_id);
        let Some(client) = removed else {
            return;
        };
        debug!(client_id, "client disconnected");

        if let Some(session_id) = client.session_id {
            self.remove_from_session(client_id, &session_id).await;
            self.broadcast_client_count(&session_id).await;
        }
    }

    async fn handle_join(
        self: &Arc<Self>,
        client_id: &str,
        session_id: String,
        terminal_id: Option<String>,
    ) {
        // At most one session per client: leave the previous one first.
        let previous = {
            let clients = self.clients.read().await;
            match clients.get(client_id) {
                Some(c) => c.session_id.clone(),
                None => return,
            }
        };
        if let Some(prev) = previous.filter(|p| *p != session_id) {
            self.remove_from_session(client_id, &prev).await;
            self.broadcast_client_count(&prev).await;
        }

        // Look up or create the named session.
        let session = match self.registry.get(&session_id).await {
            Some(session) => session,
            None => {
                info!(client_id, session_id, "creating session on join");
                match self
                    .registry
                    .create(&session_id, SessionOptions::default())
                    .await
                {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(client_id, session_id, error = %e, "session create failed");
                        self.send_to_client(
                            client_id,
                            ServerEvent::Error {
                                data: format!("failed to create session: {e}"),
                                timestamp: now_millis(),
                            },
                        )
                        .await;
                        return;
                    }
                }
            }
        };

        {
            let mut clients = self.clients.write().await;
            if let Some(client) = clients.get_mut(client_id) {
                client.session_id = Some(session_id.clone());
                client.terminal_id = terminal_id;
            }
        }
        self.session_clients
            .write()
            .await
            .entry(session_id.clone())
            .or_default()
            .insert(client_id.to_string());

        self.ensure_forwarder(&session_id, &session).await;

        // A destroy can race the lookup above. If the session vanished (or
        // was replaced) in the meantime, the membership just added would
        // outlive it and never see a session_closed, so roll it back and
        // report the failure instead of acking a dead session.
        let still_live = self
            .registry
            .get(&session_id)
            .await
            .is_some_and(|current| Arc::ptr_eq(&current, &session));
        if !still_live {
            warn!(client_id, session_id, "session destroyed during join");
            self.remove_from_session(client_id, &session_id).await;
            {
                let mut clients = self.clients.write().await;
                if let Some(client) = clients.get_mut(client_id) {
                    if client.session_id.as_deref() == Some(session_id.as_str()) {
                        client.session_id = None;
                        client.terminal_id = None;
                    }
                }
            }
            self.send_to_client(
                client_id,
                ServerEvent::Error {
                    data: format!("failed to join session: {session_id} was closed"),
                    timestamp: now_millis(),
                },
            )
            .await;
            return;
        }

        self.send_to_client(
            client_id,
            ServerEvent::Connected {
                session_id: session_id.clone(),
                timestamp: now_millis(),
            },
        )
        .await;
        self.broadcast_client_count(&session_id).await;
        info!(client_id, session_id, "client joined session");
    }

    async fn handle_leave(&self, client_id: &str, session_id: &str) {
        {
            let mut clients = self.clients.write().await;
            if let Some(client) = clients.get_mut(client_id) {
                if client.session_id.as_deref() == Some(session_id) {
                    client.session_id = None;
                    client.terminal_id = None;
                }
            }
        }
        // The PTY session itself stays alive; only the subscription ends.
        self.remove_from_session(client_id, session_id).await;
        self.broadcast_client_count(session_id).await;
        info!(client_id, session_id, "client left session");
    }

    async fn handle_input(self: &Arc<Self>, client_id: &str, session_id: &str, data: String) {
        match self.registry.write_raw(session_id, data.into_bytes()).await {
            Ok(()) => {}
            Err(RelayError::SessionNotFound(_)) => {
                warn!(client_id, session_id, "input for unknown session");
                self.send_to_client(
                    client_id,
                    ServerEvent::Error {
                        data: "terminal session not found".into(),
                        timestamp: now_millis(),
                    },
                )
                .await;
            }
            Err(e) => {
                warn!(client_id, session_id, error = %e, "input write failed");
                self.send_to_client(
                    client_id,
                    ServerEvent::Error {
                        data: "failed to send input to terminal".into(),
                        timestamp: now_millis(),
                    },
                )
                .await;
            }
        }
    }

    /// Deliver `event` to every client in the session's join-set. A failed
    /// delivery disconnects that client but never aborts the loop.
    pub async fn broadcast(&self, session_id: &str, event: ServerEvent) {
        let targets: Vec<String> = {
            let session_clients = self.session_clients.read().await;
            match session_clients.get(session_id) {
                Some(set) => set.iter().cloned().collect(),
                None => return,
            }
        };

        let mut failed = Vec::new();
        {
            let clients = self.clients.read().await;
            for client_id in &targets {
                if let Some(client) = clients.get(client_id) {
                    if client.outbound.try_send(event.clone()).is_err() {
                        failed.push(client_id.clone());
                    }
                }
            }
        }
        for client_id in failed {
            warn!(client_id, session_id, "transport send failed, dropping client");
            Box::pin(self.on_disconnect(&client_id)).await;
        }
    }

    /// Record a liveness response from the client.
    pub async fn record_pong(&self, client_id: &str) {
        if let Some(client) = self.clients.write().await.get_mut(client_id) {
            client.last_heartbeat = Instant::now();
        }
    }

    /// Whether the client has gone silent for longer than `max_age`.
    /// Unknown clients count as expired.
    pub async fn heartbeat_expired(&self, client_id: &str, max_age: Duration) -> bool {
        let clients = self.clients.read().await;
        match clients.get(client_id) {
            Some(client) => client.last_heartbeat.elapsed() > max_age,
            None => true,
        }
    }

    /// Drain registry lifecycle events so join-set bookkeeping follows
    /// session destruction initiated outside the hub (idle sweep, exits).
    pub fn spawn_lifecycle_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SessionLifecycle>,
    ) {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(hub) = hub.upgrade() else { break };
                match event {
                    SessionLifecycle::Created { session_id } => {
                        debug!(session_id, "session lifecycle: created");
                    }
                    SessionLifecycle::Destroyed { session_id, reason } => {
                        hub.on_session_destroyed(&session_id, reason).await;
                    }
                }
            }
        });
    }

    /// React to a session leaving the registry.
    async fn on_session_destroyed(&self, session_id: &str, reason: DestroyReason) {
        match reason {
            // Joined clients already saw the exit event; keep them in the
            // join-set so a re-join transparently respawns the shell. The
            // forwarder ends on its own when the output channel closes.
            DestroyReason::Exited(_) => {
                self.forwarders.lock().await.remove(session_id);
            }
            _ => self.notify_closed_and_clear(session_id).await,
        }
    }

    /// Tell joined clients the session is gone and drop all bookkeeping
    /// for it.
    async fn notify_closed_and_clear(&self, session_id: &str) {
        let members = self.session_clients.write().await.remove(session_id);
        if let Some(members) = members {
            let event = ServerEvent::SessionClosed {
                session_id: session_id.to_string(),
                timestamp: now_millis(),
            };
            {
                let clients = self.clients.read().await;
                for client_id in &members {
                    if let Some(client) = clients.get(client_id) {
                        let _ = client.outbound.try_send(event.clone());
                    }
                }
            }
            let mut clients = self.clients.write().await;
            for client_id in &members {
                if let Some(client) = clients.get_mut(client_id) {
                    if client.session_id.as_deref() == Some(session_id) {
                        client.session_id = None;
                        client.terminal_id = None;
                    }
                }
            }
        }
        if let Some(handle) = self.forwarders.lock().await.remove(session_id) {
            handle.abort();
        }
    }

    // ── Admin surface (non-realtime callers) ────────────────────────────

    /// Run a whole command line in a session, creating it if absent.
    /// Output reaches joined clients through the normal broadcast path.
    pub async fn send_command_to_session(
        self: &Arc<Self>,
        session_id: &str,
        command: &str,
    ) -> RelayResult<()> {
        let session = match self.registry.get(session_id).await {
            Some(session) => session,
            None => {
                self.registry
                    .create(session_id, SessionOptions::default())
                    .await?
            }
        };
        // A respawned session needs its forwarder reattached if viewers
        // are still joined from before the old process exited.
        let has_members = self
            .session_clients
            .read()
            .await
            .get(session_id)
            .is_some_and(|set| !set.is_empty());
        if has_members {
            self.ensure_forwarder(session_id, &session).await;
        }
        self.registry.execute_command(session_id, command).await
    }

    /// Join-set sizes for all sessions with at least one client.
    pub async fn get_active_sessions(&self) -> Vec<ActiveSession> {
        let session_clients = self.session_clients.read().await;
        session_clients
            .iter()
            .map(|(session_id, set)| ActiveSession {
                session_id: session_id.clone(),
                client_count: set.len(),
            })
            .collect()
    }

    /// Ids of the clients joined to one session.
    pub async fn get_session_clients(&self, session_id: &str) -> Vec<String> {
        self.session_clients
            .read()
            .await
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of connected clients, joined or not.
    pub async fn connected_clients(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Notify joined clients, clear the join-set, and destroy the PTY.
    pub async fn close_session(&self, session_id: &str) -> bool {
        self.notify_closed_and_clear(session_id).await;
        self.registry.destroy(session_id).await
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn send_to_client(&self, client_id: &str, event: ServerEvent) -> bool {
        let sent = {
            let clients = self.clients.read().await;
            match clients.get(client_id) {
                Some(client) => client.outbound.try_send(event).is_ok(),
                None => return false,
            }
        };
        if !sent {
            warn!(client_id, "transport send failed, dropping client");
            self.on_disconnect(client_id).await;
        }
        sent
    }

    /// Drop `client_id` from the session's join-set; when the set drains,
    /// detach the output forwarder. Remove-if-present semantics.
    async fn remove_from_session(&self, client_id: &str, session_id: &str) {
        let emptied = {
            let mut session_clients = self.session_clients.write().await;
            match session_clients.get_mut(session_id) {
                Some(set) => {
                    set.remove(client_id);
                    if set.is_empty() {
                        session_clients.remove(session_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if emptied {
            if let Some(handle) = self.forwarders.lock().await.remove(session_id) {
                handle.abort();
                debug!(session_id, "output forwarder detached");
            }
        }
    }

    async fn broadcast_client_count(&self, session_id: &str) {
        let count = self
            .session_clients
            .read()
            .await
            .get(session_id)
            .map(|set| set.len())
            .unwrap_or(0);
        self.broadcast(
            session_id,
            ServerEvent::ClientsCount {
                count,
                timestamp: now_millis(),
            },
        )
        .await;
    }

    /// Attach the output forwarder for a session unless one is already
    /// running. Holding the forwarders lock across the spawn keeps two
    /// concurrent joins from double-attaching.
    async fn ensure_forwarder(self: &Arc<Self>, session_id: &str, session: &Arc<PtySession>) {
        let mut forwarders = self.forwarders.lock().await;
        if let Some(handle) = forwarders.get(session_id) {
            if !handle.is_finished() {
                return;
            }
        }

        let mut rx = session.subscribe();
        let hub = Arc::downgrade(self);
        let sid = session_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(SessionEvent::Output(content)) => ServerEvent::Output {
                        content,
                        timestamp: now_millis(),
                    },
                    Ok(SessionEvent::Exit(code)) => ServerEvent::Exit {
                        code,
                        timestamp: now_millis(),
                    },
                    // Dropped chunks under backpressure; keep forwarding.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id = %sid, skipped, "output forwarder lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Some(hub) = hub.upgrade() else { break };
                hub.broadcast(&sid, event).await;
            }
        });
        forwarders.insert(session_id.to_string(), handle);
        debug!(session_id, "output forwarder attached");
    }
}
