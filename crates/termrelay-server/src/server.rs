//! Core server: accepts connections and runs the per-connection loop.
//!
//! Owns the session registry, relay hub, and persistence store; the
//! composition root that wires lifecycle events, the idle sweep, and the
//! WebSocket listener together. No global mutable state: everything hangs
//! off this object.

use crate::config::ServerConfig;
use crate::control::ControlApi;
use crate::relay::RelayHub;
use crate::session::{SessionRegistry, SessionStore};
use crate::transport::websocket::{self, Inbound, WebSocketConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use termrelay_core::messages::now_millis;
use termrelay_core::{RelayError, RelayResult, ServerEvent};

/// Server-side liveness probe interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound event buffer per connection. A client this far behind is slow
/// enough to treat as disconnected.
const OUTBOUND_BUFFER: usize = 256;

/// The relay server instance.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    hub: Arc<RelayHub>,
    /// Taken once by `run`.
    lifecycle_rx:
        Mutex<Option<mpsc::UnboundedReceiver<crate::session::SessionLifecycle>>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let store = Arc::new(SessionStore::new(config.state_file.clone()));
        let (registry, lifecycle_rx) =
            SessionRegistry::new(store, config.idle_timeout(), config.max_sessions);
        let hub = Arc::new(RelayHub::new(registry.clone()));
        Self {
            config,
            registry,
            hub,
            lifecycle_rx: Mutex::new(Some(lifecycle_rx)),
        }
    }

    /// Request/response surface for an HTTP or CLI layer.
    pub fn control(&self) -> ControlApi {
        ControlApi::new(self.registry.clone(), self.hub.clone())
    }

    /// Restore persisted sessions, start the idle sweep, and accept
    /// WebSocket connections until the listener closes.
    pub async fn run(self: Arc<Self>) -> RelayResult<()> {
        if let Some(rx) = self.lifecycle_rx.lock().await.take() {
            self.hub.spawn_lifecycle_pump(rx);
        }

        match self.registry.restore().await {
            Ok(count) if count > 0 => info!(count, "restored persisted sessions"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "session restore failed"),
        }

        let registry = self.registry.clone();
        let sweep_interval = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = registry.sweep().await;
                if !removed.is_empty() {
                    info!(count = removed.len(), "idle sweep removed sessions");
                }
            }
        });

        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port)
            .parse()
            .map_err(|e| RelayError::Other(format!("invalid address: {e}")))?;
        let (local_addr, mut connections) = websocket::start_listener(addr).await?;
        info!(addr = %local_addr, "termrelay-server ready");

        while let Some(conn) = connections.recv().await {
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(conn).await;
            });
        }
        Ok(())
    }

    /// Per-connection loop: outbound events, inbound frames, heartbeat
    /// probes. Disconnect cleanup runs exactly once on every exit path.
    async fn handle_connection(&self, conn: WebSocketConnection) {
        let remote = conn.remote_addr;
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);
        let client_id = self.hub.on_connect(outbound_tx.clone()).await;
        info!(remote = %remote, client_id, "WebSocket connection established");

        // Initial liveness event so clients observe a working channel.
        let _ = outbound_tx.try_send(ServerEvent::Pong {
            timestamp: now_millis(),
        });

        let (mut sink, mut frames) = conn.split();
        let mut probe = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );

        loop {
            tokio::select! {
                Some(event) = outbound_rx.recv() => {
                    if sink.send_event(&event).await.is_err() {
                        break;
                    }
                }
                _ = probe.tick() => {
                    // No liveness response since the previous probe means
                    // the connection is dead.
                    if self.hub.heartbeat_expired(&client_id, HEARTBEAT_INTERVAL * 2).await {
                        debug!(client_id, "heartbeat timed out");
                        break;
                    }
                    let ping = ServerEvent::Ping {
                        timestamp: now_millis(),
                    };
                    if sink.send_event(&ping).await.is_err() {
                        break;
                    }
                }
                inbound = frames.next() => match inbound {
                    Inbound::Message(message) => self.hub.on_message(&client_id, message).await,
                    Inbound::Pong => self.hub.record_pong(&client_id).await,
                    Inbound::Ping(payload) => {
                        let _ = sink.pong(payload).await;
                    }
                    Inbound::Closed => break,
                }
            }
        }

        self.hub.on_disconnect(&client_id).await;
    }

    /// Destroy all live sessions. Run best-effort before process exit.
    pub async fn shutdown(&self) {
        info!("shutting down, destroying all sessions");
        self.registry.shutdown_all().await;
    }
}
