//! Session lifecycle management.
//!
//! The registry is the single source of truth for which PTY sessions exist.
//! It creates sessions (destroy-then-create, so an id never maps to more
//! than one live process), pumps PTY output into per-session broadcast
//! channels, persists metadata for restart recovery, and runs the idle
//! sweep.

use super::persistence::{log_persistence_error, PersistedSessionRecord, SessionStore};
use super::pty::PtyHandle;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use termrelay_core::messages::{now_millis, to_millis};
use termrelay_core::{RelayError, RelayResult};

/// Capacity of each session's output broadcast channel. Subscribers that
/// lag behind this many chunks skip ahead rather than stall the pump.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Events flowing out of a session's PTY.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A chunk of output (lossy UTF-8).
    Output(String),
    /// The shell process exited with this code. Always the final event.
    Exit(i32),
}

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// Explicit destroy request (or replacement by a new create).
    Explicit,
    /// The underlying process exited on its own.
    Exited(i32),
    /// The idle sweep timed the session out.
    IdleTimeout,
    /// Process-wide shutdown.
    Shutdown,
}

/// Registry lifecycle notifications, consumed by the composition root so
/// the relay hub can clean up join-set bookkeeping.
#[derive(Debug, Clone)]
pub enum SessionLifecycle {
    Created {
        session_id: String,
    },
    Destroyed {
        session_id: String,
        reason: DestroyReason,
    },
}

/// Options for spawning a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Program to run; None spawns the default shell.
    pub command: Option<String>,
    /// Working directory; None uses the server's current directory.
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    /// Environment snapshot; None snapshots the server's environment at
    /// spawn time.
    pub env: Option<HashMap<String, String>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            command: None,
            cwd: None,
            cols: 80,
            rows: 24,
            env: None,
        }
    }
}

/// One live PTY session.
pub struct PtySession {
    pub id: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pty: PtyHandle,
    env: HashMap<String, String>,
    output_tx: broadcast::Sender<SessionEvent>,
    created_at: SystemTime,
    last_activity: StdMutex<SystemTime>,
}

impl PtySession {
    /// Subscribe to this session's output event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.output_tx.subscribe()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn last_activity(&self) -> SystemTime {
        self.last_activity
            .lock()
            .map(|t| *t)
            .unwrap_or(self.created_at)
    }

    /// Time since the last input or output event.
    pub fn idle(&self) -> Duration {
        self.last_activity().elapsed().unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_activity.lock() {
            *t = SystemTime::now();
        }
    }

    /// Durable metadata snapshot for this session.
    pub fn record(&self) -> PersistedSessionRecord {
        PersistedSessionRecord {
            session_id: self.id.clone(),
            created_at: to_millis(self.created_at),
            last_activity: to_millis(self.last_activity()),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            cols: self.cols,
            rows: self.rows,
        }
    }

    /// Kill the underlying process without going through the registry.
    /// The output pump observes the exit and performs normal self-cleanup.
    pub fn kill_process(&self) -> RelayResult<()> {
        self.pty.kill()
    }
}

/// Manages all live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PtySession>>>,
    store: Arc<SessionStore>,
    idle_timeout: Duration,
    max_sessions: usize,
    events_tx: mpsc::UnboundedSender<SessionLifecycle>,
}

impl SessionRegistry {
    /// Create a registry. The returned receiver yields lifecycle events;
    /// the composition root must drain it.
    pub fn new(
        store: Arc<SessionStore>,
        idle_timeout: Duration,
        max_sessions: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionLifecycle>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sessions: RwLock::new(HashMap::new()),
                store,
                idle_timeout,
                max_sessions,
                events_tx,
            }),
            events_rx,
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Create a session, destroying any existing session with the same id
    /// first. Idempotent by replacement, never additive.
    pub async fn create(
        self: &Arc<Self>,
        session_id: &str,
        opts: SessionOptions,
    ) -> RelayResult<Arc<PtySession>> {
        self.destroy(session_id).await;

        {
            let sessions = self.sessions.read().await;
            if sessions.len() >= self.max_sessions {
                return Err(RelayError::Other(format!(
                    "max sessions ({}) reached",
                    self.max_sessions
                )));
            }
        }

        let cwd = match opts.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir()?,
        };
        let env: HashMap<String, String> =
            opts.env.unwrap_or_else(|| std::env::vars().collect());

        let (pty, reader) =
            PtyHandle::spawn(opts.command.as_deref(), &cwd, opts.cols, opts.rows, &env)?;

        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let now = SystemTime::now();
        let session = Arc::new(PtySession {
            id: session_id.to_string(),
            cwd,
            cols: opts.cols,
            rows: opts.rows,
            pty,
            env,
            output_tx,
            created_at: now,
            last_activity: StdMutex::new(now),
        });

        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), session.clone());
        log_persistence_error("create", self.store.upsert(session.record()).await);

        self.spawn_output_pump(session.clone(), reader);

        let _ = self.events_tx.send(SessionLifecycle::Created {
            session_id: session_id.to_string(),
        });
        info!(session_id, "session created");

        Ok(session)
    }

    /// Pure lookup, no side effect.
    pub async fn get(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// All live sessions.
    pub async fn list(&self) -> Vec<Arc<PtySession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Write `command` plus a line terminator to the session's PTY.
    /// Output arrives asynchronously on the session's event stream.
    pub async fn execute_command(&self, session_id: &str, command: &str) -> RelayResult<()> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        self.write_session(&session, format!("{command}\n").into_bytes())
            .await
    }

    /// Write arbitrary bytes (keystrokes, control characters) with no
    /// terminator appended.
    pub async fn write_raw(&self, session_id: &str, data: Vec<u8>) -> RelayResult<()> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        self.write_session(&session, data).await
    }

    async fn write_session(&self, session: &Arc<PtySession>, data: Vec<u8>) -> RelayResult<()> {
        session.touch();
        let s = session.clone();
        tokio::task::spawn_blocking(move || s.pty.write(&data))
            .await
            .map_err(|e| RelayError::Other(format!("join error: {e}")))??;
        log_persistence_error("activity", self.store.upsert(session.record()).await);
        Ok(())
    }

    /// Destroy a session: kill the process, drop the registry entry, remove
    /// the persisted record. Returns false if the id had no live entry.
    pub async fn destroy(&self, session_id: &str) -> bool {
        self.destroy_entry(session_id, None, DestroyReason::Explicit)
            .await
    }

    /// Destroy every live session (process-wide shutdown).
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.destroy_entry(&id, None, DestroyReason::Shutdown).await;
        }
    }

    /// Destroy sessions whose idle time is at or past the timeout, and
    /// flush activity timestamps for the survivors. Returns removed ids.
    ///
    /// Idle time is read at sweep time, so genuine activity keeps pushing
    /// the deadline forward.
    pub async fn sweep(&self) -> Vec<String> {
        let snapshot: Vec<(String, Arc<PtySession>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(id, s)| (id.clone(), s.clone()))
                .collect()
        };

        let mut removed = Vec::new();
        let mut live_records = Vec::new();
        for (id, session) in snapshot {
            if session.idle() >= self.idle_timeout {
                if self
                    .destroy_entry(&id, Some(&session), DestroyReason::IdleTimeout)
                    .await
                {
                    warn!(session_id = %id, "session expired (idle)");
                    removed.push(id);
                }
            } else {
                live_records.push(session.record());
            }
        }

        log_persistence_error("flush", self.store.upsert_all(live_records).await);
        removed
    }

    /// Recreate persisted sessions whose last activity falls within the
    /// idle timeout; discard stale records. Runs once at startup, before
    /// connections are accepted.
    pub async fn restore(self: &Arc<Self>) -> RelayResult<usize> {
        let records = self.store.load().await?;
        let mut restored = 0;
        for rec in records {
            let idle = Duration::from_millis(now_millis().saturating_sub(rec.last_activity));
            if idle < self.idle_timeout {
                let opts = SessionOptions {
                    command: None,
                    cwd: Some(rec.cwd.clone()),
                    cols: rec.cols,
                    rows: rec.rows,
                    env: Some(rec.env.clone()),
                };
                match self.create(&rec.session_id, opts).await {
                    Ok(_) => {
                        info!(session_id = %rec.session_id, "session restored");
                        restored += 1;
                    }
                    Err(e) => {
                        warn!(session_id = %rec.session_id, error = %e, "failed to restore session");
                        log_persistence_error("discard", self.store.remove(&rec.session_id).await);
                    }
                }
            } else {
                debug!(session_id = %rec.session_id, "discarding stale session record");
                log_persistence_error("discard", self.store.remove(&rec.session_id).await);
            }
        }
        Ok(restored)
    }

    /// Remove and tear down a session. When `expected` is given, the entry
    /// is only removed if it is still that exact instance; this keeps a
    /// stale exit callback from destroying a replacement session that
    /// reused the id. Safe to call re-entrantly from the exit path.
    async fn destroy_entry(
        &self,
        session_id: &str,
        expected: Option<&Arc<PtySession>>,
        reason: DestroyReason,
    ) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(session_id) {
                Some(current) if expected.map_or(true, |e| Arc::ptr_eq(current, e)) => {
                    sessions.remove(session_id)
                }
                _ => None,
            }
        };
        let Some(session) = removed else {
            return false;
        };

        if !matches!(reason, DestroyReason::Exited(_)) {
            if let Err(e) = session.pty.kill() {
                debug!(session_id, error = %e, "kill on destroy");
            }
        }
        log_persistence_error("remove", self.store.remove(session_id).await);
        let _ = self.events_tx.send(SessionLifecycle::Destroyed {
            session_id: session_id.to_string(),
            reason,
        });
        info!(session_id, ?reason, "session destroyed");
        true
    }

    /// Pump PTY output into the session's broadcast channel from a blocking
    /// task; on EOF, emit the exit event and self-destroy the session.
    fn spawn_output_pump(self: &Arc<Self>, session: Arc<PtySession>, reader: Box<dyn Read + Send>) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let sess = session.clone();
            let pumped = tokio::task::spawn_blocking(move || {
                let mut reader = reader;
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            sess.touch();
                            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                            // No receivers means no joined clients; output
                            // from a detached session is dropped.
                            let _ = sess.output_tx.send(SessionEvent::Output(chunk));
                        }
                    }
                }
                sess.pty.wait_code()
            })
            .await;

            let code = pumped.unwrap_or(-1);
            let _ = session.output_tx.send(SessionEvent::Exit(code));
            if let Some(registry) = registry.upgrade() {
                registry
                    .destroy_entry(&session.id, Some(&session), DestroyReason::Exited(code))
                    .await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn test_registry(
        idle_timeout: Duration,
    ) -> (
        Arc<SessionRegistry>,
        mpsc::UnboundedReceiver<SessionLifecycle>,
        tempfile::TempDir,
        Arc<SessionStore>,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SessionStore::new(dir.path().join("sessions.json")));
        let (registry, events) = SessionRegistry::new(store.clone(), idle_timeout, 100);
        (registry, events, dir, store)
    }

    fn cat_options() -> SessionOptions {
        SessionOptions {
            command: Some("cat".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_replaces_existing_process() {
        let (registry, _events, _dir, _store) = test_registry(Duration::from_secs(600));

        let first = registry.create("s1", cat_options()).await.expect("create");
        let mut first_rx = first.subscribe();
        registry.create("s1", cat_options()).await.expect("recreate");

        // The prior process must have been terminated.
        let exited = timeout(Duration::from_secs(5), async {
            loop {
                match first_rx.recv().await {
                    Ok(SessionEvent::Exit(_)) => break true,
                    Ok(_) => continue,
                    Err(_) => break false,
                }
            }
        })
        .await
        .expect("old session never exited");
        assert!(exited);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn exited_process_cleans_itself_up() {
        let (registry, mut events, _dir, store) = test_registry(Duration::from_secs(600));
        registry
            .create(
                "s1",
                SessionOptions {
                    command: Some("true".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("create");

        let destroyed = timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(SessionLifecycle::Destroyed { session_id, reason }) => {
                        break Some((session_id, reason))
                    }
                    Some(_) => continue,
                    None => break None,
                }
            }
        })
        .await
        .expect("no destroy event")
        .expect("event channel closed");

        assert_eq!(destroyed.0, "s1");
        assert!(matches!(destroyed.1, DestroyReason::Exited(_)));
        assert!(registry.get("s1").await.is_none());
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn execute_command_requires_live_session() {
        let (registry, _events, _dir, _store) = test_registry(Duration::from_secs(600));
        let err = registry
            .execute_command("nope", "echo hi")
            .await
            .expect_err("absent session");
        assert!(matches!(err, RelayError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn destroy_is_a_noop_on_absent_sessions() {
        let (registry, _events, _dir, store) = test_registry(Duration::from_secs(600));
        assert!(!registry.destroy("nope").await);

        registry.create("s1", cat_options()).await.expect("create");
        assert_eq!(store.load().await.expect("load").len(), 1);

        assert!(registry.destroy("s1").await);
        assert!(!registry.destroy("s1").await);
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn sweep_respects_recent_activity() {
        let (registry, _events, _dir, _store) = test_registry(Duration::from_millis(500));
        registry.create("s1", cat_options()).await.expect("create");

        sleep(Duration::from_millis(300)).await;
        registry
            .write_raw("s1", b"x".to_vec())
            .await
            .expect("write");
        sleep(Duration::from_millis(300)).await;

        // Touched at ~300ms; only ~300ms idle now even though the session
        // is older than the timeout.
        assert!(registry.sweep().await.is_empty());
        assert!(registry.get("s1").await.is_some());

        sleep(Duration::from_millis(700)).await;
        assert_eq!(registry.sweep().await, vec!["s1".to_string()]);
        assert!(registry.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn restore_recreates_fresh_and_discards_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SessionStore::new(dir.path().join("sessions.json")));
        let cwd = std::env::current_dir().expect("cwd");
        let env: HashMap<String, String> = std::env::vars().collect();

        let now = now_millis();
        store
            .upsert(PersistedSessionRecord {
                session_id: "fresh".into(),
                created_at: now.saturating_sub(10_000),
                last_activity: now.saturating_sub(5_000),
                cwd: cwd.clone(),
                env: env.clone(),
                cols: 100,
                rows: 40,
            })
            .await
            .expect("upsert");
        store
            .upsert(PersistedSessionRecord {
                session_id: "stale".into(),
                created_at: now.saturating_sub(200_000),
                last_activity: now.saturating_sub(120_000),
                cwd: cwd.clone(),
                env,
                cols: 80,
                rows: 24,
            })
            .await
            .expect("upsert");

        let (registry, _events) =
            SessionRegistry::new(store.clone(), Duration::from_secs(30), 100);
        let restored = registry.restore().await.expect("restore");
        assert_eq!(restored, 1);

        let session = registry.get("fresh").await.expect("recreated");
        assert_eq!((session.cols, session.rows), (100, 40));
        assert_eq!(session.cwd, cwd);
        assert!(registry.get("stale").await.is_none());

        let remaining = store.load().await.expect("load");
        assert!(remaining.iter().all(|r| r.session_id != "stale"));
    }
}
