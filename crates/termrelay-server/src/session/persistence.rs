//! Durable session metadata store.
//!
//! Persists one record per live session (identity, timestamps, geometry,
//! cwd, environment) as a single JSON array at a well-known path, so
//! sessions can be respawned after a server restart. Terminal content is
//! never persisted.
//!
//! The file is rewritten wholesale on every mutation; all read-modify-write
//! cycles run under one mutex so concurrent sessions cannot lose each
//! other's updates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use termrelay_core::{RelayError, RelayResult};

/// Durable snapshot of one session's metadata. Timestamps are Unix epoch
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSessionRecord {
    pub session_id: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// File-backed store for [`PersistedSessionRecord`]s.
pub struct SessionStore {
    path: PathBuf,
    /// Serializes whole-file read-modify-write cycles.
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all records. A missing file is an empty store, not an error.
    pub async fn load(&self) -> RelayResult<Vec<PersistedSessionRecord>> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        run_blocking(move || read_records(&path)).await
    }

    /// Insert or replace the record for `record.session_id`.
    pub async fn upsert(&self, record: PersistedSessionRecord) -> RelayResult<()> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        run_blocking(move || {
            let mut records = read_records(&path)?;
            records.retain(|r| r.session_id != record.session_id);
            records.push(record);
            write_records(&path, &records)
        })
        .await
    }

    /// Replace the records for every session in `updates` in one rewrite.
    pub async fn upsert_all(&self, updates: Vec<PersistedSessionRecord>) -> RelayResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        run_blocking(move || {
            let mut records = read_records(&path)?;
            records.retain(|r| !updates.iter().any(|u| u.session_id == r.session_id));
            records.extend(updates);
            write_records(&path, &records)
        })
        .await
    }

    /// Remove the record for `session_id`, if present.
    pub async fn remove(&self, session_id: &str) -> RelayResult<()> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        let session_id = session_id.to_string();
        run_blocking(move || {
            let mut records = read_records(&path)?;
            let before = records.len();
            records.retain(|r| r.session_id != session_id);
            if records.len() != before {
                write_records(&path, &records)?;
                debug!(session_id = %session_id, "persisted record removed");
            }
            Ok(())
        })
        .await
    }
}

/// File I/O stays off the async worker threads; the caller already holds
/// the store mutex.
async fn run_blocking<T, F>(f: F) -> RelayResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> RelayResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RelayError::Persistence(format!("join error: {e}")))?
}

fn read_records(path: &Path) -> RelayResult<Vec<PersistedSessionRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Persistence(format!("read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| RelayError::Persistence(format!("parse {}: {e}", path.display())))
}

fn write_records(path: &Path, records: &[PersistedSessionRecord]) -> RelayResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RelayError::Persistence(format!("create {}: {e}", parent.display())))?;
    }
    let content = serde_json::to_string_pretty(records)
        .map_err(|e| RelayError::Persistence(e.to_string()))?;
    std::fs::write(path, content)
        .map_err(|e| RelayError::Persistence(format!("write {}: {e}", path.display())))
}

/// Log-and-continue helper for persistence failures: durability degrades,
/// availability does not.
pub fn log_persistence_error(context: &str, result: RelayResult<()>) {
    if let Err(e) = result {
        warn!(context, error = %e, "session persistence failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, last_activity: u64) -> PersistedSessionRecord {
        PersistedSessionRecord {
            session_id: id.into(),
            created_at: 1_000,
            last_activity,
            cwd: PathBuf::from("/tmp"),
            env: HashMap::from([("TERM".into(), "xterm-256color".into())]),
            cols: 80,
            rows: 24,
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path().join("sessions.json"));
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path().join("sessions.json"));

        store.upsert(record("s1", 10)).await.expect("upsert");
        store.upsert(record("s2", 20)).await.expect("upsert");
        store.upsert(record("s1", 30)).await.expect("upsert");

        let mut records = store.load().await.expect("load");
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].last_activity, 30);
        assert_eq!(records[1].session_id, "s2");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path().join("sessions.json"));

        store.upsert(record("s1", 10)).await.expect("upsert");
        store.remove("s1").await.expect("remove");
        store.remove("s1").await.expect("second remove");
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn records_round_trip_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path().join("sessions.json"));

        let rec = record("s1", 10);
        store.upsert(rec.clone()).await.expect("upsert");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded, vec![rec]);
    }

    #[tokio::test]
    async fn concurrent_upserts_do_not_lose_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = std::sync::Arc::new(SessionStore::new(dir.path().join("sessions.json")));

        let mut tasks = Vec::new();
        for i in 0..10u64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.upsert(record(&format!("s{i}"), i)).await
            }));
        }
        for task in tasks {
            task.await.expect("task").expect("upsert");
        }
        assert_eq!(store.load().await.expect("load").len(), 10);
    }

    #[tokio::test]
    async fn upsert_all_rewrites_in_one_pass() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path().join("sessions.json"));

        store.upsert(record("s1", 10)).await.expect("upsert");
        store
            .upsert_all(vec![record("s1", 99), record("s3", 5)])
            .await
            .expect("upsert_all");

        let mut records = store.load().await.expect("load");
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].last_activity, 99);
        assert_eq!(records[1].session_id, "s3");
    }
}
