//! Freshness-bounded snapshot caches of upstream state.
//!
//! Each cache holds the last-known-good view of one upstream domain in a
//! [`SnapshotCell`]: timestamped, mirrored to a JSON document on disk after
//! every successful rebuild, and reloaded from that document at startup
//! when still within its TTL. Rebuild failures leave the previous snapshot
//! intact — stale-but-available beats empty.
//!
//! Concurrent rebuild triggers for the same cell collapse into one
//! upstream round-trip: the rebuild gate serializes them, and a caller that
//! waited on the gate skips its own rebuild when the snapshot advanced
//! while it waited.

pub mod environments;
pub mod projects;
pub mod templates;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::error::SnapshotError;

/// TTL for the environments snapshot.
pub const ENVIRONMENTS_TTL: Duration = Duration::from_secs(60);
/// TTL for the secrets-projects snapshot.
pub const PROJECTS_TTL: Duration = Duration::from_secs(300);
/// TTL for the template catalog.
pub const TEMPLATES_TTL: Duration = Duration::from_secs(300);

/// A timestamped view of one upstream domain.
///
/// Serialized form is the persisted document: `timestamp` plus the domain
/// payload flattened beside it.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct Snapshot<T> {
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self {
            timestamp: None,
            data: T::default(),
        }
    }
}

/// One cached snapshot with TTL, durable mirror and single-flight rebuild.
pub struct SnapshotCell<T> {
    name: &'static str,
    ttl: Duration,
    rebuild_deadline: Duration,
    path: PathBuf,
    inner: RwLock<Snapshot<T>>,
    gate: Mutex<()>,
}

impl<T> SnapshotCell<T>
where
    T: Clone + Default + Serialize + DeserializeOwned,
{
    pub fn new(
        name: &'static str,
        ttl: Duration,
        rebuild_deadline: Duration,
        state_dir: &Path,
    ) -> Self {
        Self {
            name,
            ttl,
            rebuild_deadline,
            path: state_dir.join(format!("{}.json", name)),
            inner: RwLock::new(Snapshot::default()),
            gate: Mutex::new(()),
        }
    }

    /// Clone out the current snapshot. Never fails; may be empty or stale.
    pub async fn read(&self) -> Snapshot<T> {
        self.inner.read().await.clone()
    }

    pub async fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.timestamp
    }

    fn within_ttl(&self, timestamp: Option<DateTime<Utc>>) -> bool {
        match timestamp {
            Some(ts) => {
                let age = Utc::now().signed_duration_since(ts);
                age >= chrono::TimeDelta::zero()
                    && age.to_std().map(|age| age < self.ttl).unwrap_or(false)
            }
            None => false,
        }
    }

    /// Ensure the snapshot is fresh, rebuilding when forced or expired.
    ///
    /// `rebuild` produces the new payload plus the raw upstream value it
    /// was built from; the raw value is handed back so callers can expose
    /// it. Returns `Ok(None)` when no rebuild was needed — including when
    /// another caller rebuilt the snapshot while this one waited on the
    /// gate.
    pub async fn ensure<F, Fut>(
        &self,
        force: bool,
        rebuild: F,
    ) -> Result<Option<Value>, SnapshotError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Value), SnapshotError>>,
    {
        let observed = self.timestamp().await;
        if !force && self.within_ttl(observed) {
            return Ok(None);
        }

        let _gate = self.gate.lock().await;

        let current = self.timestamp().await;
        if current != observed {
            // Someone rebuilt while we waited; their result is fresh enough
            // even for a forced caller.
            return Ok(None);
        }
        if !force && self.within_ttl(current) {
            return Ok(None);
        }

        let deadline = self.rebuild_deadline;
        let (data, raw) = tokio::time::timeout(deadline, rebuild())
            .await
            .map_err(|_| SnapshotError::DeadlineExceeded {
                seconds: deadline.as_secs(),
            })??;

        self.store(data).await?;
        Ok(Some(raw))
    }

    /// Stamp and adopt a freshly built payload, then mirror it to disk.
    pub async fn store(&self, data: T) -> Result<DateTime<Utc>, SnapshotError> {
        let stamped = Snapshot {
            timestamp: Some(Utc::now()),
            data,
        };

        {
            let mut inner = self.inner.write().await;
            *inner = stamped.clone();
        }

        self.persist(&stamped).await?;
        Ok(stamped.timestamp.unwrap_or_else(Utc::now))
    }

    async fn persist(&self, snapshot: &Snapshot<T>) -> Result<(), SnapshotError> {
        let persist_err = |source: std::io::Error| SnapshotError::Persist {
            name: self.name.to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
        }
        let json = serde_json::to_string_pretty(snapshot).map_err(|e| {
            persist_err(std::io::Error::other(e))
        })?;
        tokio::fs::write(&self.path, json).await.map_err(persist_err)
    }

    /// Startup path: adopt the persisted document when it is still within
    /// the TTL. Returns `true` when a snapshot was restored.
    ///
    /// The documents are advisory caches — a missing, corrupt or expired
    /// file just means the caller should rebuild.
    pub async fn restore(&self) -> bool {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        let snapshot: Snapshot<T> = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(name = self.name, error = %err, "ignoring corrupt snapshot document");
                return false;
            }
        };

        if !self.within_ttl(snapshot.timestamp) {
            tracing::debug!(name = self.name, "persisted snapshot expired, will rebuild");
            return false;
        }

        let mut inner = self.inner.write().await;
        *inner = snapshot;
        tracing::info!(name = self.name, "restored snapshot from disk");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Payload {
        items: Vec<String>,
    }

    fn cell(dir: &Path) -> SnapshotCell<Payload> {
        SnapshotCell::new("test", Duration::from_secs(60), Duration::from_secs(5), dir)
    }

    #[tokio::test]
    async fn test_ensure_skips_rebuild_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cell = cell(dir.path());
        let calls = AtomicUsize::new(0);

        let rebuild = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok((Payload { items: vec!["a".into()] }, json!([])))
        };
        assert!(cell.ensure(false, rebuild).await.unwrap().is_some());

        let rebuild = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok((Payload::default(), json!([])))
        };
        assert!(cell.ensure(false, rebuild).await.unwrap().is_none());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cell.read().await.data.items, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_ensure_force_always_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let cell = cell(dir.path());
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let rebuild = || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok((Payload::default(), json!([])))
            };
            assert!(cell.ensure(true, rebuild).await.unwrap().is_some());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rebuild_failure_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cell = cell(dir.path());

        cell.store(Payload { items: vec!["keep".into()] }).await.unwrap();
        let result = cell
            .ensure(true, || async {
                Err::<(Payload, Value), _>(SnapshotError::DeadlineExceeded { seconds: 0 })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cell.read().await.data.items, vec!["keep".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_force_collapses_to_one_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let cell = Arc::new(cell(dir.path()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cell.ensure(true, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok((Payload::default(), json!([])))
                })
                .await
                .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restore_adopts_fresh_document() {
        let dir = tempfile::tempdir().unwrap();
        let writer = cell(dir.path());
        writer.store(Payload { items: vec!["persisted".into()] }).await.unwrap();

        let reader = cell(dir.path());
        assert!(reader.restore().await);
        assert_eq!(reader.read().await.data.items, vec!["persisted".to_string()]);
    }

    #[tokio::test]
    async fn test_restore_rejects_expired_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.json");
        let stale = json!({
            "timestamp": "2020-01-01T00:00:00Z",
            "items": ["old"],
        });
        tokio::fs::write(&path, stale.to_string()).await.unwrap();

        let cell = cell(dir.path());
        assert!(!cell.restore().await);
        assert!(cell.read().await.timestamp.is_none());
    }

    #[tokio::test]
    async fn test_restore_tolerates_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let cell = cell(dir.path());
        assert!(!cell.restore().await);

        tokio::fs::write(dir.path().join("test.json"), "{ not json")
            .await
            .unwrap();
        assert!(!cell.restore().await);
    }
}
