//! Durable mapping from session id to remote sandbox metadata.
//!
//! The record store is a cache of what the remote service knows: it lets a
//! restarted process find the sandbox that belonged to a session. Startup
//! reconciliation prunes it against the remote list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// A persisted session-to-sandbox binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRecord {
    pub sandbox_id: String,
    pub session_id: String,
    pub expired_at: DateTime<Utc>,
}

impl SandboxRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expired_at
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<SandboxRecord>>;

    async fn find_by_sandbox(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>>;

    /// Insert or replace the record for `record.session_id`. Any other record
    /// pointing at the same sandbox is dropped, keeping both keys unique.
    async fn insert(&self, record: SandboxRecord) -> Result<()>;

    /// Returns `false` if no record exists for the session.
    async fn set_expiry(&self, session_id: &str, expired_at: DateTime<Utc>) -> Result<bool>;

    async fn remove(&self, session_id: &str) -> Result<Option<SandboxRecord>>;

    async fn remove_by_sandbox(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>>;

    /// All records sorted by session id.
    async fn list(&self) -> Result<Vec<SandboxRecord>>;
}

#[derive(Debug, Default)]
struct RecordMap {
    entries: HashMap<String, SandboxRecord>,
}

impl RecordMap {
    fn find_by_sandbox(&self, sandbox_id: &str) -> Option<&SandboxRecord> {
        self.entries.values().find(|r| r.sandbox_id == sandbox_id)
    }

    fn insert(&mut self, record: SandboxRecord) {
        self.entries
            .retain(|key, r| key == &record.session_id || r.sandbox_id != record.sandbox_id);
        self.entries.insert(record.session_id.clone(), record);
    }

    fn set_expiry(&mut self, session_id: &str, expired_at: DateTime<Utc>) -> bool {
        match self.entries.get_mut(session_id) {
            Some(record) => {
                record.expired_at = expired_at;
                true
            }
            None => false,
        }
    }

    fn remove_by_sandbox(&mut self, sandbox_id: &str) -> Option<SandboxRecord> {
        let key = self.find_by_sandbox(sandbox_id)?.session_id.clone();
        self.entries.remove(&key)
    }

    fn list(&self) -> Vec<SandboxRecord> {
        let mut records: Vec<_> = self.entries.values().cloned().collect();
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        records
    }
}

/// Process-local store. Used in tests and when no records path is configured.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    map: Mutex<RecordMap>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, session_id: &str) -> Result<Option<SandboxRecord>> {
        Ok(self.map.lock().await.entries.get(session_id).cloned())
    }

    async fn find_by_sandbox(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>> {
        Ok(self.map.lock().await.find_by_sandbox(sandbox_id).cloned())
    }

    async fn insert(&self, record: SandboxRecord) -> Result<()> {
        self.map.lock().await.insert(record);
        Ok(())
    }

    async fn set_expiry(&self, session_id: &str, expired_at: DateTime<Utc>) -> Result<bool> {
        Ok(self.map.lock().await.set_expiry(session_id, expired_at))
    }

    async fn remove(&self, session_id: &str) -> Result<Option<SandboxRecord>> {
        Ok(self.map.lock().await.entries.remove(session_id))
    }

    async fn remove_by_sandbox(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>> {
        Ok(self.map.lock().await.remove_by_sandbox(sandbox_id))
    }

    async fn list(&self) -> Result<Vec<SandboxRecord>> {
        Ok(self.map.lock().await.list())
    }
}

/// JSON file-backed store: one object keyed by session id, rewritten on
/// every mutation.
#[derive(Debug)]
pub struct JsonRecordStore {
    path: PathBuf,
    map: Mutex<RecordMap>,
}

impl JsonRecordStore {
    /// Load records from disk, or start empty if the file does not exist.
    /// A corrupt file is logged and treated as empty.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "unreadable sandbox records, starting empty"
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = entries.len(), "loaded sandbox records");
        Ok(Self {
            path,
            map: Mutex::new(RecordMap { entries }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, map: &RecordMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let data = serde_json::to_string_pretty(&map.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn get(&self, session_id: &str) -> Result<Option<SandboxRecord>> {
        Ok(self.map.lock().await.entries.get(session_id).cloned())
    }

    async fn find_by_sandbox(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>> {
        Ok(self.map.lock().await.find_by_sandbox(sandbox_id).cloned())
    }

    async fn insert(&self, record: SandboxRecord) -> Result<()> {
        let mut map = self.map.lock().await;
        map.insert(record);
        self.save(&map).await
    }

    async fn set_expiry(&self, session_id: &str, expired_at: DateTime<Utc>) -> Result<bool> {
        let mut map = self.map.lock().await;
        if !map.set_expiry(session_id, expired_at) {
            return Ok(false);
        }
        self.save(&map).await?;
        Ok(true)
    }

    async fn remove(&self, session_id: &str) -> Result<Option<SandboxRecord>> {
        let mut map = self.map.lock().await;
        let removed = map.entries.remove(session_id);
        if removed.is_some() {
            self.save(&map).await?;
        }
        Ok(removed)
    }

    async fn remove_by_sandbox(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>> {
        let mut map = self.map.lock().await;
        let removed = map.remove_by_sandbox(sandbox_id);
        if removed.is_some() {
            self.save(&map).await?;
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<SandboxRecord>> {
        Ok(self.map.lock().await.list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(session: &str, sandbox: &str) -> SandboxRecord {
        SandboxRecord {
            sandbox_id: sandbox.into(),
            session_id: session.into(),
            expired_at: Utc::now() + Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn insert_keeps_sandbox_id_unique() {
        let store = MemoryRecordStore::new();
        store.insert(record("s1", "sbx")).await.unwrap();
        store.insert(record("s2", "sbx")).await.unwrap();

        assert!(store.get("s1").await.unwrap().is_none());
        assert_eq!(store.find_by_sandbox("sbx").await.unwrap().unwrap().session_id, "s2");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_expiry_requires_existing_record() {
        let store = MemoryRecordStore::new();
        let at = Utc::now();
        assert!(!store.set_expiry("missing", at).await.unwrap());

        store.insert(record("s1", "a")).await.unwrap();
        assert!(store.set_expiry("s1", at).await.unwrap());
        assert_eq!(store.get("s1").await.unwrap().unwrap().expired_at, at);
    }

    #[tokio::test]
    async fn json_store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("records.json");

        let store = JsonRecordStore::load(&path).await.unwrap();
        store.insert(record("s1", "a")).await.unwrap();
        store.insert(record("s2", "b")).await.unwrap();
        store.remove_by_sandbox("a").await.unwrap();
        drop(store);

        let reloaded = JsonRecordStore::load(&path).await.unwrap();
        let records = reloaded.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_id, "s2");
        assert_eq!(records[0].sandbox_id, "b");
    }

    #[tokio::test]
    async fn json_store_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonRecordStore::load(&path).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn expiry_is_inclusive() {
        let r = record("s", "x");
        assert!(!r.is_expired(r.expired_at - Duration::seconds(1)));
        assert!(r.is_expired(r.expired_at));
    }
}
