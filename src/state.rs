//! In-memory session registry and handle types.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::time::{Duration, Instant};

use crate::error::{Result, SandboxError};
use crate::provider::RemoteSandbox;

/// A background command tracked for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandHandle {
    pub command_id: String,
    pub pid: u32,
    pub cmd: String,
    pub started_at: DateTime<Utc>,
}

/// Background commands of one session, keyed by command id.
pub type CommandMap = HashMap<String, CommandHandle>;

/// A live binding between a session and a connected remote sandbox.
///
/// The registry entry owns the connection; dropping the last `Arc` releases it.
pub struct SessionHandle {
    pub session_id: String,
    sandbox: Arc<dyn RemoteSandbox>,
    created_at: Instant,
    last_accessed: Mutex<Instant>,
    expires_at: Mutex<DateTime<Utc>>,
    commands: Mutex<CommandMap>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn new(
        session_id: impl Into<String>,
        sandbox: Arc<dyn RemoteSandbox>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id: session_id.into(),
            sandbox,
            created_at: now,
            last_accessed: Mutex::new(now),
            expires_at: Mutex::new(expires_at),
            commands: Mutex::new(HashMap::new()),
        }
    }

    pub fn sandbox(&self) -> &Arc<dyn RemoteSandbox> {
        &self.sandbox
    }

    pub fn sandbox_id(&self) -> &str {
        self.sandbox.id()
    }

    pub async fn touch(&self) {
        *self.last_accessed.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_accessed.lock().await.elapsed()
    }

    pub async fn expires_at(&self) -> DateTime<Utc> {
        *self.expires_at.lock().await
    }

    pub async fn set_expires_at(&self, at: DateTime<Utc>) {
        *self.expires_at.lock().await = at;
    }

    /// Lock the command map. Holding the guard serializes every mutation of
    /// this session's background commands, including reaper pruning.
    pub async fn commands(&self) -> MutexGuard<'_, CommandMap> {
        self.commands.lock().await
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            sandbox_id: self.sandbox_id().to_string(),
            expires_at: self.expires_at().await,
            age_secs: self.created_at.elapsed().as_secs(),
            idle_secs: self.idle_for().await.as_secs(),
            commands: self.commands.lock().await.len(),
        }
    }
}

/// Snapshot of a handle for local listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub sandbox_id: String,
    pub expires_at: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub commands: usize,
}

enum Slot {
    /// Reserved by an in-flight `create`.
    Pending,
    Live(Arc<SessionHandle>),
}

/// Process-local map of session id to handle.
///
/// Owned by the session manager; there is no global instance.
#[derive(Default)]
pub struct SessionRegistry {
    slots: RwLock<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `session_id` for creation. Fails with `AlreadyExists`
    /// if the session is live or another create holds the reservation.
    pub async fn reserve(&self, session_id: &str) -> Result<()> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(session_id) {
            return Err(SandboxError::AlreadyExists(session_id.to_string()));
        }
        slots.insert(session_id.to_string(), Slot::Pending);
        Ok(())
    }

    /// Complete a reservation with the live handle.
    pub async fn fill(&self, handle: Arc<SessionHandle>) {
        self.slots
            .write()
            .await
            .insert(handle.session_id.clone(), Slot::Live(handle));
    }

    /// Drop a reservation that never became live. Live entries are untouched.
    pub async fn release(&self, session_id: &str) {
        let mut slots = self.slots.write().await;
        if matches!(slots.get(session_id), Some(Slot::Pending)) {
            slots.remove(session_id);
        }
    }

    /// Insert a reconnected handle unless the session is already occupied,
    /// in which case the existing live handle wins and is returned.
    pub async fn insert_if_absent(
        &self,
        handle: Arc<SessionHandle>,
    ) -> Option<Arc<SessionHandle>> {
        let mut slots = self.slots.write().await;
        match slots.get(&handle.session_id) {
            Some(Slot::Live(existing)) => Some(existing.clone()),
            Some(Slot::Pending) => None,
            None => {
                slots.insert(handle.session_id.clone(), Slot::Live(handle.clone()));
                Some(handle)
            }
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        match self.slots.read().await.get(session_id) {
            Some(Slot::Live(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub async fn find_by_sandbox(&self, sandbox_id: &str) -> Option<Arc<SessionHandle>> {
        self.slots.read().await.values().find_map(|slot| match slot {
            Slot::Live(handle) if handle.sandbox_id() == sandbox_id => Some(handle.clone()),
            _ => None,
        })
    }

    /// Remove a live handle. Pending reservations are left alone.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let mut slots = self.slots.write().await;
        match slots.get(session_id) {
            Some(Slot::Live(_)) => match slots.remove(session_id) {
                Some(Slot::Live(handle)) => Some(handle),
                _ => None,
            },
            _ => None,
        }
    }

    /// Remove `session_id` only if it still maps to `handle`.
    pub async fn remove_if_same(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut slots = self.slots.write().await;
        let same = matches!(
            slots.get(&handle.session_id),
            Some(Slot::Live(current)) if Arc::ptr_eq(current, handle)
        );
        if same {
            slots.remove(&handle.session_id);
        }
        same
    }

    /// All live handles.
    pub async fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.slots
            .read()
            .await
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(handle) => Some(handle.clone()),
                Slot::Pending => None,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.handles().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
