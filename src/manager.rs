//! Sandbox lifecycle: create, kill, timeout renewal, reconnection and
//! startup reconciliation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_TIMEOUT_MINUTES;
use crate::error::{Result, SandboxError};
use crate::executor::{merge_envs, CommandExecutor, RunOptions};
use crate::provider::{normalize_sandbox_id, CreateSandbox, SandboxInfo, SandboxProvider};
use crate::records::{RecordStore, SandboxRecord};
use crate::state::{SessionHandle, SessionInfo, SessionRegistry};

/// Settings that shape every sandbox the manager creates.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub template: String,
    pub default_timeout_minutes: u64,
    pub hidden_envs: HashMap<String, String>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            template: "base".to_string(),
            default_timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            hidden_envs: HashMap::new(),
        }
    }
}

/// Converts a caller timeout in minutes to the remote TTL.
pub fn timeout_from_minutes(minutes: u64) -> Duration {
    Duration::from_millis(minutes.saturating_mul(60_000))
}

fn expiry_after(minutes: u64) -> DateTime<Utc> {
    i64::try_from(minutes)
        .ok()
        .and_then(chrono::Duration::try_minutes)
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSandbox {
    pub session_id: String,
    pub sandbox_id: String,
    pub user: Option<String>,
    pub current_directory: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillReport {
    pub session_id: Option<String>,
    pub sandbox_id: Option<String>,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutUpdated {
    pub session_id: String,
    pub sandbox_id: String,
    pub timeout_minutes: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub kept: usize,
    pub dropped: usize,
}

/// Owns the session registry and mediates every lifecycle change between
/// it, the record store and the remote service.
pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    records: Arc<dyn RecordStore>,
    registry: SessionRegistry,
    executor: CommandExecutor,
    options: ManagerOptions,
}

impl SandboxManager {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        records: Arc<dyn RecordStore>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            provider,
            records,
            registry: SessionRegistry::new(),
            executor: CommandExecutor::new(options.hidden_envs.clone()),
            options,
        }
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Create a sandbox for `session_id`.
    ///
    /// The session slot is reserved before any remote call, so concurrent
    /// creates for one session produce exactly one sandbox.
    pub async fn create(
        &self,
        session_id: &str,
        timeout_minutes: Option<u64>,
        envs: &HashMap<String, String>,
    ) -> Result<CreatedSandbox> {
        self.registry.reserve(session_id).await?;

        let minutes = timeout_minutes.unwrap_or(self.options.default_timeout_minutes);
        let request = CreateSandbox {
            template: self.options.template.clone(),
            timeout: timeout_from_minutes(minutes),
            envs: merge_envs(&self.options.hidden_envs, envs),
            metadata: HashMap::from([("sessionId".to_string(), session_id.to_string())]),
        };
        let sandbox = match self.provider.create(&request).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.registry.release(session_id).await;
                warn!(session_id, error = %e, "sandbox creation failed");
                return Err(e);
            }
        };

        let sandbox_id = sandbox.id().to_string();
        let expires_at = expiry_after(minutes);
        let record = SandboxRecord {
            sandbox_id: sandbox_id.clone(),
            session_id: session_id.to_string(),
            expired_at: expires_at,
        };
        if let Err(e) = self.records.insert(record).await {
            warn!(
                session_id,
                sandbox_id = %sandbox_id,
                error = %e,
                "failed to persist sandbox record"
            );
        }

        let handle = Arc::new(SessionHandle::new(session_id, sandbox, expires_at));
        self.registry.fill(handle.clone()).await;
        info!(session_id, sandbox_id = %sandbox_id, timeout_minutes = minutes, "sandbox created");

        let (user, current_directory) = self.probe(&handle).await;
        Ok(CreatedSandbox {
            session_id: session_id.to_string(),
            sandbox_id,
            user,
            current_directory,
            expires_at,
        })
    }

    /// Run `whoami` and `pwd` so the caller learns its execution context.
    /// Probe failures are logged and leave the field empty.
    async fn probe(&self, handle: &SessionHandle) -> (Option<String>, Option<String>) {
        let whoami = RunOptions {
            cmd: "whoami".to_string(),
            ..RunOptions::default()
        };
        let pwd = RunOptions {
            cmd: "pwd".to_string(),
            ..RunOptions::default()
        };
        let (user, dir) = futures_util::future::join(
            self.executor.run_foreground(handle, &whoami),
            self.executor.run_foreground(handle, &pwd),
        )
        .await;

        let pick = |what: &str, result: Result<crate::provider::CommandOutput>| match result {
            Ok(out) if out.exit_code == 0 => Some(out.stdout.trim().to_string()),
            Ok(out) => {
                warn!(
                    session_id = %handle.session_id,
                    probe = what,
                    exit_code = out.exit_code,
                    "probe failed"
                );
                None
            }
            Err(e) => {
                warn!(session_id = %handle.session_id, probe = what, error = %e, "probe failed");
                None
            }
        };
        (pick("whoami", user), pick("pwd", dir))
    }

    /// Kill a sandbox and evict all local state for it.
    ///
    /// An explicit `sandbox_id` takes precedence over the sandbox bound to
    /// `session_id`. The session is only evicted when it is bound to the
    /// killed sandbox. Remote failures never propagate: the report carries
    /// `success: false` and local state is evicted anyway.
    pub async fn kill(
        &self,
        session_id: Option<&str>,
        sandbox_id: Option<&str>,
    ) -> Result<KillReport> {
        let explicit = sandbox_id
            .map(normalize_sandbox_id)
            .filter(|id| !id.is_empty())
            .map(String::from);
        let bound = match session_id {
            Some(session) => self.sandbox_for_session(session).await,
            None => None,
        };
        let target = match (explicit, session_id) {
            (Some(id), _) => Some(id),
            (None, Some(_)) => bound.clone(),
            (None, None) => return Err(SandboxError::MissingParameter("sessionId or sandboxId")),
        };

        let Some(target) = target else {
            let session = session_id.unwrap_or_default();
            self.evict_session(session).await;
            return Ok(KillReport {
                session_id: session_id.map(String::from),
                sandbox_id: None,
                success: false,
                message: format!("no sandbox found for session {session}"),
            });
        };

        let outcome = match self.provider.connect(&target).await {
            Ok(_) => self.provider.kill(&target).await,
            Err(e) => Err(e),
        };

        if let Some(session) = session_id {
            if bound.as_deref().map_or(true, |id| id == target) {
                self.evict_session(session).await;
            } else {
                debug!(
                    session_id = session,
                    sandbox_id = %target,
                    "session is bound to another sandbox, keeping it"
                );
            }
        }
        self.evict_sandbox(&target).await;

        let (success, message) = match outcome {
            Ok(()) => {
                info!(sandbox_id = %target, "sandbox killed");
                (true, format!("sandbox {target} killed"))
            }
            Err(e) => {
                warn!(sandbox_id = %target, error = %e, "kill failed, treating sandbox as gone");
                (false, format!("sandbox {target} could not be killed: {e}"))
            }
        };
        Ok(KillReport {
            session_id: session_id.map(String::from),
            sandbox_id: Some(target),
            success,
            message,
        })
    }

    async fn sandbox_for_session(&self, session_id: &str) -> Option<String> {
        if let Some(handle) = self.registry.get(session_id).await {
            return Some(handle.sandbox_id().to_string());
        }
        match self.records.get(session_id).await {
            Ok(record) => record.map(|r| normalize_sandbox_id(&r.sandbox_id).to_string()),
            Err(e) => {
                warn!(session_id, error = %e, "record lookup failed");
                None
            }
        }
    }

    async fn evict_session(&self, session_id: &str) {
        if let Some(handle) = self.registry.remove(session_id).await {
            handle.commands().await.clear();
        }
        if let Err(e) = self.records.remove(session_id).await {
            warn!(session_id, error = %e, "failed to delete sandbox record");
        }
    }

    async fn evict_sandbox(&self, sandbox_id: &str) {
        if let Some(handle) = self.registry.find_by_sandbox(sandbox_id).await {
            if self.registry.remove_if_same(&handle).await {
                handle.commands().await.clear();
            }
        }
        if let Err(e) = self.records.remove_by_sandbox(sandbox_id).await {
            warn!(sandbox_id, error = %e, "failed to delete sandbox record");
        }
    }

    /// Replace the session's sandbox deadline with `now + timeout_minutes`.
    pub async fn set_timeout(
        &self,
        session_id: &str,
        timeout_minutes: u64,
    ) -> Result<TimeoutUpdated> {
        let handle = self.resolve(session_id).await?;
        self.provider
            .set_timeout(handle.sandbox_id(), timeout_from_minutes(timeout_minutes))
            .await?;

        let expires_at = expiry_after(timeout_minutes);
        handle.set_expires_at(expires_at).await;
        handle.touch().await;
        match self.records.set_expiry(session_id, expires_at).await {
            Ok(true) => {}
            Ok(false) => {
                let record = SandboxRecord {
                    sandbox_id: handle.sandbox_id().to_string(),
                    session_id: session_id.to_string(),
                    expired_at: expires_at,
                };
                if let Err(e) = self.records.insert(record).await {
                    warn!(session_id, error = %e, "failed to persist sandbox record");
                }
            }
            Err(e) => warn!(session_id, error = %e, "failed to update sandbox record"),
        }
        info!(
            session_id,
            sandbox_id = %handle.sandbox_id(),
            timeout_minutes,
            "sandbox timeout replaced"
        );

        Ok(TimeoutUpdated {
            session_id: session_id.to_string(),
            sandbox_id: handle.sandbox_id().to_string(),
            timeout_minutes,
            expires_at,
        })
    }

    /// Live sandboxes as the remote service sees them.
    pub async fn list_sandboxes(&self) -> Result<Vec<SandboxInfo>> {
        self.provider.list().await
    }

    /// Local view of the registry.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for handle in self.registry.handles().await {
            infos.push(handle.info().await);
        }
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    /// Find the live handle for `session_id`, reconnecting through the record
    /// store when this process has no handle (e.g. after a restart).
    pub async fn resolve(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        if let Some(handle) = self.registry.get(session_id).await {
            return Ok(handle);
        }

        let not_found = || SandboxError::NotFound(format!("sandbox for session {session_id}"));
        let record = self.records.get(session_id).await?.ok_or_else(not_found)?;
        if record.is_expired(Utc::now()) {
            debug!(session_id, sandbox_id = %record.sandbox_id, "stored sandbox expired");
            self.drop_record(session_id).await;
            return Err(not_found());
        }

        let sandbox = match self.provider.connect(&record.sandbox_id).await {
            Ok(sandbox) => sandbox,
            Err(SandboxError::NotFound(_)) => {
                debug!(session_id, sandbox_id = %record.sandbox_id, "stored sandbox is gone");
                self.drop_record(session_id).await;
                return Err(not_found());
            }
            Err(e) => return Err(e),
        };

        let handle = Arc::new(SessionHandle::new(session_id, sandbox, record.expired_at));
        let handle = self
            .registry
            .insert_if_absent(handle)
            .await
            .ok_or_else(not_found)?;
        info!(session_id, sandbox_id = %handle.sandbox_id(), "reconnected session");
        Ok(handle)
    }

    async fn drop_record(&self, session_id: &str) {
        if let Err(e) = self.records.remove(session_id).await {
            warn!(session_id, error = %e, "failed to delete sandbox record");
        }
    }

    /// Prune records whose sandbox is expired or no longer listed remotely.
    /// The remote service is authoritative; records are only a cache.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let live: HashSet<String> = self
            .provider
            .list()
            .await?
            .into_iter()
            .map(|s| s.sandbox_id)
            .collect();
        let now = Utc::now();

        let mut report = ReconcileReport::default();
        for record in self.records.list().await? {
            let id = normalize_sandbox_id(&record.sandbox_id);
            if record.is_expired(now) || !live.contains(id) {
                debug!(session_id = %record.session_id, sandbox_id = %id, "dropping stale record");
                self.records.remove(&record.session_id).await?;
                report.dropped += 1;
            } else {
                report.kept += 1;
            }
        }
        info!(kept = report.kept, dropped = report.dropped, "sandbox records reconciled");
        Ok(report)
    }

    /// Best-effort remote kill and registry removal of one handle. Used by
    /// the idle reaper; the record store is left to TTL expiry and
    /// reconciliation.
    pub async fn evict_idle(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut commands = handle.commands().await;
        if let Err(e) = self.provider.kill(handle.sandbox_id()).await {
            warn!(
                session_id = %handle.session_id,
                sandbox_id = %handle.sandbox_id(),
                error = %e,
                "idle sandbox kill failed"
            );
        }
        commands.clear();
        drop(commands);
        self.registry.remove_if_same(handle).await
    }
}
