#![allow(dead_code)]

//! In-memory sandbox service shared by the integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use sandbox_sessions::provider::{
    BackgroundCommand, CommandOutput, CommandRequest, CreateSandbox, ProcessInfo, SandboxInfo,
};
use sandbox_sessions::records::MemoryRecordStore;
use sandbox_sessions::{
    normalize_sandbox_id, ManagerOptions, RemoteSandbox, Result, SandboxError, SandboxManager,
    SandboxProvider,
};

pub const DOMAIN: &str = "fake.dev";

#[derive(Default)]
struct ProviderState {
    next_id: u32,
    sandboxes: HashMap<String, Arc<FakeSandbox>>,
    created: Vec<CreateSandbox>,
    killed: Vec<String>,
    timeouts: Vec<(String, Duration)>,
    fail_next_create: Option<SandboxError>,
    fail_kill: bool,
}

/// Fake control plane. Sandbox ids are `sbx1`, `sbx2`, ... and lookups
/// accept them with a client suffix (`sbx1-abc`).
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
    create_delay: Option<Duration>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every create sleeps first so concurrent callers overlap.
    pub fn with_create_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            create_delay: Some(delay),
            ..Self::default()
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_create(&self, err: SandboxError) {
        self.lock().fail_next_create = Some(err);
    }

    pub fn fail_kills(&self) {
        self.lock().fail_kill = true;
    }

    pub fn created(&self) -> Vec<CreateSandbox> {
        self.lock().created.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.lock().killed.clone()
    }

    pub fn timeouts(&self) -> Vec<(String, Duration)> {
        self.lock().timeouts.clone()
    }

    pub fn is_live(&self, sandbox_id: &str) -> bool {
        self.lock().sandboxes.contains_key(sandbox_id)
    }

    pub fn sandbox(&self, sandbox_id: &str) -> Arc<FakeSandbox> {
        self.lock().sandboxes[sandbox_id].clone()
    }

    /// Terminate a sandbox behind the manager's back.
    pub fn expire(&self, sandbox_id: &str) {
        if let Some(sandbox) = self.lock().sandboxes.remove(sandbox_id) {
            sandbox.lock().alive = false;
        }
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, request: &CreateSandbox) -> Result<Arc<dyn RemoteSandbox>> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if let Some(err) = state.fail_next_create.take() {
            return Err(err);
        }
        state.next_id += 1;
        let id = format!("sbx{}", state.next_id);
        let sandbox = Arc::new(FakeSandbox::new(&id, request.envs.clone()));
        state.sandboxes.insert(id, sandbox.clone());
        state.created.push(request.clone());
        Ok(sandbox as Arc<dyn RemoteSandbox>)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>> {
        let id = normalize_sandbox_id(sandbox_id);
        match self.lock().sandboxes.get(id) {
            Some(sandbox) => Ok(sandbox.clone() as Arc<dyn RemoteSandbox>),
            None => Err(SandboxError::NotFound(format!("sandbox {id}"))),
        }
    }

    async fn kill(&self, sandbox_id: &str) -> Result<()> {
        let id = normalize_sandbox_id(sandbox_id);
        let mut state = self.lock();
        if state.fail_kill {
            return Err(SandboxError::RemoteUnavailable("kill rejected".into()));
        }
        match state.sandboxes.remove(id) {
            Some(sandbox) => {
                sandbox.lock().alive = false;
                state.killed.push(id.to_string());
                Ok(())
            }
            None => Err(SandboxError::NotFound(format!("sandbox {id}"))),
        }
    }

    async fn set_timeout(&self, sandbox_id: &str, timeout: Duration) -> Result<()> {
        let id = normalize_sandbox_id(sandbox_id);
        let mut state = self.lock();
        if !state.sandboxes.contains_key(id) {
            return Err(SandboxError::NotFound(format!("sandbox {id}")));
        }
        state.timeouts.push((id.to_string(), timeout));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>> {
        let mut listed: Vec<SandboxInfo> = self
            .lock()
            .sandboxes
            .keys()
            .map(|id| SandboxInfo {
                sandbox_id: id.clone(),
                template_id: Some("base".into()),
                started_at: Utc::now(),
                end_at: None,
                status: "running".into(),
                metadata: HashMap::new(),
            })
            .collect();
        listed.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        Ok(listed)
    }
}

pub struct SandboxState {
    alive: bool,
    next_pid: u32,
    processes: HashMap<u32, String>,
    files: HashMap<String, Vec<u8>>,
    runs: Vec<CommandRequest>,
}

/// Fake data plane for one sandbox.
///
/// Foreground commands understand `whoami`, `pwd`, `echo ...` and
/// `exit N`; a command naming `no-such-package` fails with stderr, and
/// anything else succeeds with empty output.
pub struct FakeSandbox {
    id: String,
    envs: HashMap<String, String>,
    state: Mutex<SandboxState>,
}

impl FakeSandbox {
    fn new(id: &str, envs: HashMap<String, String>) -> Self {
        Self {
            id: id.to_string(),
            envs,
            state: Mutex::new(SandboxState {
                alive: true,
                next_pid: 100,
                processes: HashMap::new(),
                files: HashMap::new(),
                runs: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.lock().alive {
            Ok(())
        } else {
            Err(SandboxError::NotFound(format!("sandbox {}", self.id)))
        }
    }

    /// Environment the sandbox was created with.
    pub fn envs(&self) -> HashMap<String, String> {
        self.envs.clone()
    }

    /// Every command request received, foreground and background.
    pub fn runs(&self) -> Vec<CommandRequest> {
        self.lock().runs.clone()
    }

    /// Start a process that the session layer does not know about.
    pub fn start_untracked(&self, cmd: &str) -> u32 {
        let mut state = self.lock();
        state.next_pid += 1;
        let pid = state.next_pid;
        state.processes.insert(pid, cmd.to_string());
        pid
    }

    /// Let a process exit on its own.
    pub fn finish(&self, pid: u32) {
        self.lock().processes.remove(&pid);
    }

    pub fn running(&self) -> HashSet<u32> {
        self.lock().processes.keys().copied().collect()
    }
}

#[async_trait]
impl RemoteSandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput> {
        self.ensure_alive()?;
        self.lock().runs.push(request.clone());
        let cmd = request.cmd.trim();
        if cmd.contains("no-such-package") {
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: "ERROR: No matching distribution found\n".into(),
                exit_code: 1,
            });
        }
        let (stdout, exit_code) = match cmd {
            "whoami" => ("user\n".to_string(), 0),
            "pwd" => (
                format!("{}\n", request.cwd.as_deref().unwrap_or("/home/user")),
                0,
            ),
            _ if cmd.starts_with("echo ") => (format!("{}\n", &cmd[5..]), 0),
            _ if cmd.starts_with("exit ") => (String::new(), cmd[5..].parse().unwrap_or(1)),
            _ => (String::new(), 0),
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code,
        })
    }

    async fn spawn(&self, request: &CommandRequest) -> Result<BackgroundCommand> {
        self.ensure_alive()?;
        self.lock().runs.push(request.clone());
        let pid = self.start_untracked(&request.cmd);
        Ok(BackgroundCommand {
            command_id: format!("cmd-{pid}"),
            pid,
        })
    }

    async fn kill_process(&self, pid: u32) -> Result<bool> {
        self.ensure_alive()?;
        Ok(self.lock().processes.remove(&pid).is_some())
    }

    async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        self.ensure_alive()?;
        let mut processes: Vec<ProcessInfo> = self
            .lock()
            .processes
            .iter()
            .map(|(pid, cmd)| ProcessInfo {
                pid: *pid,
                cmd: cmd.clone(),
                args: Vec::new(),
                cwd: Some("/home/user".into()),
                tag: None,
            })
            .collect();
        processes.sort_by_key(|p| p.pid);
        Ok(processes)
    }

    async fn read_file(&self, path: &str, _user: Option<&str>) -> Result<Vec<u8>> {
        self.ensure_alive()?;
        self.lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(format!("file {path}")))
    }

    async fn write_file(&self, path: &str, content: &[u8], _user: Option<&str>) -> Result<()> {
        self.ensure_alive()?;
        self.lock().files.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    fn download_url(&self, path: &str, _user: Option<&str>) -> Result<String> {
        Ok(format!("https://49983-{}.{DOMAIN}/files?path={path}", self.id))
    }

    fn host(&self, port: u16) -> String {
        format!("{port}-{}.{DOMAIN}", self.id)
    }
}

pub struct Harness {
    pub provider: Arc<FakeProvider>,
    pub records: Arc<MemoryRecordStore>,
    pub manager: Arc<SandboxManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(FakeProvider::new(), ManagerOptions::default())
    }

    pub fn with_options(provider: Arc<FakeProvider>, options: ManagerOptions) -> Self {
        let records = Arc::new(MemoryRecordStore::new());
        let manager = Arc::new(SandboxManager::new(
            provider.clone(),
            records.clone(),
            options,
        ));
        Self {
            provider,
            records,
            manager,
        }
    }

    /// A second manager over the same service and records, as after a
    /// process restart.
    pub fn restarted(&self) -> Arc<SandboxManager> {
        Arc::new(SandboxManager::new(
            self.provider.clone(),
            self.records.clone(),
            ManagerOptions::default(),
        ))
    }
}
