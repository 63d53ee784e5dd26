//! Process and file operations inside a live sandbox.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::provider::{CommandOutput, CommandRequest, ProcessInfo};
use crate::state::{CommandHandle, SessionHandle};

/// Merge caller variables over the operator's hidden ones. Caller wins on
/// key collision.
pub fn merge_envs(
    hidden: &HashMap<String, String>,
    caller: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = hidden.clone();
    merged.extend(caller.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Group `cmd` so every part of a compound command writes to `log_file`.
/// A trailing `&` is dropped since the command is spawned in the background.
pub fn redirect_to_log(cmd: &str, log_file: &str) -> String {
    let cmd = cmd.trim_end();
    let cmd = match cmd.strip_suffix('&') {
        Some(rest) if !rest.ends_with('&') => rest.trim_end(),
        _ => cmd,
    };
    format!("{{ {cmd}\n}} > {} 2>&1", shell_quote(log_file))
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Caller-facing options for running a command.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cmd: String,
    pub envs: HashMap<String, String>,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Package managers `install` knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ecosystem {
    Python,
    Node,
}

impl FromStr for Ecosystem {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Self::Python),
            "node" | "nodejs" | "javascript" | "js" | "typescript" | "ts" => Ok(Self::Node),
            other => Err(SandboxError::UnsupportedEcosystem(other.to_string())),
        }
    }
}

impl Ecosystem {
    fn install_command(self, packages: &[String]) -> String {
        let quoted: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
        match self {
            Self::Python => format!("pip install {}", quoted.join(" ")),
            Self::Node => format!("npm install {}", quoted.join(" ")),
        }
    }
}

/// Result of `kill_command`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KilledCommand {
    pub command_id: Option<String>,
    pub pid: u32,
    /// `false` when the process had already exited.
    pub was_running: bool,
}

/// Result of `start_server`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedServer {
    pub command_id: String,
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub url: String,
    pub log_file: String,
}

/// Runs commands against a session's sandbox and tracks background handles.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    hidden_envs: HashMap<String, String>,
}

impl CommandExecutor {
    pub fn new(hidden_envs: HashMap<String, String>) -> Self {
        Self { hidden_envs }
    }

    pub fn hidden_envs(&self) -> &HashMap<String, String> {
        &self.hidden_envs
    }

    fn request(&self, opts: &RunOptions) -> CommandRequest {
        CommandRequest {
            cmd: opts.cmd.clone(),
            envs: merge_envs(&self.hidden_envs, &opts.envs),
            cwd: opts.cwd.clone(),
            user: opts.user.clone(),
            timeout_ms: opts.timeout_ms,
        }
    }

    /// Run to completion and return the captured output.
    pub async fn run_foreground(
        &self,
        handle: &SessionHandle,
        opts: &RunOptions,
    ) -> Result<CommandOutput> {
        debug!(session_id = %handle.session_id, cmd = %opts.cmd, "running command");
        let output = handle.sandbox().run(&self.request(opts)).await?;
        debug!(
            session_id = %handle.session_id,
            exit_code = output.exit_code,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "command finished"
        );
        Ok(output)
    }

    /// Start a command in the background and track it under its command id.
    pub async fn run_background(
        &self,
        handle: &SessionHandle,
        opts: &RunOptions,
    ) -> Result<CommandHandle> {
        let started = handle.sandbox().spawn(&self.request(opts)).await?;
        let command = CommandHandle {
            command_id: started.command_id,
            pid: started.pid,
            cmd: opts.cmd.clone(),
            started_at: Utc::now(),
        };
        handle
            .commands()
            .await
            .insert(command.command_id.clone(), command.clone());
        info!(
            session_id = %handle.session_id,
            command_id = %command.command_id,
            pid = command.pid,
            "background command started"
        );
        Ok(command)
    }

    /// Kill a tracked background command. Fails with `NotFound` if the id is
    /// not (or no longer) tracked for this session.
    pub async fn kill_command(
        &self,
        handle: &SessionHandle,
        command_id: &str,
    ) -> Result<KilledCommand> {
        let mut commands = handle.commands().await;
        let command = commands
            .get(command_id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(format!("command {command_id}")))?;

        let was_running = handle.sandbox().kill_process(command.pid).await?;
        commands.remove(command_id);
        info!(
            session_id = %handle.session_id,
            command_id,
            pid = command.pid,
            was_running,
            "background command killed"
        );
        Ok(KilledCommand {
            command_id: Some(command.command_id),
            pid: command.pid,
            was_running,
        })
    }

    /// Kill a process by pid. Fails with `NotFound` if nothing is running
    /// under that pid. Any tracked command for the pid is dropped.
    pub async fn kill_pid(&self, handle: &SessionHandle, pid: u32) -> Result<KilledCommand> {
        let mut commands = handle.commands().await;
        if !handle.sandbox().kill_process(pid).await? {
            return Err(SandboxError::NotFound(format!("process {pid}")));
        }
        let command_id = commands
            .iter()
            .find(|(_, c)| c.pid == pid)
            .map(|(id, _)| id.clone());
        if let Some(id) = &command_id {
            commands.remove(id);
        }
        info!(session_id = %handle.session_id, pid, "process killed");
        Ok(KilledCommand {
            command_id,
            pid,
            was_running: true,
        })
    }

    /// Start a long-running server in the background with output redirected
    /// to `log_file`, then resolve the public host for `port`.
    ///
    /// Shell `&` does not outlive the command RPC; the service's native
    /// background flag does, so the command is always spawned.
    pub async fn start_server(
        &self,
        handle: &SessionHandle,
        opts: &RunOptions,
        port: u16,
        log_file: &str,
    ) -> Result<StartedServer> {
        let wrapped = RunOptions {
            cmd: redirect_to_log(&opts.cmd, log_file),
            ..opts.clone()
        };
        let command = self.run_background(handle, &wrapped).await?;
        let host = handle.sandbox().host(port);
        Ok(StartedServer {
            command_id: command.command_id,
            pid: command.pid,
            url: format!("https://{host}"),
            host,
            port,
            log_file: log_file.to_string(),
        })
    }

    /// Tracked background commands, after dropping those that have exited.
    pub async fn list_commands(&self, handle: &SessionHandle) -> Result<Vec<CommandHandle>> {
        self.prune_finished(handle).await?;
        let mut commands: Vec<_> = handle.commands().await.values().cloned().collect();
        commands.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(commands)
    }

    /// Drop tracked commands whose process is no longer running. Returns the
    /// number of entries evicted.
    pub async fn prune_finished(&self, handle: &SessionHandle) -> Result<usize> {
        let mut commands = handle.commands().await;
        if commands.is_empty() {
            return Ok(0);
        }
        let running: HashSet<u32> = handle
            .sandbox()
            .list_processes()
            .await?
            .into_iter()
            .map(|p| p.pid)
            .collect();
        let before = commands.len();
        commands.retain(|_, c| running.contains(&c.pid));
        let pruned = before - commands.len();
        if pruned > 0 {
            debug!(session_id = %handle.session_id, pruned, "evicted finished commands");
        }
        Ok(pruned)
    }

    /// Look up a running process. Fails with `NotFound` if `pid` is not
    /// running at query time.
    pub async fn process_info(&self, handle: &SessionHandle, pid: u32) -> Result<ProcessInfo> {
        handle
            .sandbox()
            .list_processes()
            .await?
            .into_iter()
            .find(|p| p.pid == pid)
            .ok_or_else(|| SandboxError::NotFound(format!("process {pid}")))
    }

    /// Install language packages with the ecosystem's package manager.
    pub async fn install_packages(
        &self,
        handle: &SessionHandle,
        packages: &[String],
        ecosystem: Ecosystem,
    ) -> Result<CommandOutput> {
        if packages.is_empty() {
            return Err(SandboxError::MissingParameter("packages"));
        }
        let opts = RunOptions {
            cmd: ecosystem.install_command(packages),
            ..RunOptions::default()
        };
        let output = self.run_foreground(handle, &opts).await?;
        if output.exit_code != 0 {
            warn!(
                session_id = %handle.session_id,
                ?ecosystem,
                exit_code = output.exit_code,
                "package install failed"
            );
        }
        Ok(output)
    }

    /// Install system packages with apt-get, as root.
    pub async fn system_install(
        &self,
        handle: &SessionHandle,
        packages: &[String],
    ) -> Result<CommandOutput> {
        if packages.is_empty() {
            return Err(SandboxError::MissingParameter("packages"));
        }
        let quoted: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
        let opts = RunOptions {
            cmd: format!(
                "apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {}",
                quoted.join(" ")
            ),
            user: Some("root".to_string()),
            ..RunOptions::default()
        };
        self.run_foreground(handle, &opts).await
    }

    pub async fn write_file(
        &self,
        handle: &SessionHandle,
        path: &str,
        content: &[u8],
        user: Option<&str>,
    ) -> Result<()> {
        handle.sandbox().write_file(path, content, user).await
    }

    pub async fn read_file(
        &self,
        handle: &SessionHandle,
        path: &str,
        user: Option<&str>,
    ) -> Result<Vec<u8>> {
        handle.sandbox().read_file(path, user).await
    }

    pub fn download_url(
        &self,
        handle: &SessionHandle,
        path: &str,
        user: Option<&str>,
    ) -> Result<String> {
        handle.sandbox().download_url(path, user)
    }

    pub fn host(&self, handle: &SessionHandle, port: u16) -> String {
        handle.sandbox().host(port)
    }
}
