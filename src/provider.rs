//! The seam between the session layer and the external sandbox service.
//!
//! [`SandboxProvider`] covers the control plane (create, connect, kill,
//! timeout, list). [`RemoteSandbox`] is a connected handle to one sandbox and
//! covers the data plane (processes and files).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Returns the stable part of a sandbox id as reported by the remote service.
///
/// The service may append a client suffix (`abc123-xyz`); only the text
/// before the first `-` is used for reconnection and exposed to callers.
pub fn normalize_sandbox_id(id: &str) -> &str {
    let id = id.trim();
    id.split('-').next().unwrap_or(id)
}

/// Parameters for creating a remote sandbox.
#[derive(Debug, Clone)]
pub struct CreateSandbox {
    pub template: String,
    pub timeout: Duration,
    pub envs: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

/// A process to run inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub cmd: String,
    pub envs: HashMap<String, String>,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Output of a foreground command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A background process started by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundCommand {
    /// Opaque id assigned by the service.
    pub command_id: String,
    pub pid: u32,
}

/// A process running inside a sandbox, as listed by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// A live sandbox as reported by the service's list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub template_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub status: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Human-readable backend name (e.g. "e2b").
    fn name(&self) -> &str;

    /// Create a sandbox and return a connected handle.
    async fn create(&self, request: &CreateSandbox) -> Result<Arc<dyn RemoteSandbox>>;

    /// Reconnect to an existing sandbox by its stable id.
    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>>;

    /// Terminate a sandbox. Fails with `NotFound` if it is already gone.
    async fn kill(&self, sandbox_id: &str) -> Result<()>;

    /// Replace the sandbox deadline with `now + timeout`.
    async fn set_timeout(&self, sandbox_id: &str, timeout: Duration) -> Result<()>;

    async fn list(&self) -> Result<Vec<SandboxInfo>>;
}

#[async_trait]
pub trait RemoteSandbox: Send + Sync {
    /// Stable (normalized) sandbox id.
    fn id(&self) -> &str;

    /// Run a command to completion.
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput>;

    /// Start a command with the service's native background flag.
    async fn spawn(&self, request: &CommandRequest) -> Result<BackgroundCommand>;

    /// Kill a process. Returns `false` if no such process was running.
    async fn kill_process(&self, pid: u32) -> Result<bool>;

    async fn list_processes(&self) -> Result<Vec<ProcessInfo>>;

    async fn read_file(&self, path: &str, user: Option<&str>) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &str, content: &[u8], user: Option<&str>) -> Result<()>;

    /// Download URL for a file in the sandbox.
    fn download_url(&self, path: &str, user: Option<&str>) -> Result<String>;

    /// Externally reachable host name bound to `port`.
    fn host(&self, port: u16) -> String;
}
