//! Action requests, the dispatch table and the JSON response envelope.
//!
//! Every action name maps to an [`ActionSpec`] carrying its parameter
//! contract and a typed handler. Requests are validated against the
//! contract before the handler runs, and every outcome (including errors)
//! becomes a single JSON object.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::executor::{Ecosystem, RunOptions};
use crate::manager::SandboxManager;
use crate::state::SessionHandle;

/// Upper bound for sandbox timeouts, in minutes.
pub const MAX_TIMEOUT_MINUTES: u64 = 24 * 60;

/// A caller request. Only `action` is required at the schema level; the
/// per-action contract is checked by the dispatcher.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: String,
    pub session_id: Option<String>,
    pub sandbox_id: Option<String>,
    #[serde(alias = "command_name")]
    pub command_name: Option<String>,
    /// Sandbox lifetime in minutes.
    pub timeout: Option<u64>,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    pub cmd: Option<String>,
    #[serde(default)]
    pub background: bool,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub timeout_ms: Option<u64>,
    pub command_id: Option<String>,
    pub pid: Option<u32>,
    pub file_path: Option<String>,
    pub file_content: Option<String>,
    /// `"base64"` when `file_content` is base64-encoded.
    pub encoding: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(alias = "ecosystem")]
    pub language: Option<String>,
    pub port: Option<u16>,
    pub log_file: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl ActionRequest {
    /// Whether the named parameter is present and non-empty.
    pub fn has(&self, param: &str) -> bool {
        match param {
            "sessionId" => non_empty(&self.session_id).is_some(),
            "sandboxId" => non_empty(&self.sandbox_id).is_some(),
            "cmd" => non_empty(&self.cmd).is_some(),
            "timeout" => self.timeout.is_some(),
            "commandId" => non_empty(&self.command_id).is_some(),
            "pid" => self.pid.is_some(),
            "filePath" => non_empty(&self.file_path).is_some(),
            "fileContent" => self.file_content.is_some(),
            "packages" => !self.packages.is_empty(),
            "port" => self.port.is_some(),
            "logFile" => non_empty(&self.log_file).is_some(),
            _ => false,
        }
    }

    fn session(&self) -> Result<&str> {
        non_empty(&self.session_id).ok_or(SandboxError::MissingParameter("sessionId"))
    }

    fn cmd(&self) -> Result<&str> {
        non_empty(&self.cmd).ok_or(SandboxError::MissingParameter("cmd"))
    }

    fn file_path(&self) -> Result<&str> {
        non_empty(&self.file_path).ok_or(SandboxError::MissingParameter("filePath"))
    }

    fn port(&self) -> Result<u16> {
        self.port.ok_or(SandboxError::MissingParameter("port"))
    }

    fn pid(&self) -> Result<u32> {
        self.pid.ok_or(SandboxError::MissingParameter("pid"))
    }

    fn timeout_minutes(&self) -> Result<Option<u64>> {
        match self.timeout {
            Some(t) if t == 0 || t > MAX_TIMEOUT_MINUTES => Err(SandboxError::Validation(format!(
                "timeout must be between 1 and {MAX_TIMEOUT_MINUTES} minutes, got {t}"
            ))),
            other => Ok(other),
        }
    }

    fn run_options(&self) -> Result<RunOptions> {
        Ok(RunOptions {
            cmd: self.cmd()?.to_string(),
            envs: self.envs.clone(),
            cwd: non_empty(&self.cwd).map(String::from),
            user: non_empty(&self.user).map(String::from),
            timeout_ms: self.timeout_ms,
        })
    }
}

/// One entry of an action's parameter contract.
#[derive(Debug, Clone, Copy)]
pub enum Param {
    Required(&'static str),
    /// At least one of `names` must be present.
    AnyOf {
        label: &'static str,
        names: &'static [&'static str],
    },
}

impl Param {
    fn satisfied_by(&self, request: &ActionRequest) -> bool {
        match self {
            Self::Required(name) => request.has(name),
            Self::AnyOf { names, .. } => names.iter().any(|n| request.has(n)),
        }
    }

    fn label(&self) -> &'static str {
        match *self {
            Self::Required(name) => name,
            Self::AnyOf { label, .. } => label,
        }
    }
}

type Handler =
    for<'a> fn(&'a SandboxManager, &'a ActionRequest) -> BoxFuture<'a, Result<Value>>;

/// Name, documentation and parameter contract of one action.
pub struct ActionSpec {
    pub name: &'static str,
    pub summary: &'static str,
    pub params: &'static [Param],
    pub optional: &'static [&'static str],
    handler: Handler,
}

impl ActionSpec {
    fn check(&self, request: &ActionRequest) -> Result<()> {
        match self.params.iter().find(|p| !p.satisfied_by(request)) {
            Some(param) => Err(SandboxError::MissingParameter(param.label())),
            None => Ok(()),
        }
    }

    fn describe(&self) -> Value {
        json!({
            "action": self.name,
            "description": self.summary,
            "required": self.params.iter().map(Param::label).collect::<Vec<_>>(),
            "optional": self.optional,
        })
    }
}

const SESSION: Param = Param::Required("sessionId");
const RUN_OPTIONAL: &[&str] = &["background", "cwd", "user", "timeoutMs", "envs"];
const KILL_COMMAND_PARAMS: &[Param] = &[
    SESSION,
    Param::AnyOf {
        label: "commandId or pid",
        names: &["commandId", "pid"],
    },
];

/// The dispatch table.
pub static ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "help",
        summary: "Describe all actions, or one action's parameters when command_name is given.",
        params: &[],
        optional: &["command_name"],
        handler: help,
    },
    ActionSpec {
        name: "create",
        summary: "Create a sandbox bound to sessionId. Returns sandboxId, user and currentDirectory.",
        params: &[SESSION],
        optional: &["timeout", "envs"],
        handler: create,
    },
    ActionSpec {
        name: "list_sandboxes",
        summary: "List sandboxes the remote service reports as live.",
        params: &[],
        optional: &[],
        handler: list_sandboxes,
    },
    ActionSpec {
        name: "kill",
        summary: "Kill a sandbox by sandboxId or by the sandbox bound to sessionId. Never fails hard on an already-dead sandbox.",
        params: &[Param::AnyOf {
            label: "sessionId or sandboxId",
            names: &["sessionId", "sandboxId"],
        }],
        optional: &[],
        handler: kill,
    },
    ActionSpec {
        name: "set_timeout",
        summary: "Replace the sandbox deadline with now + timeout minutes.",
        params: &[SESSION, Param::Required("timeout")],
        optional: &[],
        handler: set_timeout,
    },
    ActionSpec {
        name: "shell",
        summary: "Run a shell command. With background=true returns a commandId immediately.",
        params: &[SESSION, Param::Required("cmd")],
        optional: RUN_OPTIONAL,
        handler: run_command,
    },
    ActionSpec {
        name: "command_run",
        summary: "Alias of shell.",
        params: &[SESSION, Param::Required("cmd")],
        optional: RUN_OPTIONAL,
        handler: run_command,
    },
    ActionSpec {
        name: "kill_command",
        summary: "Kill a background command by commandId, or any process by pid.",
        params: KILL_COMMAND_PARAMS,
        optional: &[],
        handler: kill_command,
    },
    ActionSpec {
        name: "command_kill",
        summary: "Alias of kill_command.",
        params: KILL_COMMAND_PARAMS,
        optional: &[],
        handler: kill_command,
    },
    ActionSpec {
        name: "write_file",
        summary: "Write fileContent to filePath inside the sandbox.",
        params: &[SESSION, Param::Required("filePath"), Param::Required("fileContent")],
        optional: &["encoding", "user"],
        handler: write_file,
    },
    ActionSpec {
        name: "read_file",
        summary: "Read filePath from the sandbox. Binary content is returned base64-encoded.",
        params: &[SESSION, Param::Required("filePath")],
        optional: &["user"],
        handler: read_file,
    },
    ActionSpec {
        name: "install",
        summary: "Install packages with the language's package manager (python: pip, node: npm).",
        params: &[SESSION, Param::Required("packages")],
        optional: &["language"],
        handler: install,
    },
    ActionSpec {
        name: "system_install",
        summary: "Install system packages with apt-get.",
        params: &[SESSION, Param::Required("packages")],
        optional: &[],
        handler: system_install,
    },
    ActionSpec {
        name: "get_file_downloadurl",
        summary: "Download URL for filePath.",
        params: &[SESSION, Param::Required("filePath")],
        optional: &["user"],
        handler: download_url,
    },
    ActionSpec {
        name: "get_host",
        summary: "Externally reachable host for a port inside the sandbox.",
        params: &[SESSION, Param::Required("port")],
        optional: &[],
        handler: get_host,
    },
    ActionSpec {
        name: "start_server",
        summary: "Start a server in the background with output sent to logFile, and return its host. Compound commands are logged as a whole. A trailing `&` is dropped; the command is always backgrounded natively.",
        params: &[
            SESSION,
            Param::Required("cmd"),
            Param::Required("port"),
            Param::Required("logFile"),
        ],
        optional: &["cwd", "user", "envs"],
        handler: start_server,
    },
    ActionSpec {
        name: "command_list",
        summary: "List tracked background commands that are still running.",
        params: &[SESSION],
        optional: &[],
        handler: command_list,
    },
    ActionSpec {
        name: "processinfo",
        summary: "Details of a running process by pid.",
        params: &[SESSION, Param::Required("pid")],
        optional: &[],
        handler: process_info,
    },
];

pub fn find_action(name: &str) -> Option<&'static ActionSpec> {
    ACTIONS.iter().find(|spec| spec.name == name)
}

/// Resolve the request's session and refresh its access time.
async fn session_handle(
    manager: &SandboxManager,
    request: &ActionRequest,
) -> Result<Arc<SessionHandle>> {
    manager.resolve(request.session()?).await
}

fn help<'a>(_: &'a SandboxManager, request: &'a ActionRequest) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        match non_empty(&request.command_name) {
            Some(name) => {
                let spec = find_action(name)
                    .ok_or_else(|| SandboxError::NotFound(format!("action {name}")))?;
                Ok(spec.describe())
            }
            None => Ok(json!({
                "actions": ACTIONS
                    .iter()
                    .map(|s| json!({ "action": s.name, "description": s.summary }))
                    .collect::<Vec<_>>(),
                "notes": [
                    "Every response is a JSON object with a boolean `success`.",
                    "Use background=true or start_server for long-running processes; a trailing `&` does not survive the command call.",
                ],
            })),
        }
    })
}

fn create<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let created = manager
            .create(request.session()?, request.timeout_minutes()?, &request.envs)
            .await?;
        Ok(serde_json::to_value(created)?)
    })
}

fn list_sandboxes<'a>(
    manager: &'a SandboxManager,
    _: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let sandboxes = manager.list_sandboxes().await?;
        Ok(json!({ "count": sandboxes.len(), "sandboxes": sandboxes }))
    })
}

fn kill<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let report = manager
            .kill(non_empty(&request.session_id), non_empty(&request.sandbox_id))
            .await?;
        Ok(serde_json::to_value(report)?)
    })
}

fn set_timeout<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let minutes = request
            .timeout_minutes()?
            .ok_or(SandboxError::MissingParameter("timeout"))?;
        let updated = manager.set_timeout(request.session()?, minutes).await?;
        Ok(serde_json::to_value(updated)?)
    })
}

fn run_command<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let opts = request.run_options()?;
        let handle = session_handle(manager, request).await?;
        let value = if request.background {
            let command = manager.executor().run_background(&handle, &opts).await?;
            json!({
                "background": true,
                "commandId": command.command_id,
                "pid": command.pid,
                "cmd": command.cmd,
            })
        } else {
            let output = manager.executor().run_foreground(&handle, &opts).await?;
            json!({
                "success": output.exit_code == 0,
                "output": output.stdout.trim_end(),
                "stdout": output.stdout,
                "stderr": output.stderr,
                "exitCode": output.exit_code,
            })
        };
        handle.touch().await;
        Ok(value)
    })
}

fn kill_command<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let handle = session_handle(manager, request).await?;
        let killed = match non_empty(&request.command_id) {
            Some(id) => manager.executor().kill_command(&handle, id).await?,
            None => manager.executor().kill_pid(&handle, request.pid()?).await?,
        };
        handle.touch().await;
        Ok(serde_json::to_value(killed)?)
    })
}

fn write_file<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let path = request.file_path()?;
        let content = request
            .file_content
            .as_deref()
            .ok_or(SandboxError::MissingParameter("fileContent"))?;
        let bytes = match request.encoding.as_deref() {
            Some("base64") => base64::engine::general_purpose::STANDARD
                .decode(content)
                .map_err(|e| SandboxError::Validation(format!("fileContent is not base64: {e}")))?,
            None | Some("utf8") | Some("utf-8") => content.as_bytes().to_vec(),
            Some(other) => {
                return Err(SandboxError::Validation(format!("unknown encoding {other}")));
            }
        };
        let handle = session_handle(manager, request).await?;
        manager
            .executor()
            .write_file(&handle, path, &bytes, non_empty(&request.user))
            .await?;
        handle.touch().await;
        Ok(json!({ "filePath": path, "bytesWritten": bytes.len() }))
    })
}

fn read_file<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let path = request.file_path()?;
        let handle = session_handle(manager, request).await?;
        let bytes = manager
            .executor()
            .read_file(&handle, path, non_empty(&request.user))
            .await?;
        handle.touch().await;
        Ok(match String::from_utf8(bytes) {
            Ok(text) => json!({ "filePath": path, "fileContent": text }),
            Err(e) => json!({
                "filePath": path,
                "encoding": "base64",
                "fileContent": base64::engine::general_purpose::STANDARD.encode(e.as_bytes()),
            }),
        })
    })
}

fn install_result(output: crate::provider::CommandOutput) -> Value {
    json!({
        "success": output.exit_code == 0,
        "exitCode": output.exit_code,
        "stdout": output.stdout,
        "stderr": output.stderr,
    })
}

fn install<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let ecosystem: Ecosystem = non_empty(&request.language).unwrap_or("python").parse()?;
        let handle = session_handle(manager, request).await?;
        let output = manager
            .executor()
            .install_packages(&handle, &request.packages, ecosystem)
            .await?;
        handle.touch().await;
        Ok(install_result(output))
    })
}

fn system_install<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let handle = session_handle(manager, request).await?;
        let output = manager
            .executor()
            .system_install(&handle, &request.packages)
            .await?;
        handle.touch().await;
        Ok(install_result(output))
    })
}

fn download_url<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let path = request.file_path()?;
        let handle = session_handle(manager, request).await?;
        let url = manager
            .executor()
            .download_url(&handle, path, non_empty(&request.user))?;
        handle.touch().await;
        Ok(json!({ "filePath": path, "downloadUrl": url }))
    })
}

fn get_host<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let port = request.port()?;
        let handle = session_handle(manager, request).await?;
        let host = manager.executor().host(&handle, port);
        handle.touch().await;
        Ok(json!({ "port": port, "url": format!("https://{host}"), "host": host }))
    })
}

fn start_server<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let opts = request.run_options()?;
        let port = request.port()?;
        let log_file =
            non_empty(&request.log_file).ok_or(SandboxError::MissingParameter("logFile"))?;
        let handle = session_handle(manager, request).await?;
        let started = manager
            .executor()
            .start_server(&handle, &opts, port, log_file)
            .await?;
        handle.touch().await;
        Ok(serde_json::to_value(started)?)
    })
}

fn command_list<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let handle = session_handle(manager, request).await?;
        let commands = manager.executor().list_commands(&handle).await?;
        handle.touch().await;
        Ok(json!({ "count": commands.len(), "commands": commands }))
    })
}

fn process_info<'a>(
    manager: &'a SandboxManager,
    request: &'a ActionRequest,
) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let pid = request.pid()?;
        let handle = session_handle(manager, request).await?;
        let process = manager.executor().process_info(&handle, pid).await?;
        handle.touch().await;
        Ok(json!({ "process": process }))
    })
}

/// Envelope for a successful handler result. Handlers may set `success`
/// themselves (e.g. a command that exited non-zero); otherwise it is `true`.
fn success_envelope(session_id: Option<&str>, body: Value) -> Value {
    let mut obj = match body {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    };
    if let Some(id) = session_id {
        obj.entry("sessionId").or_insert_with(|| json!(id));
    }
    obj.entry("success").or_insert(Value::Bool(true));
    Value::Object(obj)
}

fn error_envelope(session_id: Option<&str>, err: &SandboxError) -> Value {
    json!({
        "sessionId": session_id,
        "success": false,
        "error": err.to_string(),
        "kind": err.kind(),
    })
}

/// Routes raw JSON requests through the dispatch table.
pub struct Dispatcher {
    manager: Arc<SandboxManager>,
    table: HashMap<&'static str, &'static ActionSpec>,
}

impl Dispatcher {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        let table = ACTIONS.iter().map(|spec| (spec.name, spec)).collect();
        Self { manager, table }
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    /// Validate and run a typed request.
    pub async fn execute(&self, request: &ActionRequest) -> Result<Value> {
        let spec = self.table.get(request.action.as_str()).ok_or_else(|| {
            SandboxError::Validation(format!("unknown action {:?}", request.action))
        })?;
        spec.check(request)?;
        debug!(action = spec.name, session_id = ?request.session_id, "dispatching action");
        (spec.handler)(self.manager.as_ref(), request).await
    }

    /// Handle a raw request. Never fails: errors become
    /// `{sessionId, success: false, error, kind}`.
    pub async fn dispatch(&self, raw: Value) -> Value {
        let session_id = raw
            .get("sessionId")
            .and_then(Value::as_str)
            .map(String::from);

        let request: ActionRequest = match serde_json::from_value(raw) {
            Ok(request) => request,
            Err(e) => {
                let err = SandboxError::Validation(e.to_string());
                warn!(session_id = ?session_id, error = %err, "rejected malformed request");
                return error_envelope(session_id.as_deref(), &err);
            }
        };

        match self.execute(&request).await {
            Ok(body) => success_envelope(session_id.as_deref(), body),
            Err(err) => {
                warn!(
                    action = %request.action,
                    session_id = ?session_id,
                    kind = err.kind(),
                    error = %err,
                    "action failed"
                );
                error_envelope(session_id.as_deref(), &err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_request() -> ActionRequest {
        ActionRequest {
            action: "x".into(),
            session_id: Some("s".into()),
            sandbox_id: Some("b".into()),
            timeout: Some(5),
            cmd: Some("ls".into()),
            command_id: Some("1".into()),
            pid: Some(1),
            file_path: Some("/f".into()),
            file_content: Some(String::new()),
            packages: vec!["p".into()],
            port: Some(80),
            log_file: Some("/l".into()),
            ..ActionRequest::default()
        }
    }

    #[test]
    fn table_names_are_unique() {
        let names: std::collections::HashSet<_> = ACTIONS.iter().map(|a| a.name).collect();
        assert_eq!(names.len(), ACTIONS.len());
    }

    #[test]
    fn every_declared_param_is_checkable() {
        let request = full_request();
        for spec in ACTIONS {
            for param in spec.params {
                assert!(
                    param.satisfied_by(&request),
                    "{} declares unknown parameter {}",
                    spec.name,
                    param.label()
                );
            }
        }
    }

    #[test]
    fn missing_param_is_reported_by_label() {
        let request = ActionRequest {
            action: "kill_command".into(),
            session_id: Some("s".into()),
            ..ActionRequest::default()
        };
        let err = find_action("kill_command").unwrap().check(&request).unwrap_err();
        assert_eq!(err.to_string(), "missing parameter: commandId or pid");
    }

    #[test]
    fn blank_strings_count_as_missing() {
        let request = ActionRequest {
            session_id: Some("  ".into()),
            ..ActionRequest::default()
        };
        assert!(!request.has("sessionId"));
    }

    #[test]
    fn command_name_accepts_snake_case() {
        let request: ActionRequest =
            serde_json::from_value(json!({"action": "help", "command_name": "create"})).unwrap();
        assert_eq!(request.command_name.as_deref(), Some("create"));
    }

    #[test]
    fn timeout_bounds_are_validated() {
        let mut request = ActionRequest {
            timeout: Some(0),
            ..ActionRequest::default()
        };
        assert_eq!(request.timeout_minutes().unwrap_err().kind(), "validation");
        request.timeout = Some(MAX_TIMEOUT_MINUTES + 1);
        assert!(request.timeout_minutes().is_err());
        request.timeout = Some(30);
        assert_eq!(request.timeout_minutes().unwrap(), Some(30));
    }

    #[test]
    fn envelopes_keep_handler_success_flag() {
        let ok = success_envelope(Some("s1"), json!({ "success": false, "exitCode": 1 }));
        assert_eq!(ok["success"], false);
        assert_eq!(ok["sessionId"], "s1");

        let wrapped = success_envelope(None, json!([1, 2]));
        assert_eq!(wrapped["result"], json!([1, 2]));
        assert_eq!(wrapped["success"], true);

        let err = error_envelope(Some("s1"), &SandboxError::NotFound("x".into()));
        assert_eq!(err["success"], false);
        assert_eq!(err["kind"], "not_found");
    }
}
