//! HTTP implementation of the provider seam for an E2B-style sandbox service.
//!
//! Control plane (`api_url`, `X-API-Key` auth):
//!   POST   /sandboxes               create
//!   GET    /sandboxes               list
//!   GET    /sandboxes/{id}          describe (used to connect)
//!   POST   /sandboxes/{id}/timeout  replace deadline
//!   DELETE /sandboxes/{id}          kill
//!
//! Data plane (per sandbox, `https://49983-{id}.{domain}` unless overridden):
//!   POST   /commands                run or spawn
//!   GET    /commands                list running processes
//!   DELETE /commands/{pid}          kill process
//!   GET    /files?path=&username=   read
//!   POST   /files?path=&username=   write (raw body)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SandboxError};
use crate::provider::{
    normalize_sandbox_id, BackgroundCommand, CommandOutput, CommandRequest, CreateSandbox,
    ProcessInfo, RemoteSandbox, SandboxInfo, SandboxProvider,
};

/// Port the in-sandbox daemon listens on.
pub const ENVD_PORT: u16 = 49983;

/// Timeout for control-plane requests.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack added on top of a command's own timeout before the HTTP request gives up.
const COMMAND_SLACK: Duration = Duration::from_secs(10);

/// Default foreground command timeout when the caller gives none.
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 60_000;

/// Connection settings for the remote service.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_url: String,
    pub api_key: String,
    pub domain: String,
    /// Fixed data-plane base URL; bypasses the per-sandbox host scheme.
    pub envd_url: Option<String>,
}

/// Shared HTTP state. Clone is an Arc refcount bump.
#[derive(Clone)]
pub struct HttpProvider {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    config: ProviderConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    timeout: u64,
    env_vars: &'a HashMap<String, String>,
    metadata: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
struct CreatedSandbox {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedSandbox {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(rename = "templateID", default)]
    template_id: Option<String>,
    started_at: DateTime<Utc>,
    #[serde(default)]
    end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandBody<'a> {
    cmd: &'a str,
    envs: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    timeout_ms: u64,
    background: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnedCommand {
    pid: u32,
    #[serde(default)]
    command_id: Option<String>,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(SandboxError::MissingCredential("E2B_API_KEY".into()));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| SandboxError::Config(format!("http client: {e}")))?;

        info!(
            api_url = %config.api_url,
            domain = %config.domain,
            envd_override = config.envd_url.is_some(),
            "sandbox provider initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner { client, config }),
        })
    }

    fn control(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.inner.config.api_url.trim_end_matches('/'));
        self.inner
            .client
            .request(method, url)
            .header("X-API-Key", &self.inner.config.api_key)
            .timeout(CONTROL_TIMEOUT)
    }

    fn handle(&self, sandbox_id: &str) -> Arc<dyn RemoteSandbox> {
        Arc::new(HttpSandbox {
            provider: self.clone(),
            id: normalize_sandbox_id(sandbox_id).to_string(),
        })
    }
}

/// Maps a non-success response to the error taxonomy.
async fn check(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => SandboxError::NotFound(what.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            SandboxError::Timeout(format!("{what}: {body}"))
        }
        _ => SandboxError::RemoteUnavailable(format!("{what} {status}: {body}")),
    })
}

fn send_error(what: &str, e: reqwest::Error) -> SandboxError {
    if e.is_timeout() {
        SandboxError::Timeout(format!("{what}: {e}"))
    } else {
        SandboxError::RemoteUnavailable(format!("{what}: {e}"))
    }
}

fn decode_error(what: &str, e: reqwest::Error) -> SandboxError {
    SandboxError::RemoteUnavailable(format!("{what} decode: {e}"))
}

#[async_trait]
impl SandboxProvider for HttpProvider {
    fn name(&self) -> &str {
        "e2b"
    }

    async fn create(&self, request: &CreateSandbox) -> Result<Arc<dyn RemoteSandbox>> {
        let body = CreateBody {
            template_id: &request.template,
            timeout: request.timeout.as_secs(),
            env_vars: &request.envs,
            metadata: &request.metadata,
        };
        let resp = self
            .control(Method::POST, "/sandboxes")
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error("create sandbox", e))?;
        let created: CreatedSandbox = check(resp, "create sandbox")
            .await?
            .json()
            .await
            .map_err(|e| decode_error("create sandbox", e))?;

        info!(
            sandbox_id = %created.sandbox_id,
            template = %request.template,
            "remote sandbox created"
        );
        Ok(self.handle(&created.sandbox_id))
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>> {
        let id = normalize_sandbox_id(sandbox_id);
        let what = format!("sandbox {id}");
        let resp = self
            .control(Method::GET, &format!("/sandboxes/{id}"))
            .send()
            .await
            .map_err(|e| send_error(&what, e))?;
        check(resp, &what).await?;
        debug!(sandbox_id = %id, "reconnected to sandbox");
        Ok(self.handle(id))
    }

    async fn kill(&self, sandbox_id: &str) -> Result<()> {
        let id = normalize_sandbox_id(sandbox_id);
        let what = format!("sandbox {id}");
        let resp = self
            .control(Method::DELETE, &format!("/sandboxes/{id}"))
            .send()
            .await
            .map_err(|e| send_error(&what, e))?;
        check(resp, &what).await?;
        Ok(())
    }

    async fn set_timeout(&self, sandbox_id: &str, timeout: Duration) -> Result<()> {
        let id = normalize_sandbox_id(sandbox_id);
        let what = format!("sandbox {id}");
        let resp = self
            .control(Method::POST, &format!("/sandboxes/{id}/timeout"))
            .json(&serde_json::json!({ "timeout": timeout.as_secs() }))
            .send()
            .await
            .map_err(|e| send_error(&what, e))?;
        check(resp, &what).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>> {
        let resp = self
            .control(Method::GET, "/sandboxes")
            .send()
            .await
            .map_err(|e| send_error("list sandboxes", e))?;
        let listed: Vec<ListedSandbox> = check(resp, "list sandboxes")
            .await?
            .json()
            .await
            .map_err(|e| decode_error("list sandboxes", e))?;

        Ok(listed
            .into_iter()
            .map(|s| SandboxInfo {
                sandbox_id: normalize_sandbox_id(&s.sandbox_id).to_string(),
                template_id: s.template_id,
                started_at: s.started_at,
                end_at: s.end_at,
                status: s.state.unwrap_or_else(|| "running".to_string()),
                metadata: s.metadata,
            })
            .collect())
    }
}

/// A connected sandbox reached through its data-plane daemon.
struct HttpSandbox {
    provider: HttpProvider,
    id: String,
}

impl HttpSandbox {
    fn envd_base(&self) -> String {
        let config = &self.provider.inner.config;
        match &config.envd_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{ENVD_PORT}-{}.{}", self.id, config.domain),
        }
    }

    fn envd(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.envd_base());
        self.provider
            .inner
            .client
            .request(method, url)
            .header("X-API-Key", &self.provider.inner.config.api_key)
    }

    fn file_query<'a>(path: &'a str, user: Option<&'a str>) -> Vec<(&'static str, &'a str)> {
        let mut query = vec![("path", path)];
        if let Some(user) = user {
            query.push(("username", user));
        }
        query
    }

    fn command_body<'a>(request: &'a CommandRequest, background: bool) -> CommandBody<'a> {
        CommandBody {
            cmd: &request.cmd,
            envs: &request.envs,
            cwd: request.cwd.as_deref(),
            user: request.user.as_deref(),
            timeout_ms: request.timeout_ms.unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS),
            background,
        }
    }
}

#[async_trait]
impl RemoteSandbox for HttpSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput> {
        let body = Self::command_body(request, false);
        let deadline = Duration::from_millis(body.timeout_ms) + COMMAND_SLACK;
        let resp = self
            .envd(Method::POST, "/commands")
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error("run command", e))?;
        check(resp, "run command")
            .await?
            .json()
            .await
            .map_err(|e| decode_error("run command", e))
    }

    async fn spawn(&self, request: &CommandRequest) -> Result<BackgroundCommand> {
        let resp = self
            .envd(Method::POST, "/commands")
            .timeout(CONTROL_TIMEOUT)
            .json(&Self::command_body(request, true))
            .send()
            .await
            .map_err(|e| send_error("spawn command", e))?;
        let spawned: SpawnedCommand = check(resp, "spawn command")
            .await?
            .json()
            .await
            .map_err(|e| decode_error("spawn command", e))?;
        Ok(BackgroundCommand {
            // pids are recycled, so they cannot key the command map
            command_id: spawned
                .command_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            pid: spawned.pid,
        })
    }

    async fn kill_process(&self, pid: u32) -> Result<bool> {
        let what = format!("process {pid}");
        let resp = self
            .envd(Method::DELETE, &format!("/commands/{pid}"))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| send_error(&what, e))?;
        match check(resp, &what).await {
            Ok(_) => Ok(true),
            Err(SandboxError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let resp = self
            .envd(Method::GET, "/commands")
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| send_error("list processes", e))?;
        check(resp, "list processes")
            .await?
            .json()
            .await
            .map_err(|e| decode_error("list processes", e))
    }

    async fn read_file(&self, path: &str, user: Option<&str>) -> Result<Vec<u8>> {
        let what = format!("file {path}");
        let resp = self
            .envd(Method::GET, "/files")
            .timeout(CONTROL_TIMEOUT)
            .query(&Self::file_query(path, user))
            .send()
            .await
            .map_err(|e| send_error(&what, e))?;
        let bytes = check(resp, &what)
            .await?
            .bytes()
            .await
            .map_err(|e| decode_error(&what, e))?;
        Ok(bytes.to_vec())
    }

    async fn write_file(&self, path: &str, content: &[u8], user: Option<&str>) -> Result<()> {
        let what = format!("file {path}");
        let resp = self
            .envd(Method::POST, "/files")
            .timeout(CONTROL_TIMEOUT)
            .query(&Self::file_query(path, user))
            .header("Content-Type", "application/octet-stream")
            .body(content.to_vec())
            .send()
            .await
            .map_err(|e| send_error(&what, e))?;
        check(resp, &what).await?;
        Ok(())
    }

    fn download_url(&self, path: &str, user: Option<&str>) -> Result<String> {
        let base = format!("{}/files", self.envd_base());
        let url = url::Url::parse_with_params(&base, Self::file_query(path, user))
            .map_err(|e| SandboxError::Validation(format!("download url for {path}: {e}")))?;
        Ok(url.to_string())
    }

    fn host(&self, port: u16) -> String {
        format!("{port}-{}.{}", self.id, self.provider.inner.config.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(envd_url: Option<&str>) -> HttpProvider {
        HttpProvider::new(ProviderConfig {
            api_url: "https://api.e2b.dev".into(),
            api_key: "key".into(),
            domain: "e2b.app".into(),
            envd_url: envd_url.map(String::from),
        })
        .unwrap()
    }

    #[test]
    fn empty_api_key_is_missing_credential() {
        let err = HttpProvider::new(ProviderConfig {
            api_url: "https://api.e2b.dev".into(),
            api_key: "  ".into(),
            domain: "e2b.app".into(),
            envd_url: None,
        })
        .err()
        .unwrap();
        assert_eq!(err.kind(), "missing_credential");
    }

    #[test]
    fn handle_uses_stable_id_for_hosts_and_urls() {
        let sandbox = provider(None).handle("abc123-client");
        assert_eq!(sandbox.id(), "abc123");
        assert_eq!(sandbox.host(3000), "3000-abc123.e2b.app");

        let url = sandbox.download_url("/home/user/a b.txt", Some("user")).unwrap();
        assert!(url.starts_with("https://49983-abc123.e2b.app/files?"));
        assert!(url.contains("path=%2Fhome%2Fuser%2Fa+b.txt"));
        assert!(url.contains("username=user"));
    }

    #[test]
    fn envd_override_replaces_host_scheme() {
        let sandbox = provider(Some("http://127.0.0.1:9000/")).handle("abc123");
        let url = sandbox.download_url("/tmp/x", None).unwrap();
        assert_eq!(url, "http://127.0.0.1:9000/files?path=%2Ftmp%2Fx");
    }
}
