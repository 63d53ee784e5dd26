//! Service configuration: CLI flags with environment fallbacks, plus the
//! operator's hidden sandbox environment variables.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::client::ProviderConfig;
use crate::error::{Result, SandboxError};

/// Prefix marking operator secrets injected into every sandbox.
pub const HIDDEN_ENV_PREFIX: &str = "E2B_CODE_EV_";

/// Sandbox lifetime when `create` gives no timeout.
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 60;

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// API key for the sandbox service
    #[arg(long, env = "E2B_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Control-plane base URL
    #[arg(long, env = "E2B_API_URL", default_value = "https://api.e2b.dev")]
    pub api_url: String,

    /// Domain under which sandbox hosts are exposed
    #[arg(long, env = "E2B_DOMAIN", default_value = "e2b.app")]
    pub domain: String,

    /// Fixed data-plane URL (local testing against a single daemon)
    #[arg(long, env = "E2B_ENVD_URL")]
    pub envd_url: Option<String>,

    /// Sandbox template to boot
    #[arg(long, env = "E2B_TEMPLATE", default_value = "base")]
    pub template: String,

    /// JSON file holding session-to-sandbox records
    #[arg(long, env = "SANDBOX_RECORDS", default_value = "data/sandboxes.json")]
    pub records: PathBuf,

    /// Seconds between idle sweeps
    #[arg(long, default_value = "300")]
    pub reap_interval_secs: u64,

    /// Seconds without activity before a session is reaped
    #[arg(long, default_value = "1800")]
    pub idle_timeout_secs: u64,

    /// Sandbox lifetime in minutes when `create` gives none
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MINUTES)]
    pub default_timeout_minutes: u64,

    /// Skip reconciling stored records against the remote service at startup
    #[arg(long)]
    pub no_reconcile: bool,
}

impl Config {
    /// Connection settings for the HTTP provider. Fails with
    /// `MissingCredential` when no API key is configured.
    pub fn provider_config(&self) -> Result<ProviderConfig> {
        let api_key = self
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| SandboxError::MissingCredential("E2B_API_KEY".into()))?;
        Ok(ProviderConfig {
            api_url: self.api_url.clone(),
            api_key,
            domain: self.domain.clone(),
            envd_url: self.envd_url.clone(),
        })
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Collect hidden variables from `vars`, stripping [`HIDDEN_ENV_PREFIX`].
/// Entries that are not valid UTF-8, or whose name is empty after
/// stripping, are ignored.
pub fn hidden_envs_from<I>(vars: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| {
            let key = key.into_string().ok()?;
            let name = key.strip_prefix(HIDDEN_ENV_PREFIX)?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.into_string().ok()?))
        })
        .collect()
}

/// Hidden variables from the process environment.
pub fn hidden_envs() -> HashMap<String, String> {
    hidden_envs_from(std::env::vars_os())
}
