//! sandbox-sessions - session-bound remote sandboxes behind an HTTP API.
//!
//! Usage:
//!   sandbox-sessions serve [--port 8080]        # Start HTTP server
//!   sandbox-sessions action '<json request>'    # Run one action and print the envelope

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sandbox_sessions::client::HttpProvider;
use sandbox_sessions::config::{hidden_envs, Config};
use sandbox_sessions::http_server::{self, AppState};
use sandbox_sessions::reaper::spawn_reaper;
use sandbox_sessions::records::JsonRecordStore;
use sandbox_sessions::{Dispatcher, ManagerOptions, SandboxManager};

#[derive(Parser, Debug)]
#[command(name = "sandbox-sessions")]
#[command(about = "Session registry for remote sandboxes, with HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        #[command(flatten)]
        config: Config,
    },
    /// Dispatch a single JSON action request and print the response
    Action {
        /// Request object, e.g. '{"action":"list_sandboxes"}'
        request: String,

        #[command(flatten)]
        config: Config,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Args::parse().command {
        Commands::Serve { port, config } => {
            let manager = match build_manager(&config).await {
                Ok(manager) => Arc::new(manager),
                Err(e) => {
                    eprintln!("Error: {e}");
                    return ExitCode::FAILURE;
                }
            };
            if !config.no_reconcile {
                if let Err(e) = manager.reconcile().await {
                    warn!(error = %e, "record reconciliation skipped");
                }
            }
            let _reaper = spawn_reaper(
                manager.clone(),
                config.reap_interval(),
                config.idle_timeout(),
            );
            let state = AppState::new(Dispatcher::new(manager));
            if let Err(e) = http_server::run_server(port, state).await {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Commands::Action { request, config } => {
            let raw = match serde_json::from_str(&request) {
                Ok(raw) => raw,
                Err(e) => {
                    eprintln!("Error: request is not JSON: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let manager = match build_manager(&config).await {
                Ok(manager) => Arc::new(manager),
                Err(e) => {
                    eprintln!("Error: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let response = Dispatcher::new(manager).dispatch(raw).await;
            println!("{response}");
            if response["success"].as_bool().unwrap_or(false) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn build_manager(config: &Config) -> sandbox_sessions::Result<SandboxManager> {
    let provider = HttpProvider::new(config.provider_config()?)?;
    let records = JsonRecordStore::load(&config.records).await?;
    let options = ManagerOptions {
        template: config.template.clone(),
        default_timeout_minutes: config.default_timeout_minutes,
        hidden_envs: hidden_envs(),
    };
    info!(
        records = %records.path().display(),
        hidden_envs = options.hidden_envs.len(),
        template = %options.template,
        "session manager ready"
    );
    Ok(SandboxManager::new(
        Arc::new(provider),
        Arc::new(records),
        options,
    ))
}
