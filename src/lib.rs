//! Session registry and command lifecycle for remote sandboxes.
//!
//! A caller-chosen session id is bound to one ephemeral sandbox hosted by an
//! external service. [`manager::SandboxManager`] owns the binding,
//! [`executor::CommandExecutor`] runs work inside the sandbox, and
//! [`actions::Dispatcher`] turns JSON action requests into JSON envelopes.

pub mod actions;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod http_server;
pub mod manager;
pub mod provider;
pub mod reaper;
pub mod records;
pub mod state;

pub use actions::{ActionRequest, Dispatcher};
pub use error::{Result, SandboxError};
pub use manager::{ManagerOptions, SandboxManager};
pub use provider::{normalize_sandbox_id, RemoteSandbox, SandboxProvider};
