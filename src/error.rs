//! Error taxonomy shared by every layer of the service.

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("sandbox already exists for session {0}")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("sandbox service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("unsupported ecosystem: {0}")]
    UnsupportedEcosystem(String),

    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("record store error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SandboxError {
    /// Stable machine-readable tag carried in error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential(_) => "missing_credential",
            Self::AlreadyExists(_) => "already_exists",
            Self::NotFound(_) => "not_found",
            Self::RemoteUnavailable(_) => "remote_unavailable",
            Self::UnsupportedEcosystem(_) => "unsupported_ecosystem",
            Self::MissingParameter(_) => "missing_parameter",
            Self::Timeout(_) => "timeout",
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
        }
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
