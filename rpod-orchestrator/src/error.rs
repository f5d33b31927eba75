use rpod_config::DirectoryError;
use rpod_ports::PortError;
use rpod_provider::BackendError;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Machine-readable error category, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Configuration,
    MissingHostPath,
    ResourceExhausted,
    BackendUnavailable,
    NameCollision,
    Backend,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Configuration => "configuration",
            ErrorKind::MissingHostPath => "missing_host_path",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::NameCollision => "name_collision",
            ErrorKind::Backend => "backend",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only error type returned by the orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("User not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Required host path missing: {}", .0.display())]
    MissingHostPath(PathBuf),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Name collision: {0}")]
    NameCollision(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::InvalidInput(_) => ErrorKind::InvalidInput,
            SessionError::Configuration(_) => ErrorKind::Configuration,
            SessionError::MissingHostPath(_) => ErrorKind::MissingHostPath,
            SessionError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            SessionError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            SessionError::NameCollision(_) => ErrorKind::NameCollision,
            SessionError::Backend(_) => ErrorKind::Backend,
            SessionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Worth retrying later without any change on the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceExhausted | ErrorKind::BackendUnavailable | ErrorKind::NameCollision
        )
    }
}

impl From<BackendError> for SessionError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => SessionError::BackendUnavailable(msg),
            BackendError::NameCollision(name) => {
                SessionError::NameCollision(format!("workload '{name}' already exists"))
            }
            BackendError::PortInUse(port) => {
                SessionError::ResourceExhausted(format!("port {port} is already bound"))
            }
            other => SessionError::Backend(other.to_string()),
        }
    }
}

impl From<DirectoryError> for SessionError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(user) => SessionError::NotFound(user),
            DirectoryError::Configuration(msg) => SessionError::Configuration(msg),
        }
    }
}

impl From<PortError> for SessionError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Exhausted { .. } | PortError::Taken { .. } => {
                SessionError::ResourceExhausted(err.to_string())
            }
            PortError::InvalidRange(msg) => SessionError::Configuration(msg),
            PortError::Backend(e) => e.into(),
        }
    }
}

impl From<JoinError> for SessionError {
    fn from(err: JoinError) -> Self {
        SessionError::Internal(format!("session task failed: {err}"))
    }
}
