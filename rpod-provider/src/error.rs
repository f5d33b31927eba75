//! Error types for compute backend operations.
//!
//! Every backend call reports one of these. `Unavailable` is the only
//! retryable kind; callers must never swallow it because it has to
//! short-circuit port bookkeeping.

use thiserror::Error;

/// Errors that can occur while driving a compute backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Transport or control plane unreachable, or the call timed out.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// A workload with the same derived name already exists.
    #[error("Workload name already in use: {0}")]
    NameCollision(String),

    /// The requested external port is already bound by another exposure.
    #[error("Port {0} is already bound")]
    PortInUse(u16),

    #[error("Workload not found: {0}")]
    WorkloadMissing(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Unexpected backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Whether a single immediate retry is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::InvalidResponse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
