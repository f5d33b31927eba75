use crate::range::PortRange;
use rpod_provider::BackendError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Invalid port range: {0}")]
    InvalidRange(String),

    #[error("No free port left in range {range}")]
    Exhausted { range: PortRange },

    /// A fixed port is held by another session.
    #[error("Port {port} is held by {holder}")]
    Taken { port: u16, holder: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}
