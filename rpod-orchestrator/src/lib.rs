//! Per-user session orchestration.
//!
//! The core of RPOD: decides whether a user's session is reused, replaced or
//! created fresh, picks its port, builds its workload description and
//! enforces the maximum lifetime. All state lives in the compute backend;
//! this crate only issues intents against it.

pub mod builder;
pub mod error;
pub mod locks;
pub mod naming;
pub mod reaper;
pub mod session;

pub use builder::{BuilderSettings, HostFilesystem, LocalFilesystem, WorkloadSpecBuilder};
pub use error::{ErrorKind, Result, SessionError};
pub use reaper::{ReapDecision, ReapPolicy, ReapReport, SessionReaper};
pub use session::{
    LaunchOutcome, OrchestratorSettings, SessionListing, SessionOrchestrator, SessionStatus,
    StopOutcome,
};
