//! Compute backend abstraction library.
//!
//! The session orchestrator only ever talks to a [`ComputeBackend`]. Two
//! realizations ship with the crate: a single-host container runtime driven
//! through the docker/podman CLI and a cluster scheduler driven through
//! `kubectl`. An in-memory backend is available behind the `test-helpers`
//! feature.

use std::sync::Arc;

use async_trait::async_trait;

pub mod command;
pub mod error;
pub mod spec;
pub mod state;

#[cfg(feature = "cluster")]
pub mod cluster;
#[cfg(feature = "container")]
pub mod container;

#[cfg(feature = "test-helpers")]
pub mod mock;

pub use error::{BackendError, Result};
pub use spec::{labels, HostPathKind, Mount, MountAccess, ResourceShape, WorkloadSpec};
pub use state::{Exposure, Phase, SessionState, WorkloadHandle, WorkloadSummary};

/// Capability interface for the substrate that runs sessions.
///
/// All operations are addressed by the derived session name. Everything
/// except [`create_and_start`](Self::create_and_start) is idempotent, and
/// any call may fail with [`BackendError::Unavailable`].
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Short backend identifier, e.g. `"container"` or `"cluster"`.
    fn name(&self) -> &'static str;

    /// Create and start a workload. Fails with `NameCollision` when the name
    /// is taken; the backend never resolves that on its own.
    async fn create_and_start(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle>;

    /// Current state. A missing workload is `Phase::Absent`, not an error.
    async fn inspect(&self, name: &str) -> Result<SessionState>;

    /// Make the workload reachable on `external_port` and return the port
    /// actually bound. An existing exposure is returned unchanged.
    async fn expose(&self, name: &str, container_port: u16, external_port: u16) -> Result<u16>;

    /// Port currently bound for the session, if any.
    async fn exposed_port(&self, name: &str) -> Result<Option<u16>>;

    /// Every externally reachable port currently held, RPOD-owned or not.
    async fn list_exposures(&self) -> Result<Vec<Exposure>>;

    /// Every RPOD session workload, whatever its phase.
    async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>>;

    /// Best-effort graceful stop. Absent or stopped is success.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Remove the workload. Absent is success.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Remove the exposure. Absent is success.
    async fn delete_exposure(&self, name: &str) -> Result<()>;
}

/// Which backend to build, with its settings.
#[derive(Debug, Clone)]
pub enum BackendSettings {
    #[cfg(feature = "container")]
    Container(container::ContainerSettings),
    #[cfg(feature = "cluster")]
    Cluster(cluster::ClusterSettings),
}

/// Creates a backend instance from its settings.
pub fn get_backend(settings: BackendSettings) -> Arc<dyn ComputeBackend> {
    match settings {
        #[cfg(feature = "container")]
        BackendSettings::Container(s) => Arc::new(container::ContainerBackend::new(s)),
        #[cfg(feature = "cluster")]
        BackendSettings::Cluster(s) => Arc::new(cluster::ClusterBackend::new(s)),
    }
}
