use rpod_config::{ServiceConfig, YamlUserDirectory};
use rpod_orchestrator::{
    BuilderSettings, LocalFilesystem, OrchestratorSettings, SessionOrchestrator,
    WorkloadSpecBuilder,
};
use rpod_ports::{PortAllocator, PortRange};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Static facts about the running service, reported by `/` and `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub backend: String,
    pub users_file: PathBuf,
    pub port_range: PortRange,
    pub max_session_hours: f64,
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SessionOrchestrator,
    pub info: Arc<ServiceInfo>,
}

impl AppState {
    pub fn new(orchestrator: SessionOrchestrator, info: ServiceInfo) -> Self {
        Self {
            orchestrator,
            info: Arc::new(info),
        }
    }

    /// Wire the configured backend, user directory and host filesystem.
    pub fn from_config(config: &ServiceConfig) -> anyhow::Result<Self> {
        let backend = rpod_provider::get_backend(config.backend_settings()?);
        let ports = PortAllocator::new(config.port_range, backend.clone());
        let builder = WorkloadSpecBuilder::new(
            BuilderSettings::from_config(config),
            Arc::new(LocalFilesystem),
        );
        let directory = Arc::new(YamlUserDirectory::new(&config.users_file));

        let info = ServiceInfo {
            backend: config.backend.to_string(),
            users_file: config.users_file.clone(),
            port_range: config.port_range,
            max_session_hours: config.max_session_secs as f64 / 3600.0,
        };
        let orchestrator = SessionOrchestrator::new(
            directory,
            backend,
            ports,
            builder,
            OrchestratorSettings::from_config(config),
        );

        Ok(Self::new(orchestrator, info))
    }
}
