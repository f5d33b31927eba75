//! Single-host backend driving a docker-compatible CLI (`podman` or `docker`).
//!
//! The exposure of a container is its published port mapping, fixed at
//! creation time and recorded in the `rpod.port` label. It disappears with the
//! container, so [`delete_exposure`](ComputeBackend::delete_exposure) has
//! nothing to do here.

use crate::command::{CliCommand, CommandOutput};
use crate::error::{BackendError, Result};
use crate::spec::{labels, ResourceShape, WorkloadSpec};
use crate::state::{Exposure, Phase, SessionState, WorkloadHandle, WorkloadSummary};
use crate::ComputeBackend;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settings for [`ContainerBackend`].
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// CLI binary, e.g. `podman` or `docker`.
    pub engine: String,
    pub timeout: Duration,
    /// Seconds the runtime waits before killing on stop.
    pub stop_grace_secs: u32,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            engine: "podman".to_string(),
            timeout: Duration::from_secs(60),
            stop_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerBackend {
    settings: ContainerSettings,
}

impl ContainerBackend {
    pub fn new(settings: ContainerSettings) -> Self {
        Self { settings }
    }

    fn command(&self) -> CliCommand {
        CliCommand::new(&self.settings.engine).timeout(self.settings.timeout)
    }

    /// Arguments for `run` minus the program name. Environment values are
    /// passed through the child environment (`-e KEY`) so they never appear
    /// on the command line.
    pub(crate) fn run_args(spec: &WorkloadSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];

        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push("--label".to_string());
        args.push(format!("{}={}", labels::PORT, spec.external_port));

        for key in spec.env.keys() {
            args.push("-e".to_string());
            args.push(key.clone());
        }

        let shape = &spec.resources;
        args.push("--cpus".to_string());
        args.push(ResourceShape::cpus(shape.cpu_limit_millis));
        args.push("--memory".to_string());
        args.push(format!("{}m", shape.memory_limit_mib));
        args.push("--memory-reservation".to_string());
        args.push(format!("{}m", shape.memory_request_mib));

        args.push("-p".to_string());
        args.push(format!("{}:{}", spec.external_port, spec.container_port));

        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(mount.to_bind_string());
        }

        args.push(spec.image.clone());
        args
    }

    async fn inspect_record(&self, name: &str) -> Result<Option<ContainerRecord>> {
        let output = self
            .command()
            .args(["inspect", "--type", "container", name])
            .output()
            .await?;

        match output.into_result() {
            Ok(stdout) => {
                let mut records: Vec<ContainerRecord> = serde_json::from_str(&stdout)?;
                Ok(records.pop())
            }
            Err(stderr) if is_missing(&stderr) => Ok(None),
            Err(stderr) => Err(classify_failure(&stderr, name, None)),
        }
    }

    async fn session_names(&self) -> Result<Vec<String>> {
        let output = self
            .command()
            .args([
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("label={}={}", labels::APP, labels::APP_NAME),
                "--filter".to_string(),
                format!("label={}={}", labels::MANAGED_BY, labels::MANAGER),
                "--format".to_string(),
                "{{.Names}}".to_string(),
            ])
            .output()
            .await?;

        let stdout = output
            .into_result()
            .map_err(|stderr| classify_failure(&stderr, "ps", None))?;

        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Every session container, inspected in one call.
    async fn records(&self) -> Result<Vec<ContainerRecord>> {
        let names = self.session_names().await?;
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let output = self
            .command()
            .args(["inspect", "--type", "container"])
            .args(names)
            .output()
            .await?;
        parse_records(output)
    }

    async fn force_remove(&self, name: &str) -> Result<()> {
        let output = self.command().args(["rm", "-f", name]).output().await?;
        match output.into_result() {
            Ok(_) => Ok(()),
            Err(stderr) if is_missing(&stderr) => Ok(()),
            Err(stderr) => Err(classify_failure(&stderr, name, None)),
        }
    }
}

#[async_trait]
impl ComputeBackend for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn create_and_start(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle> {
        let mut cmd = self.command().args(Self::run_args(spec));
        for (key, value) in &spec.env {
            cmd = cmd.env(key, value);
        }

        let output = cmd.output().await?;
        match output.into_result() {
            Ok(stdout) => {
                let id = stdout.trim().to_string();
                info!(container = %spec.name, id = %id, port = spec.external_port, "container started");
                Ok(WorkloadHandle {
                    name: spec.name.clone(),
                    id,
                })
            }
            Err(stderr) => {
                let err = classify_failure(&stderr, &spec.name, Some(spec.external_port));
                // `run` leaves a created container behind when start fails;
                // a name collision means the container is someone else's.
                if !matches!(err, BackendError::NameCollision(_)) {
                    if let Err(cleanup) = self.force_remove(&spec.name).await {
                        warn!(container = %spec.name, error = %cleanup, "cleanup after failed run did not complete");
                    }
                }
                Err(err)
            }
        }
    }

    async fn inspect(&self, name: &str) -> Result<SessionState> {
        Ok(self
            .inspect_record(name)
            .await?
            .map(|record| record.state())
            .unwrap_or_else(SessionState::absent))
    }

    async fn expose(&self, name: &str, _container_port: u16, external_port: u16) -> Result<u16> {
        let record = self
            .inspect_record(name)
            .await?
            .ok_or_else(|| BackendError::WorkloadMissing(name.to_string()))?;

        match record.published_port() {
            Some(port) => {
                if port != external_port {
                    warn!(container = %name, requested = external_port, bound = port, "container already published on a different port");
                }
                Ok(port)
            }
            None => Err(BackendError::CommandFailed(format!(
                "container {name} has no published port; it must be recreated"
            ))),
        }
    }

    async fn exposed_port(&self, name: &str) -> Result<Option<u16>> {
        Ok(self
            .inspect_record(name)
            .await?
            .and_then(|record| record.published_port()))
    }

    async fn list_exposures(&self) -> Result<Vec<Exposure>> {
        Ok(self
            .records()
            .await?
            .into_iter()
            .filter_map(|record| {
                record.published_port().map(|port| Exposure {
                    owner: Some(record.name()),
                    port,
                })
            })
            .collect())
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>> {
        Ok(self
            .records()
            .await?
            .into_iter()
            .map(ContainerRecord::into_summary)
            .collect())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let output = self
            .command()
            .args([
                "stop".to_string(),
                "-t".to_string(),
                self.settings.stop_grace_secs.to_string(),
                name.to_string(),
            ])
            .output()
            .await?;

        match output.into_result() {
            Ok(_) => Ok(()),
            Err(stderr) if is_missing(&stderr) => {
                debug!(container = %name, "stop: container already absent");
                Ok(())
            }
            Err(stderr) => Err(classify_failure(&stderr, name, None)),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.force_remove(name).await
    }

    async fn delete_exposure(&self, name: &str) -> Result<()> {
        debug!(container = %name, "port mapping is removed with the container");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerRecord {
    name: String,
    state: ContainerState,
    #[serde(default)]
    config: Option<ContainerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    status: String,
    #[serde(default)]
    started_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

impl ContainerRecord {
    /// Docker prefixes names with `/`, podman does not.
    fn name(&self) -> String {
        self.name.trim_start_matches('/').to_string()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    fn published_port(&self) -> Option<u16> {
        self.label(labels::PORT).and_then(|p| p.parse().ok())
    }

    fn state(&self) -> SessionState {
        SessionState::new(
            phase_from_status(&self.state.status),
            self.state.started_at.as_deref().and_then(parse_started_at),
        )
    }

    fn into_summary(self) -> WorkloadSummary {
        WorkloadSummary {
            name: self.name(),
            username: self.label(labels::USER).map(str::to_string),
            tier: self.label(labels::TIER).map(str::to_string),
            state: self.state(),
        }
    }
}

pub(crate) fn phase_from_status(status: &str) -> Phase {
    match status.to_ascii_lowercase().as_str() {
        "created" | "configured" | "initialized" | "restarting" => Phase::Starting,
        "running" | "paused" => Phase::Running,
        "removing" | "stopping" => Phase::Stopping,
        "exited" | "dead" | "stopped" => Phase::Stopped,
        _ => Phase::Unknown,
    }
}

/// Runtimes report `0001-01-01T00:00:00Z` for never-started containers.
pub(crate) fn parse_started_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
        .filter(|ts| ts.year() > 1)
}

/// A container can vanish between listing and inspection; `inspect` then
/// exits non-zero but still prints the containers it found.
fn parse_records(output: CommandOutput) -> Result<Vec<ContainerRecord>> {
    if !output.success && !is_missing(&output.stderr) {
        return Err(classify_failure(&output.stderr, "inspect", None));
    }
    let stdout = output.stdout.trim();
    if stdout.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(stdout)?)
}

fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

pub(crate) fn classify_failure(stderr: &str, name: &str, port: Option<u16>) -> BackendError {
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("cannot connect")
        || lower.contains("connection refused")
        || lower.contains("is the docker daemon running")
        || lower.contains("unable to connect to podman")
    {
        return BackendError::Unavailable(stderr.trim().to_string());
    }

    if lower.contains("already in use") && lower.contains("name") {
        return BackendError::NameCollision(name.to_string());
    }

    if let Some(port) = port {
        if lower.contains("port is already allocated")
            || lower.contains("address already in use")
        {
            return BackendError::PortInUse(port);
        }
    }

    BackendError::CommandFailed(stderr.trim().to_string())
}
