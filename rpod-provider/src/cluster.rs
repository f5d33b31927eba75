//! Cluster backend driving `kubectl`.
//!
//! A session is one Pod named after the session and one NodePort Service
//! named `<session>-svc`. The service is a separate object: it can exist
//! without the pod and is deleted on its own.

use crate::command::CliCommand;
use crate::error::{BackendError, Result};
use crate::spec::{labels, ResourceShape, WorkloadSpec};
use crate::state::{Exposure, Phase, SessionState, WorkloadHandle, WorkloadSummary};
use crate::ComputeBackend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const CONTAINER_NAME: &str = "rstudio";
const SERVICE_SUFFIX: &str = "-svc";

/// Settings for [`ClusterBackend`].
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub kubectl: String,
    pub namespace: String,
    /// Optional `key=value` node selector pinning sessions to a node.
    pub node_selector: Option<(String, String)>,
    pub timeout: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            namespace: "default".to_string(),
            node_selector: None,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterBackend {
    settings: ClusterSettings,
}

pub fn service_name(session: &str) -> String {
    format!("{session}{SERVICE_SUFFIX}")
}

impl ClusterBackend {
    pub fn new(settings: ClusterSettings) -> Self {
        Self { settings }
    }

    fn kubectl(&self) -> CliCommand {
        CliCommand::new(&self.settings.kubectl)
            .timeout(self.settings.timeout)
            .arg("--namespace")
            .arg(&self.settings.namespace)
    }

    pub(crate) fn pod_manifest(&self, spec: &WorkloadSpec) -> Value {
        let shape = &spec.resources;
        let env: Vec<Value> = spec
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        let volumes: Vec<Value> = spec
            .mounts
            .iter()
            .map(|m| {
                json!({
                    "name": m.name,
                    "hostPath": {
                        "path": m.source.to_string_lossy(),
                        "type": m.host_kind.as_host_path_type(),
                    }
                })
            })
            .collect();
        let volume_mounts: Vec<Value> = spec
            .mounts
            .iter()
            .map(|m| {
                json!({
                    "name": m.name,
                    "mountPath": m.target.to_string_lossy(),
                    "readOnly": m.access.is_read_only(),
                })
            })
            .collect();

        let mut pod_spec = json!({
            "restartPolicy": "Never",
            "containers": [{
                "name": CONTAINER_NAME,
                "image": spec.image,
                "imagePullPolicy": "IfNotPresent",
                "ports": [{ "containerPort": spec.container_port }],
                "env": env,
                "volumeMounts": volume_mounts,
                "resources": {
                    "requests": {
                        "cpu": ResourceShape::cpu_quantity(shape.cpu_request_millis),
                        "memory": ResourceShape::memory_quantity(shape.memory_request_mib),
                    },
                    "limits": {
                        "cpu": ResourceShape::cpu_quantity(shape.cpu_limit_millis),
                        "memory": ResourceShape::memory_quantity(shape.memory_limit_mib),
                    }
                }
            }],
            "volumes": volumes,
        });

        if let Some((key, value)) = &self.settings.node_selector {
            pod_spec["nodeSelector"] = json!({ key: value });
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": spec.name, "labels": spec.labels },
            "spec": pod_spec,
        })
    }

    pub(crate) fn service_manifest(name: &str, container_port: u16, external_port: u16) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": service_name(name),
                "labels": {
                    labels::APP: labels::APP_NAME,
                    labels::SESSION: name,
                    labels::MANAGED_BY: labels::MANAGER,
                }
            },
            "spec": {
                "type": "NodePort",
                "selector": { labels::APP: labels::APP_NAME, labels::SESSION: name },
                "ports": [{
                    "port": container_port,
                    "targetPort": container_port,
                    "nodePort": external_port,
                    "protocol": "TCP",
                }]
            }
        })
    }

    async fn create_object(&self, manifest: &Value, name: &str, port: Option<u16>) -> Result<String> {
        let output = self
            .kubectl()
            .args(["create", "-f", "-", "-o", "json"])
            .stdin(manifest.to_string())
            .output()
            .await?;

        output
            .into_result()
            .map_err(|stderr| classify_failure(&stderr, name, port))
    }

    /// `get <kind> <name>`; `None` when the object does not exist.
    async fn get_object(&self, kind: &str, name: &str) -> Result<Option<String>> {
        let output = self
            .kubectl()
            .args(["get", kind, name, "-o", "json", "--ignore-not-found"])
            .output()
            .await?;

        let stdout = output
            .into_result()
            .map_err(|stderr| classify_failure(&stderr, name, None))?;

        if stdout.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(stdout))
        }
    }

    async fn delete_object(&self, kind: &str, name: &str, wait: bool) -> Result<()> {
        let output = self
            .kubectl()
            .args([
                "delete".to_string(),
                kind.to_string(),
                name.to_string(),
                "--ignore-not-found".to_string(),
                format!("--wait={wait}"),
            ])
            .output()
            .await?;

        output
            .into_result()
            .map(|_| ())
            .map_err(|stderr| classify_failure(&stderr, name, None))
    }
}

#[async_trait]
impl ComputeBackend for ClusterBackend {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn create_and_start(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle> {
        let manifest = self.pod_manifest(spec);
        let stdout = self.create_object(&manifest, &spec.name, None).await?;
        let pod: PodRecord = serde_json::from_str(&stdout)?;
        info!(pod = %spec.name, namespace = %self.settings.namespace, "pod created");

        Ok(WorkloadHandle {
            name: spec.name.clone(),
            id: pod.metadata.uid.unwrap_or_default(),
        })
    }

    async fn inspect(&self, name: &str) -> Result<SessionState> {
        match self.get_object("pod", name).await? {
            Some(raw) => {
                let pod: PodRecord = serde_json::from_str(&raw)?;
                Ok(pod.state())
            }
            None => Ok(SessionState::absent()),
        }
    }

    async fn expose(&self, name: &str, container_port: u16, external_port: u16) -> Result<u16> {
        let manifest = Self::service_manifest(name, container_port, external_port);
        match self.create_object(&manifest, name, Some(external_port)).await {
            Ok(stdout) => {
                let service: ServiceRecord = serde_json::from_str(&stdout)?;
                let port = service.node_port().unwrap_or(external_port);
                info!(service = %service_name(name), port, "service created");
                Ok(port)
            }
            Err(BackendError::NameCollision(_)) => {
                debug!(service = %service_name(name), "service already exists");
                self.exposed_port(name).await?.ok_or_else(|| {
                    BackendError::InvalidResponse(format!(
                        "service {} exists but has no node port",
                        service_name(name)
                    ))
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn exposed_port(&self, name: &str) -> Result<Option<u16>> {
        match self.get_object("service", &service_name(name)).await? {
            Some(raw) => {
                let service: ServiceRecord = serde_json::from_str(&raw)?;
                Ok(service.node_port())
            }
            None => Ok(None),
        }
    }

    async fn list_exposures(&self) -> Result<Vec<Exposure>> {
        let output = self
            .kubectl()
            // Node ports are cluster-wide
            .args(["get", "services", "--all-namespaces", "-o", "json"])
            .output()
            .await?;
        let stdout = output
            .into_result()
            .map_err(|stderr| classify_failure(&stderr, "services", None))?;
        let list: ObjectList<ServiceRecord> = serde_json::from_str(&stdout)?;

        Ok(list
            .items
            .iter()
            .flat_map(|svc| {
                let owner = svc.owner();
                svc.node_ports().into_iter().map(move |port| Exposure {
                    owner: owner.clone(),
                    port,
                })
            })
            .collect())
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>> {
        let output = self
            .kubectl()
            .args([
                "get".to_string(),
                "pods".to_string(),
                "-l".to_string(),
                format!("{}={}", labels::APP, labels::APP_NAME),
                "-o".to_string(),
                "json".to_string(),
            ])
            .output()
            .await?;
        let stdout = output
            .into_result()
            .map_err(|stderr| classify_failure(&stderr, "pods", None))?;
        let list: ObjectList<PodRecord> = serde_json::from_str(&stdout)?;

        Ok(list.items.into_iter().map(PodRecord::into_summary).collect())
    }

    /// Pods cannot be paused; a graceful stop is a non-blocking delete.
    async fn stop(&self, name: &str) -> Result<()> {
        self.delete_object("pod", name, false).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.delete_object("pod", name, true).await
    }

    async fn delete_exposure(&self, name: &str) -> Result<()> {
        self.delete_object("service", &service_name(name), true)
            .await
    }
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    deletion_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodRecord {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
}

impl PodRecord {
    fn state(&self) -> SessionState {
        let phase = if self.metadata.deletion_timestamp.is_some() {
            Phase::Stopping
        } else {
            phase_from_pod(self.status.phase.as_deref())
        };
        let started_at = self
            .status
            .start_time
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc));
        SessionState::new(phase, started_at)
    }

    fn into_summary(self) -> WorkloadSummary {
        let state = self.state();
        WorkloadSummary {
            username: self.metadata.labels.get(labels::USER).cloned(),
            tier: self.metadata.labels.get(labels::TIER).cloned(),
            name: self.metadata.name,
            state,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceRecord {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: ServiceSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceSpec {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    ports: Vec<ServicePort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServicePort {
    #[serde(default)]
    node_port: Option<u16>,
}

impl ServiceRecord {
    fn node_ports(&self) -> Vec<u16> {
        match self.spec.kind.as_deref() {
            Some("NodePort") | Some("LoadBalancer") => {
                self.spec.ports.iter().filter_map(|p| p.node_port).collect()
            }
            _ => Vec::new(),
        }
    }

    fn node_port(&self) -> Option<u16> {
        self.node_ports().into_iter().next()
    }

    fn owner(&self) -> Option<String> {
        if self.metadata.labels.get(labels::APP).map(String::as_str) != Some(labels::APP_NAME) {
            return None;
        }
        self.metadata
            .labels
            .get(labels::SESSION)
            .cloned()
            .or_else(|| {
                self.metadata
                    .name
                    .strip_suffix(SERVICE_SUFFIX)
                    .map(str::to_string)
            })
    }
}

pub(crate) fn phase_from_pod(phase: Option<&str>) -> Phase {
    match phase {
        Some("Pending") => Phase::Starting,
        Some("Running") => Phase::Running,
        Some("Succeeded") | Some("Failed") => Phase::Stopped,
        _ => Phase::Unknown,
    }
}

pub(crate) fn classify_failure(stderr: &str, name: &str, port: Option<u16>) -> BackendError {
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("unable to connect to the server")
        || lower.contains("connection refused")
        || lower.contains("i/o timeout")
        || lower.contains("serviceunavailable")
        || lower.contains("the server is currently unable")
    {
        return BackendError::Unavailable(stderr.trim().to_string());
    }

    if lower.contains("alreadyexists") || lower.contains("already exists") {
        return BackendError::NameCollision(name.to_string());
    }

    if let Some(port) = port {
        if lower.contains("provided port is already allocated") {
            return BackendError::PortInUse(port);
        }
    }

    BackendError::CommandFailed(stderr.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Mount, MountAccess};
    use std::collections::BTreeMap;

    fn backend() -> ClusterBackend {
        ClusterBackend::new(ClusterSettings {
            node_selector: Some(("kubernetes.io/hostname".into(), "researchpc".into())),
            ..Default::default()
        })
    }

    fn spec() -> WorkloadSpec {
        let mut labels_map = BTreeMap::new();
        labels_map.insert(labels::APP.to_string(), labels::APP_NAME.to_string());
        labels_map.insert(labels::SESSION.to_string(), "session-alice".to_string());
        let mut env = BTreeMap::new();
        env.insert("TIER".to_string(), "tier1".to_string());

        WorkloadSpec {
            name: "session-alice".into(),
            image: "localhost/rstudio-tier:latest".into(),
            labels: labels_map,
            env,
            resources: ResourceShape {
                cpu_request_millis: 1000,
                cpu_limit_millis: 2000,
                memory_request_mib: 2048,
                memory_limit_mib: 4096,
            },
            container_port: 8787,
            external_port: 30810,
            mounts: vec![
                Mount::new("user-home", "/opt/user_homes/alice", "/home/alice", MountAccess::ReadWrite)
                    .create_if_missing(),
                Mount::new(
                    "shared-rlib",
                    "/opt/shared-r-library",
                    "/usr/local/lib/R/site-library",
                    MountAccess::ReadOnly,
                ),
            ],
        }
    }

    #[test]
    fn test_pod_manifest() {
        let manifest = backend().pod_manifest(&spec());
        assert_eq!(manifest["kind"], "Pod");
        assert_eq!(manifest["metadata"]["name"], "session-alice");
        assert_eq!(manifest["metadata"]["labels"]["app"], "rstudio");
        assert_eq!(
            manifest["spec"]["nodeSelector"]["kubernetes.io/hostname"],
            "researchpc"
        );

        let container = &manifest["spec"]["containers"][0];
        assert_eq!(container["ports"][0]["containerPort"], 8787);
        assert_eq!(container["resources"]["limits"]["cpu"], "2000m");
        assert_eq!(container["resources"]["requests"]["memory"], "2048Mi");
        assert_eq!(container["env"][0]["name"], "TIER");
        assert_eq!(container["volumeMounts"][0]["readOnly"], false);
        assert_eq!(container["volumeMounts"][1]["readOnly"], true);

        let volumes = &manifest["spec"]["volumes"];
        assert_eq!(volumes[0]["hostPath"]["type"], "DirectoryOrCreate");
        assert_eq!(volumes[1]["hostPath"]["type"], "Directory");
    }

    #[test]
    fn test_service_manifest() {
        let manifest = ClusterBackend::service_manifest("session-alice", 8787, 30811);
        assert_eq!(manifest["metadata"]["name"], "session-alice-svc");
        assert_eq!(manifest["spec"]["type"], "NodePort");
        assert_eq!(manifest["spec"]["selector"]["session"], "session-alice");
        assert_eq!(manifest["spec"]["ports"][0]["nodePort"], 30811);
    }

    #[test]
    fn test_pod_record_state() {
        let raw = r#"{"metadata":{"name":"session-alice","labels":{"user":"alice","tier":"tier3"}},
            "status":{"phase":"Running","startTime":"2024-05-01T08:00:00Z"}}"#;
        let pod: PodRecord = serde_json::from_str(raw).unwrap();
        let summary = pod.into_summary();
        assert_eq!(summary.username.as_deref(), Some("alice"));
        assert_eq!(summary.tier.as_deref(), Some("tier3"));
        assert_eq!(summary.state.phase, Phase::Running);
        assert!(summary.state.started_at.is_some());

        let terminating = r#"{"metadata":{"name":"session-bob","deletionTimestamp":"2024-05-01T09:00:00Z"},
            "status":{"phase":"Running"}}"#;
        let pod: PodRecord = serde_json::from_str(terminating).unwrap();
        assert_eq!(pod.state().phase, Phase::Stopping);

        let pending = r#"{"metadata":{"name":"session-carol"},"status":{"phase":"Pending"}}"#;
        let pod: PodRecord = serde_json::from_str(pending).unwrap();
        assert_eq!(pod.state(), SessionState::new(Phase::Starting, None));
    }

    #[test]
    fn test_service_listing_owners() {
        let raw = r#"{"items":[
            {"metadata":{"name":"session-alice-svc","labels":{"app":"rstudio","session":"session-alice"}},
             "spec":{"type":"NodePort","ports":[{"nodePort":30810}]}},
            {"metadata":{"name":"grafana"},"spec":{"type":"NodePort","ports":[{"nodePort":30812}]}},
            {"metadata":{"name":"kubernetes"},"spec":{"type":"ClusterIP","ports":[{"port":443}]}}
        ]}"#;
        let list: ObjectList<ServiceRecord> = serde_json::from_str(raw).unwrap();
        let owners: Vec<_> = list.items.iter().map(|s| (s.owner(), s.node_port())).collect();
        assert_eq!(
            owners,
            vec![
                (Some("session-alice".to_string()), Some(30810)),
                (None, Some(30812)),
                (None, None),
            ]
        );
    }

    #[test]
    fn test_classify_failures() {
        let exists = classify_failure(
            "Error from server (AlreadyExists): pods \"session-alice\" already exists",
            "session-alice",
            None,
        );
        assert_eq!(exists, BackendError::NameCollision("session-alice".into()));

        let port = classify_failure(
            "The Service \"session-bob-svc\" is invalid: spec.ports[0].nodePort: Invalid value: 30810: provided port is already allocated",
            "session-bob",
            Some(30810),
        );
        assert_eq!(port, BackendError::PortInUse(30810));

        let down = classify_failure(
            "Unable to connect to the server: dial tcp 10.0.0.1:6443: i/o timeout",
            "session-alice",
            None,
        );
        assert!(down.is_retryable());
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(phase_from_pod(Some("Pending")), Phase::Starting);
        assert_eq!(phase_from_pod(Some("Failed")), Phase::Stopped);
        assert_eq!(phase_from_pod(None), Phase::Unknown);
    }
}
