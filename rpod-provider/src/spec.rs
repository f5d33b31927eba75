//! Backend-neutral workload description.
//!
//! A [`WorkloadSpec`] is built fresh for every launch and handed to a
//! [`ComputeBackend`](crate::ComputeBackend) by reference; backends translate
//! it into container run arguments or a pod manifest and never modify it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Label keys and values stamped on every workload and exposure.
pub mod labels {
    pub const APP: &str = "app";
    pub const APP_NAME: &str = "rstudio";
    pub const USER: &str = "user";
    pub const TIER: &str = "tier";
    pub const SESSION: &str = "session";
    pub const MANAGED_BY: &str = "managed-by";
    pub const MANAGER: &str = "rpod";
    /// Single-host backends record the published port here.
    pub const PORT: &str = "rpod.port";
}

/// Access mode for a mount.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MountAccess {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl MountAccess {
    pub fn is_read_only(self) -> bool {
        matches!(self, MountAccess::ReadOnly)
    }
}

impl fmt::Display for MountAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountAccess::ReadOnly => write!(f, "ro"),
            MountAccess::ReadWrite => write!(f, "rw"),
        }
    }
}

impl std::str::FromStr for MountAccess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ro" => Ok(MountAccess::ReadOnly),
            "rw" => Ok(MountAccess::ReadWrite),
            other => Err(format!("Invalid access mode '{other}'. Use 'ro' or 'rw'")),
        }
    }
}

/// How the host side of a mount is treated when the workload starts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostPathKind {
    /// Must already exist.
    #[default]
    Directory,
    /// Created by the runtime when missing.
    DirectoryOrCreate,
}

impl HostPathKind {
    /// The `hostPath.type` value a cluster scheduler expects.
    pub fn as_host_path_type(self) -> &'static str {
        match self {
            HostPathKind::Directory => "Directory",
            HostPathKind::DirectoryOrCreate => "DirectoryOrCreate",
        }
    }
}

/// A single host directory mapped into the workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mount {
    /// Identifier-safe volume name, unique within one spec.
    pub name: String,
    /// Source path on the host.
    pub source: PathBuf,
    /// Destination path inside the workload.
    pub target: PathBuf,
    pub access: MountAccess,
    #[serde(default)]
    pub host_kind: HostPathKind,
}

impl Mount {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        access: MountAccess,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            access,
            host_kind: HostPathKind::Directory,
        }
    }

    /// Mark the host side as created on demand.
    pub fn create_if_missing(mut self) -> Self {
        self.host_kind = HostPathKind::DirectoryOrCreate;
        self
    }

    /// `source:target:mode`, the form container runtimes take for `-v`.
    pub fn to_bind_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.source.display(),
            self.target.display(),
            self.access
        )
    }
}

/// CPU and memory shape for a workload.
///
/// CPU is expressed in millicores and memory in MiB so both backends can
/// render their own units without parsing quantity strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceShape {
    pub cpu_request_millis: u32,
    pub cpu_limit_millis: u32,
    pub memory_request_mib: u64,
    pub memory_limit_mib: u64,
}

impl ResourceShape {
    pub fn cpu_quantity(millis: u32) -> String {
        format!("{millis}m")
    }

    pub fn memory_quantity(mib: u64) -> String {
        format!("{mib}Mi")
    }

    /// Fractional CPU count, e.g. `2.000` for 2000 millicores.
    pub fn cpus(millis: u32) -> String {
        format!("{}.{:03}", millis / 1000, millis % 1000)
    }
}

/// The complete description of one user session.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadSpec {
    /// Derived session name, globally unique per user.
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceShape,
    /// Port the session listens on inside the workload.
    pub container_port: u16,
    /// Externally routable port chosen for this launch.
    pub external_port: u16,
    pub mounts: Vec<Mount>,
}

impl WorkloadSpec {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

// Environment values carry the user's credential, so only keys are printed.
impl fmt::Debug for WorkloadSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadSpec")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("labels", &self.labels)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("resources", &self.resources)
            .field("container_port", &self.container_port)
            .field("external_port", &self.external_port)
            .field("mounts", &self.mounts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_round_trips_through_str() {
        assert_eq!("ro".parse::<MountAccess>().unwrap(), MountAccess::ReadOnly);
        assert_eq!("rw".parse::<MountAccess>().unwrap(), MountAccess::ReadWrite);
        assert!("rx".parse::<MountAccess>().is_err());
        assert_eq!(MountAccess::ReadOnly.to_string(), "ro");
    }

    #[test]
    fn test_bind_string_keeps_spaces() {
        let mount = Mount::new(
            "project-ro",
            "/opt/mock/Project Center",
            "/project-center",
            MountAccess::ReadOnly,
        );
        assert_eq!(
            mount.to_bind_string(),
            "/opt/mock/Project Center:/project-center:ro"
        );
    }

    #[test]
    fn test_resource_units() {
        assert_eq!(ResourceShape::cpu_quantity(1500), "1500m");
        assert_eq!(ResourceShape::memory_quantity(4096), "4096Mi");
        assert_eq!(ResourceShape::cpus(2000), "2.000");
        assert_eq!(ResourceShape::cpus(250), "0.250");
    }

    #[test]
    fn test_debug_hides_env_values() {
        let mut env = BTreeMap::new();
        env.insert("PASSWORD".to_string(), "hunter2".to_string());
        let spec = WorkloadSpec {
            name: "session-alice".into(),
            image: "img".into(),
            labels: BTreeMap::new(),
            env,
            resources: ResourceShape {
                cpu_request_millis: 1000,
                cpu_limit_millis: 2000,
                memory_request_mib: 2048,
                memory_limit_mib: 4096,
            },
            container_port: 8787,
            external_port: 30810,
            mounts: Vec::new(),
        };
        let rendered = format!("{spec:?}");
        assert!(rendered.contains("PASSWORD"));
        assert!(!rendered.contains("hunter2"));
    }
}
