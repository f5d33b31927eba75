use crate::error::ConfigError;
use crate::tier::TierTable;
use rpod_ports::PortRange;
use rpod_provider::cluster::ClusterSettings;
use rpod_provider::container::ContainerSettings;
use rpod_provider::BackendSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Which substrate runs the sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Container,
    Cluster,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Container => "container",
            BackendKind::Cluster => "cluster",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "podman" | "docker" => Ok(BackendKind::Container),
            "cluster" | "k8s" | "kubernetes" => Ok(BackendKind::Cluster),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// What launch does when a live session already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReusePolicy {
    #[default]
    PreferReuse,
    ForceReplace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,

    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    #[serde(default = "default_container_engine")]
    pub container_engine: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// `key=value` node selector for cluster pods.
    #[serde(default = "default_node_selector")]
    pub node_selector: Option<String>,

    #[serde(default = "default_image")]
    pub image: String,

    /// Host or node address used to build redirect targets.
    #[serde(default = "default_public_host")]
    pub public_host: String,

    #[serde(default = "default_port_range")]
    pub port_range: PortRange,

    #[serde(default = "default_container_port")]
    pub container_port: u16,

    #[serde(default = "default_max_session_secs")]
    pub max_session_secs: u64,

    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    #[serde(default = "default_warning_band_secs")]
    pub warning_band_secs: u64,

    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,

    #[serde(default = "default_shared_library_path")]
    pub shared_library_path: PathBuf,

    #[serde(default = "default_project_root_path")]
    pub project_root_path: PathBuf,

    #[serde(default = "default_user_homes_path")]
    pub user_homes_path: PathBuf,

    #[serde(default = "default_library_mount_path")]
    pub library_mount_path: PathBuf,

    #[serde(default = "default_project_mount_path")]
    pub project_mount_path: PathBuf,

    #[serde(default = "default_validate_host_paths")]
    pub validate_host_paths: bool,

    #[serde(default)]
    pub reuse_policy: ReusePolicy,

    /// Overrides the per-backend tier defaults when present.
    #[serde(default)]
    pub tiers: Option<TierTable>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn default_bind_addr() -> String {
    env_or("RPOD_BIND", "0.0.0.0:6124")
}

fn default_users_file() -> PathBuf {
    PathBuf::from(env_or("RPOD_USERS_FILE", "/app/config/users.yaml"))
}

fn default_backend() -> BackendKind {
    env_parse("RPOD_BACKEND", BackendKind::Container)
}

fn default_container_engine() -> String {
    env_or("RPOD_CONTAINER_ENGINE", "podman")
}

fn default_namespace() -> String {
    env_or("RPOD_K8S_NAMESPACE", "default")
}

fn default_node_selector() -> Option<String> {
    std::env::var("RPOD_NODE_SELECTOR")
        .ok()
        .filter(|s| !s.trim().is_empty())
}

fn default_image() -> String {
    env_or("RPOD_IMAGE", "localhost/rstudio-tier:latest")
}

fn default_public_host() -> String {
    env_or("RPOD_PUBLIC_HOST", "127.0.0.1")
}

fn default_port_range() -> PortRange {
    std::env::var("RPOD_PORT_RANGE")
        .ok()
        .and_then(|s| PortRange::parse(&s).ok())
        .unwrap_or(PortRange {
            start: 30810,
            end: 30900,
        })
}

fn default_container_port() -> u16 {
    env_parse("RPOD_CONTAINER_PORT", 8787)
}

fn default_max_session_secs() -> u64 {
    env_parse("RPOD_MAX_SESSION_SECS", 12 * 60 * 60)
}

fn default_reap_interval_secs() -> u64 {
    env_parse("RPOD_REAP_INTERVAL_SECS", 60 * 60)
}

fn default_warning_band_secs() -> u64 {
    env_parse("RPOD_WARNING_BAND_SECS", 30 * 60)
}

fn default_settle_delay_ms() -> u64 {
    env_parse("RPOD_SETTLE_DELAY_MS", 2000)
}

fn default_backend_timeout_secs() -> u64 {
    env_parse("RPOD_BACKEND_TIMEOUT_SECS", 60)
}

fn default_shared_library_path() -> PathBuf {
    PathBuf::from(env_or("RPOD_SHARED_LIBRARY", "/opt/shared-r-library"))
}

fn default_project_root_path() -> PathBuf {
    PathBuf::from(env_or("RPOD_PROJECT_ROOT", "/opt/project_center_mirror"))
}

fn default_user_homes_path() -> PathBuf {
    PathBuf::from(env_or("RPOD_USER_HOMES", "/opt/user_homes"))
}

fn default_library_mount_path() -> PathBuf {
    PathBuf::from("/usr/local/lib/R/site-library")
}

fn default_project_mount_path() -> PathBuf {
    PathBuf::from("/project-center")
}

fn default_validate_host_paths() -> bool {
    env_parse("RPOD_VALIDATE_HOST_PATHS", true)
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            users_file: default_users_file(),
            backend: default_backend(),
            container_engine: default_container_engine(),
            namespace: default_namespace(),
            node_selector: default_node_selector(),
            image: default_image(),
            public_host: default_public_host(),
            port_range: default_port_range(),
            container_port: default_container_port(),
            max_session_secs: default_max_session_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            warning_band_secs: default_warning_band_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            backend_timeout_secs: default_backend_timeout_secs(),
            shared_library_path: default_shared_library_path(),
            project_root_path: default_project_root_path(),
            user_homes_path: default_user_homes_path(),
            library_mount_path: default_library_mount_path(),
            project_mount_path: default_project_mount_path(),
            validate_host_paths: default_validate_host_paths(),
            reuse_policy: ReusePolicy::default(),
            tiers: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Parse a YAML file; keys it leaves out fall back to the environment.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_ng::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path`, else `RPOD_CONFIG`, else the environment alone,
    /// then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os("RPOD_CONFIG").map(PathBuf::from);
        let config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => {
                debug!(path = %path.display(), "loading service config");
                Self::from_file(&path)?
            }
            None => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_session_secs == 0 {
            return Err(ConfigError::Invalid(
                "max_session_secs must be greater than zero".into(),
            ));
        }
        if self.reap_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reap_interval_secs must be greater than zero".into(),
            ));
        }
        if self.warning_band_secs >= self.max_session_secs {
            return Err(ConfigError::Invalid(format!(
                "warning_band_secs ({}) must be smaller than max_session_secs ({})",
                self.warning_band_secs, self.max_session_secs
            )));
        }
        if self.container_port == 0 {
            return Err(ConfigError::Invalid("container_port must not be 0".into()));
        }
        if self.image.trim().is_empty() {
            return Err(ConfigError::Invalid("image must not be empty".into()));
        }
        if let Some(tiers) = &self.tiers {
            let missing = tiers.missing();
            if !missing.is_empty() {
                let names: Vec<&str> = missing.iter().map(|t| t.as_str()).collect();
                return Err(ConfigError::Invalid(format!(
                    "tier table is missing {}",
                    names.join(", ")
                )));
            }
        }
        self.parsed_node_selector()?;
        Ok(())
    }

    /// Configured tier table, or the defaults for the selected backend.
    pub fn tier_table(&self) -> TierTable {
        match (&self.tiers, self.backend) {
            (Some(tiers), _) => tiers.clone(),
            (None, BackendKind::Container) => TierTable::single_host(),
            (None, BackendKind::Cluster) => TierTable::cluster(),
        }
    }

    pub fn max_session(&self) -> Duration {
        Duration::from_secs(self.max_session_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn warning_band(&self) -> Duration {
        Duration::from_secs(self.warning_band_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    fn parsed_node_selector(&self) -> Result<Option<(String, String)>, ConfigError> {
        let Some(raw) = &self.node_selector else {
            return Ok(None);
        };
        match raw.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok(Some((key.trim().to_string(), value.trim().to_string())))
            }
            _ => Err(ConfigError::Invalid(format!(
                "node_selector must look like key=value, got '{raw}'"
            ))),
        }
    }

    /// Settings for the configured backend.
    pub fn backend_settings(&self) -> Result<BackendSettings, ConfigError> {
        let timeout = self.backend_timeout();
        Ok(match self.backend {
            BackendKind::Container => BackendSettings::Container(ContainerSettings {
                engine: self.container_engine.clone(),
                timeout,
                ..ContainerSettings::default()
            }),
            BackendKind::Cluster => BackendSettings::Cluster(ClusterSettings {
                namespace: self.namespace.clone(),
                node_selector: self.parsed_node_selector()?,
                timeout,
                ..ClusterSettings::default()
            }),
        })
    }
}
