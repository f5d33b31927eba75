//! Turns a user profile and a port into a [`WorkloadSpec`].

use crate::error::{Result, SessionError};
use crate::naming::{is_safe_segment, project_mount_name, session_name};
use rpod_config::{ServiceConfig, TierLimits, TierTable, UserProfile};
use rpod_provider::{labels, Mount, MountAccess, WorkloadSpec};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Host filesystem checks made before a launch touches the backend.
pub trait HostFilesystem: Send + Sync {
    fn is_dir(&self, path: &Path) -> bool;

    /// Create `path` and its parents if absent.
    fn ensure_dir(&self, path: &Path) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFilesystem;

impl HostFilesystem for LocalFilesystem {
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn ensure_dir(&self, path: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(path)
    }
}

#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub image: String,
    pub container_port: u16,
    pub shared_library_path: PathBuf,
    pub project_root_path: PathBuf,
    pub user_homes_path: PathBuf,
    pub library_mount_path: PathBuf,
    pub project_mount_path: PathBuf,
    pub validate_host_paths: bool,
    pub tiers: TierTable,
}

impl BuilderSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            image: config.image.clone(),
            container_port: config.container_port,
            shared_library_path: config.shared_library_path.clone(),
            project_root_path: config.project_root_path.clone(),
            user_homes_path: config.user_homes_path.clone(),
            library_mount_path: config.library_mount_path.clone(),
            project_mount_path: config.project_mount_path.clone(),
            validate_host_paths: config.validate_host_paths,
            tiers: config.tier_table(),
        }
    }
}

pub struct WorkloadSpecBuilder {
    settings: BuilderSettings,
    fs: Arc<dyn HostFilesystem>,
}

impl WorkloadSpecBuilder {
    pub fn new(settings: BuilderSettings, fs: Arc<dyn HostFilesystem>) -> Self {
        Self { settings, fs }
    }

    pub fn limits(&self, profile: &UserProfile) -> Result<TierLimits> {
        self.settings.tiers.get(profile.tier).copied().ok_or_else(|| {
            SessionError::Configuration(format!("no limits configured for {}", profile.tier))
        })
    }

    /// Host directory backing the user's home mount.
    pub fn host_home(&self, profile: &UserProfile) -> PathBuf {
        self.settings.user_homes_path.join(&profile.username)
    }

    /// Check required host paths and create the user's home directory.
    ///
    /// Runs before any backend call so a failed precondition never leaves a
    /// half-created session behind.
    pub fn preflight(&self, profile: &UserProfile) -> Result<()> {
        if !self.settings.validate_host_paths {
            return Ok(());
        }

        for required in [
            &self.settings.shared_library_path,
            &self.settings.project_root_path,
        ] {
            if !self.fs.is_dir(required) {
                return Err(SessionError::MissingHostPath(required.clone()));
            }
        }

        let home = self.host_home(profile);
        if !self.fs.is_dir(&home) {
            self.fs.ensure_dir(&home).map_err(|e| {
                warn!(path = %home.display(), error = %e, "cannot create user home");
                SessionError::MissingHostPath(home.clone())
            })?;
            debug!(path = %home.display(), "created user home");
        }
        Ok(())
    }

    /// Pure: the same profile and port always give the same spec.
    pub fn build(&self, profile: &UserProfile, port: u16) -> Result<WorkloadSpec> {
        let limits = self.limits(profile)?;
        let name = session_name(&profile.username);
        let tier = profile.tier.to_string();

        let labels = BTreeMap::from([
            (labels::APP.to_string(), labels::APP_NAME.to_string()),
            (labels::USER.to_string(), profile.username.clone()),
            (labels::TIER.to_string(), tier.clone()),
            (labels::SESSION.to_string(), name.clone()),
            (labels::MANAGED_BY.to_string(), labels::MANAGER.to_string()),
        ]);

        let home = profile.home.display().to_string();
        let env = BTreeMap::from([
            ("USERNAME".to_string(), profile.username.clone()),
            ("USER".to_string(), profile.username.clone()),
            ("PASSWORD".to_string(), profile.password.clone()),
            ("USER_HOME".to_string(), home),
            ("TIER".to_string(), tier),
        ]);

        let mut mounts = vec![
            Mount::new(
                "user-home",
                self.host_home(profile),
                &profile.home,
                MountAccess::ReadWrite,
            )
            .create_if_missing(),
            Mount::new(
                "shared-r-library",
                &self.settings.shared_library_path,
                &self.settings.library_mount_path,
                MountAccess::ReadOnly,
            ),
            Mount::new(
                "project-center",
                &self.settings.project_root_path,
                &self.settings.project_mount_path,
                MountAccess::ReadOnly,
            ),
        ];
        mounts.extend(self.project_mounts(profile));

        Ok(WorkloadSpec {
            name,
            image: self.settings.image.clone(),
            labels,
            env,
            resources: limits.shape,
            container_port: self.settings.container_port,
            external_port: port,
            mounts,
        })
    }

    /// One read-write mount per granted (base, folder) pair.
    ///
    /// Grants with an empty base, no folders, or segments that could escape
    /// the project root are skipped. A destination already taken keeps its
    /// first mount.
    pub fn project_mounts(&self, profile: &UserProfile) -> Vec<Mount> {
        let mut seen = HashSet::new();
        let mut mounts = Vec::new();

        for (idx, grant) in profile.projects.iter().enumerate() {
            if grant.base.is_empty() || grant.folders.is_empty() {
                continue;
            }
            if !is_safe_segment(&grant.base) {
                warn!(user = %profile.username, base = %grant.base, "skipping unsafe project base");
                continue;
            }

            for folder in &grant.folders {
                if !is_safe_segment(folder) {
                    warn!(
                        user = %profile.username,
                        base = %grant.base,
                        folder = %folder,
                        "skipping unsafe project folder"
                    );
                    continue;
                }

                let target = self.settings.project_mount_path.join(&grant.base).join(folder);
                if !seen.insert(target.clone()) {
                    continue;
                }
                let source = self.settings.project_root_path.join(&grant.base).join(folder);
                mounts.push(Mount::new(
                    project_mount_name(&grant.base, idx, folder),
                    source,
                    target,
                    MountAccess::ReadWrite,
                ));
            }
        }
        mounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpod_config::{ProjectGrant, Tier};
    use rpod_provider::HostPathKind;
    use tempfile::TempDir;

    fn settings(root: &Path) -> BuilderSettings {
        BuilderSettings {
            image: "rstudio:test".into(),
            container_port: 8787,
            shared_library_path: root.join("lib"),
            project_root_path: root.join("projects"),
            user_homes_path: root.join("homes"),
            library_mount_path: "/usr/local/lib/R/site-library".into(),
            project_mount_path: "/project-center".into(),
            validate_host_paths: true,
            tiers: TierTable::cluster(),
        }
    }

    fn builder(root: &Path) -> WorkloadSpecBuilder {
        WorkloadSpecBuilder::new(settings(root), Arc::new(LocalFilesystem))
    }

    fn profile() -> UserProfile {
        UserProfile::new("alice", Tier::Tier2, "s3cret")
            .with_project(ProjectGrant::new("Genomics", &["raw", "results"]))
    }

    #[test]
    fn test_build_base_mounts_env_and_labels() {
        let root = TempDir::new().unwrap();
        let spec = builder(root.path()).build(&profile(), 30811).unwrap();

        assert_eq!(spec.name, "session-alice");
        assert_eq!(spec.external_port, 30811);
        assert_eq!(spec.container_port, 8787);
        assert_eq!(spec.resources.cpu_request_millis, 2000);
        assert_eq!(spec.label(labels::APP), Some("rstudio"));
        assert_eq!(spec.label(labels::TIER), Some("tier2"));
        assert_eq!(spec.env["PASSWORD"], "s3cret");
        assert_eq!(spec.env["USER_HOME"], "/home/alice");

        let home = &spec.mounts[0];
        assert_eq!(home.source, root.path().join("homes/alice"));
        assert_eq!(home.target, PathBuf::from("/home/alice"));
        assert_eq!(home.access, MountAccess::ReadWrite);
        assert_eq!(home.host_kind, HostPathKind::DirectoryOrCreate);

        assert!(spec.mounts[1].access.is_read_only());
        assert!(spec.mounts[2].access.is_read_only());
        assert_eq!(spec.mounts[2].target, PathBuf::from("/project-center"));
    }

    #[test]
    fn test_project_mounts() {
        let root = TempDir::new().unwrap();
        let spec = builder(root.path()).build(&profile(), 30811).unwrap();
        let projects: Vec<&Mount> = spec.mounts.iter().skip(3).collect();

        assert_eq!(projects.len(), 2);
        assert_eq!(
            projects[0].target,
            PathBuf::from("/project-center/Genomics/raw")
        );
        assert_eq!(projects[1].source, root.path().join("projects/Genomics/results"));
        assert!(projects.iter().all(|m| m.access == MountAccess::ReadWrite));
        assert_ne!(projects[0].name, projects[1].name);
    }

    #[test]
    fn test_skips_empty_unsafe_and_duplicate_grants() {
        let root = TempDir::new().unwrap();
        let profile = UserProfile::new("bob", Tier::Tier1, "pw")
            .with_project(ProjectGrant::new("", &["raw"]))
            .with_project(ProjectGrant::new("Empty", &[]))
            .with_project(ProjectGrant::new("..", &["etc"]))
            .with_project(ProjectGrant::new("Ok", &["../escape", "raw:rw", "data", "data"]))
            .with_project(ProjectGrant::new("Ok", &["data"]));

        let mounts = builder(root.path()).project_mounts(&profile);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].target, PathBuf::from("/project-center/Ok/data"));
        assert!(mounts[0].name.starts_with("proj-3-ok-data-"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let root = TempDir::new().unwrap();
        let builder = builder(root.path());
        assert_eq!(
            builder.build(&profile(), 30811).unwrap(),
            builder.build(&profile(), 30811).unwrap()
        );
    }

    #[test]
    fn test_preflight_requires_shared_paths() {
        let root = TempDir::new().unwrap();
        let builder = builder(root.path());

        let err = builder.preflight(&profile()).unwrap_err();
        assert_eq!(err, SessionError::MissingHostPath(root.path().join("lib")));

        std::fs::create_dir_all(root.path().join("lib")).unwrap();
        let err = builder.preflight(&profile()).unwrap_err();
        assert_eq!(err, SessionError::MissingHostPath(root.path().join("projects")));
    }

    #[test]
    fn test_preflight_creates_user_home() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("lib")).unwrap();
        std::fs::create_dir_all(root.path().join("projects")).unwrap();

        builder(root.path()).preflight(&profile()).unwrap();
        assert!(root.path().join("homes/alice").is_dir());
    }

    #[test]
    fn test_preflight_skipped_when_disabled() {
        let root = TempDir::new().unwrap();
        let mut settings = settings(root.path());
        settings.validate_host_paths = false;
        let builder = WorkloadSpecBuilder::new(settings, Arc::new(LocalFilesystem));
        builder.preflight(&profile()).unwrap();
        assert!(!root.path().join("homes").exists());
    }
}
