//! Shared fixtures: an orchestrator wired to the in-memory backend, a static
//! user directory and a temporary host filesystem.

#![allow(dead_code)]

use rpod_config::{ProjectGrant, ReusePolicy, StaticUserDirectory, Tier, TierTable, UserProfile};
use rpod_orchestrator::{
    BuilderSettings, LocalFilesystem, OrchestratorSettings, ReapPolicy, SessionOrchestrator,
    SessionReaper, WorkloadSpecBuilder,
};
use rpod_ports::{PortAllocator, PortRange};
use rpod_provider::mock::MockBackend;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const MAX_LIFETIME: Duration = Duration::from_secs(12 * 60 * 60);

pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub orchestrator: SessionOrchestrator,
    pub root: TempDir,
}

pub struct HarnessBuilder {
    range: (u16, u16),
    tiers: TierTable,
    reuse_policy: ReusePolicy,
    settle_delay: Duration,
    max_port_attempts: usize,
    users: Vec<UserProfile>,
}

pub fn users() -> Vec<UserProfile> {
    vec![
        UserProfile::new("alice", Tier::Tier2, "alice-pw")
            .with_project(ProjectGrant::new("Genomics", &["raw", "results"])),
        UserProfile::new("bob", Tier::Tier1, "bob-pw"),
        UserProfile::new("carol", Tier::Tier1, "carol-pw"),
        UserProfile::new("dave", Tier::Tier3, "dave-pw"),
    ]
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            range: (30810, 30900),
            tiers: TierTable::cluster(),
            reuse_policy: ReusePolicy::PreferReuse,
            settle_delay: Duration::ZERO,
            max_port_attempts: 3,
            users: users(),
        }
    }

    pub fn range(mut self, start: u16, end: u16) -> Self {
        self.range = (start, end);
        self
    }

    pub fn tiers(mut self, tiers: TierTable) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn reuse_policy(mut self, policy: ReusePolicy) -> Self {
        self.reuse_policy = policy;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn max_port_attempts(mut self, attempts: usize) -> Self {
        self.max_port_attempts = attempts;
        self
    }

    pub fn build(self) -> Harness {
        let root = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(root.path().join("lib")).expect("lib dir");
        std::fs::create_dir_all(root.path().join("projects")).expect("projects dir");

        let backend = Arc::new(MockBackend::new());
        let range = PortRange::new(self.range.0, self.range.1).expect("valid range");
        let ports = PortAllocator::new(range, backend.clone());

        let builder = WorkloadSpecBuilder::new(
            BuilderSettings {
                image: "rstudio:test".into(),
                container_port: 8787,
                shared_library_path: root.path().join("lib"),
                project_root_path: root.path().join("projects"),
                user_homes_path: root.path().join("homes"),
                library_mount_path: "/usr/local/lib/R/site-library".into(),
                project_mount_path: "/project-center".into(),
                validate_host_paths: true,
                tiers: self.tiers,
            },
            Arc::new(LocalFilesystem),
        );

        let orchestrator = SessionOrchestrator::new(
            Arc::new(StaticUserDirectory::new(self.users)),
            backend.clone(),
            ports,
            builder,
            OrchestratorSettings {
                public_host: "rpod.test".into(),
                settle_delay: self.settle_delay,
                reuse_policy: self.reuse_policy,
                max_session: MAX_LIFETIME,
                max_port_attempts: self.max_port_attempts,
            },
        );

        Harness {
            backend,
            orchestrator,
            root,
        }
    }
}

pub fn harness() -> Harness {
    HarnessBuilder::new().build()
}

impl Harness {
    pub fn reaper(&self) -> SessionReaper {
        SessionReaper::new(
            self.orchestrator.clone(),
            ReapPolicy {
                max_lifetime: MAX_LIFETIME,
                warning_band: Duration::from_secs(30 * 60),
                interval: Duration::from_millis(20),
            },
        )
    }
}
