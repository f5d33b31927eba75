use crate::builder::WorkloadSpecBuilder;
use crate::error::{Result, SessionError};
use crate::locks::SessionLocks;
use crate::naming::{session_name, username_from_session, validate_username, SESSION_PREFIX};
use chrono::{DateTime, Utc};
use rpod_config::{ReusePolicy, ServiceConfig, TierLimits, UserDirectory, UserProfile};
use rpod_ports::{PortAllocator, PortClaim, PortError};
use rpod_provider::{BackendError, ComputeBackend, Phase, SessionState};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn, Instrument, Span};

/// Result of a successful launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchOutcome {
    pub username: String,
    pub session_name: String,
    pub tier: String,
    pub port: u16,
    pub redirect_target: String,
    /// True when an existing session was returned instead of a new one.
    pub reuse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub username: String,
    pub session_name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub username: String,
    pub session_name: String,
    pub running: bool,
    pub phase: Phase,
    pub port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub age_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionListing {
    pub username: String,
    pub session_name: String,
    pub tier: Option<String>,
    pub phase: Phase,
    pub port: Option<u16>,
    pub age_secs: Option<u64>,
    /// Time left before the reaper tears the session down.
    pub remaining_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Host or node address used in redirect targets.
    pub public_host: String,
    /// Pause between create and expose while the workload comes up.
    pub settle_delay: Duration,
    pub reuse_policy: ReusePolicy,
    pub max_session: Duration,
    /// Fresh-create attempts when the chosen port turns out to be bound.
    pub max_port_attempts: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            public_host: config.public_host.clone(),
            settle_delay: config.settle_delay(),
            reuse_policy: config.reuse_policy,
            max_session: config.max_session(),
            max_port_attempts: 3,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            public_host: "127.0.0.1".to_string(),
            settle_delay: Duration::from_secs(2),
            reuse_policy: ReusePolicy::PreferReuse,
            max_session: Duration::from_secs(12 * 60 * 60),
            max_port_attempts: 3,
        }
    }
}

/// Launch, stop, status and listing of per-user sessions.
///
/// Holds no session table: every decision is made on a fresh backend query.
#[derive(Clone)]
pub struct SessionOrchestrator {
    directory: Arc<dyn UserDirectory>,
    backend: Arc<dyn ComputeBackend>,
    ports: PortAllocator,
    builder: Arc<WorkloadSpecBuilder>,
    locks: SessionLocks,
    settings: Arc<OrchestratorSettings>,
}

/// Run a backend call, retrying once if the backend was unreachable.
async fn retry_once<T, F, Fut>(op: &str, target: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, BackendError>>,
{
    match call().await {
        Err(e) if e.is_retryable() => {
            warn!(op, target, error = %e, "backend unavailable, retrying once");
            call().await.map_err(SessionError::from)
        }
        other => other.map_err(SessionError::from),
    }
}

fn age_secs(state: &SessionState, now: DateTime<Utc>) -> Option<u64> {
    state
        .age(now)
        .and_then(|age| age.to_std().ok())
        .map(|age| age.as_secs())
}

impl SessionOrchestrator {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        backend: Arc<dyn ComputeBackend>,
        ports: PortAllocator,
        builder: WorkloadSpecBuilder,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            directory,
            backend,
            ports,
            builder: Arc::new(builder),
            locks: SessionLocks::new(),
            settings: Arc::new(settings),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    fn redirect_target(&self, port: u16) -> String {
        format!("http://{}:{}", self.settings.public_host, port)
    }

    fn outcome(&self, profile: &UserProfile, port: u16, reuse: bool) -> LaunchOutcome {
        LaunchOutcome {
            username: profile.username.clone(),
            session_name: session_name(&profile.username),
            tier: profile.tier.to_string(),
            port,
            redirect_target: self.redirect_target(port),
            reuse,
        }
    }

    /// Return the user's running session, or start a fresh one.
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn launch(&self, username: &str) -> Result<LaunchOutcome> {
        validate_username(username)?;
        let profile = self.resolve_profile(username).await?;
        let limits = self.builder.limits(&profile)?;

        // Detached: dropping the caller cannot interrupt create, settle and expose.
        let this = self.clone();
        tokio::spawn(
            async move { this.launch_locked(profile, limits).await }.instrument(Span::current()),
        )
        .await?
    }

    async fn launch_locked(
        &self,
        profile: UserProfile,
        limits: TierLimits,
    ) -> Result<LaunchOutcome> {
        let _guard = self.locks.acquire(&profile.username).await;
        let name = session_name(&profile.username);
        let state = retry_once("inspect", &name, || self.backend.inspect(&name)).await?;
        debug!(session = %name, phase = %state.phase, "current session state");

        let stale = match state.phase {
            Phase::Running | Phase::Starting => {
                if self.settings.reuse_policy == ReusePolicy::ForceReplace {
                    info!(session = %name, "replacing live session");
                    true
                } else {
                    let bound =
                        retry_once("exposed_port", &name, || self.ports.reuse(&name)).await?;
                    match bound {
                        Some(port) => {
                            info!(session = %name, port, "reusing live session");
                            return Ok(self.outcome(&profile, port, true));
                        }
                        None => {
                            warn!(session = %name, "live session has no exposure, recreating");
                            true
                        }
                    }
                }
            }
            Phase::Absent => false,
            Phase::Stopping | Phase::Stopped | Phase::Unknown => {
                info!(session = %name, phase = %state.phase, "removing stale session");
                true
            }
        };

        // Host paths gate creation only; a running session is reused without them.
        self.preflight(&profile).await?;
        if stale {
            self.teardown(&name).await?;
        }
        self.create_fresh(&profile, &limits, &name).await
    }

    async fn resolve_profile(&self, username: &str) -> Result<UserProfile> {
        let directory = self.directory.clone();
        let username = username.to_string();
        Ok(tokio::task::spawn_blocking(move || directory.resolve(&username)).await??)
    }

    async fn preflight(&self, profile: &UserProfile) -> Result<()> {
        let builder = self.builder.clone();
        let profile = profile.clone();
        tokio::task::spawn_blocking(move || builder.preflight(&profile)).await?
    }

    /// Every username the directory knows.
    pub async fn usernames(&self) -> Result<Vec<String>> {
        let directory = self.directory.clone();
        Ok(tokio::task::spawn_blocking(move || directory.usernames()).await??)
    }

    async fn create_fresh(
        &self,
        profile: &UserProfile,
        limits: &TierLimits,
        name: &str,
    ) -> Result<LaunchOutcome> {
        // An exposure can outlive its workload on the cluster backend.
        let mut previous =
            retry_once("exposed_port", name, || self.ports.reuse(name)).await?;
        let mut rejected = BTreeSet::new();
        let mut collision_retried = false;
        let max_attempts = self.settings.max_port_attempts.max(1);
        let mut attempt = 0;

        while attempt < max_attempts {
            attempt += 1;
            let claim = self.claim_port(previous, limits, &rejected).await?;
            let port = claim.as_ref().map(PortClaim::port).or(previous);
            let Some(port) = port else {
                return Err(SessionError::ResourceExhausted("no port available".into()));
            };

            let spec = self.builder.build(profile, port)?;
            info!(session = %name, port, attempt, mounts = spec.mounts.len(), "creating session");

            match self.backend.create_and_start(&spec).await {
                Ok(handle) => debug!(session = %name, id = %handle.id, "workload created"),
                Err(BackendError::NameCollision(_)) if !collision_retried => {
                    collision_retried = true;
                    if let Some(port) = self.resolve_collision(name).await? {
                        return Ok(self.outcome(profile, port, true));
                    }
                    // Stale workload and exposure are gone; allocate afresh.
                    // The collision retry does not count as a port attempt.
                    attempt -= 1;
                    previous = None;
                    continue;
                }
                Err(BackendError::PortInUse(p)) => {
                    warn!(session = %name, port = p, "port already bound, choosing another");
                    if limits.fixed_port.is_some() {
                        return Err(BackendError::PortInUse(p).into());
                    }
                    rejected.insert(p);
                    previous = None;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            if !self.settings.settle_delay.is_zero() {
                tokio::time::sleep(self.settings.settle_delay).await;
            }

            let container_port = spec.container_port;
            match retry_once("expose", name, || {
                self.backend.expose(name, container_port, port)
            })
            .await
            {
                Ok(bound) => {
                    info!(session = %name, port = bound, "session ready");
                    return Ok(self.outcome(profile, bound, false));
                }
                Err(SessionError::ResourceExhausted(msg)) if limits.fixed_port.is_none() => {
                    warn!(session = %name, port, %msg, "exposure rejected, choosing another port");
                    self.rollback(name).await;
                    rejected.insert(port);
                    previous = None;
                }
                Err(e) => {
                    self.rollback(name).await;
                    return Err(e);
                }
            }
        }

        Err(SessionError::ResourceExhausted(format!(
            "could not bind a port for {name} after {max_attempts} attempts"
        )))
    }

    /// A claim for the next port to try, or `None` when reusing `previous`.
    async fn claim_port(
        &self,
        previous: Option<u16>,
        limits: &TierLimits,
        rejected: &BTreeSet<u16>,
    ) -> Result<Option<PortClaim>> {
        if previous.is_some() {
            return Ok(None);
        }
        let claim = match limits.fixed_port {
            Some(port) => self.ports.allocate_fixed(port).await,
            None => self.ports.allocate_avoiding(rejected).await,
        };
        match claim {
            Ok(claim) => Ok(Some(claim)),
            Err(PortError::Backend(e)) if e.is_retryable() => {
                warn!(error = %e, "backend unavailable during allocation, retrying once");
                let retry = match limits.fixed_port {
                    Some(port) => self.ports.allocate_fixed(port).await,
                    None => self.ports.allocate_avoiding(rejected).await,
                };
                Ok(Some(retry?))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handle a create that hit an existing workload of the same name.
    ///
    /// A live workload belongs to a concurrent launch and is left running;
    /// its port is returned. Anything else is deleted so the caller can
    /// retry the create once.
    async fn resolve_collision(&self, name: &str) -> Result<Option<u16>> {
        let state = retry_once("inspect", name, || self.backend.inspect(name)).await?;
        if state.phase.is_live() {
            let bound = retry_once("exposed_port", name, || self.ports.reuse(name)).await?;
            return match bound {
                Some(port) => {
                    info!(session = %name, port, "name collision with live session, reusing it");
                    Ok(Some(port))
                }
                None => Err(SessionError::NameCollision(format!(
                    "{name} is starting elsewhere and not yet exposed"
                ))),
            };
        }

        info!(session = %name, phase = %state.phase, "name collision with stale workload, deleting");
        retry_once("delete", name, || self.backend.delete(name)).await?;
        retry_once("delete_exposure", name, || self.backend.delete_exposure(name)).await?;
        Ok(None)
    }

    async fn rollback(&self, name: &str) {
        if let Err(e) = self.backend.delete(name).await {
            warn!(session = %name, error = %e, "rollback delete failed");
        }
    }

    /// Stop and remove a session's workload and exposure. Idempotent; takes
    /// no lock, so the reaper can call it directly.
    pub async fn teardown(&self, name: &str) -> Result<()> {
        match retry_once("stop", name, || self.backend.stop(name)).await {
            Ok(()) => {}
            Err(e @ SessionError::BackendUnavailable(_)) => return Err(e),
            Err(e) => warn!(session = %name, error = %e, "graceful stop failed, deleting anyway"),
        }
        retry_once("delete", name, || self.backend.delete(name)).await?;
        retry_once("delete_exposure", name, || self.backend.delete_exposure(name)).await?;
        debug!(session = %name, "session torn down");
        Ok(())
    }

    /// Stop and remove the user's session. Succeeds whether or not it existed.
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn stop(&self, username: &str) -> Result<StopOutcome> {
        validate_username(username)?;
        let _guard = self.locks.acquire(username).await;
        let name = session_name(username);

        let port = retry_once("exposed_port", &name, || self.ports.reuse(&name)).await?;
        self.teardown(&name).await?;
        if let Some(port) = port {
            self.ports.release(port);
        }

        info!(session = %name, ?port, "session stopped");
        Ok(StopOutcome {
            username: username.to_string(),
            session_name: name,
            message: format!("Session for {username} stopped"),
        })
    }

    /// Current state of the user's session. Never mutates anything.
    #[instrument(skip(self))]
    pub async fn status(&self, username: &str) -> Result<SessionStatus> {
        validate_username(username)?;
        let name = session_name(username);
        let state = retry_once("inspect", &name, || self.backend.inspect(&name)).await?;
        let port = if state.exists() {
            retry_once("exposed_port", &name, || self.ports.reuse(&name)).await?
        } else {
            None
        };

        Ok(SessionStatus {
            username: username.to_string(),
            session_name: name,
            running: state.phase == Phase::Running,
            phase: state.phase,
            port,
            started_at: state.started_at,
            age_secs: age_secs(&state, Utc::now()),
        })
    }

    /// Every session workload the backend knows about, sorted by name.
    pub async fn list_sessions(&self) -> Result<Vec<SessionListing>> {
        let workloads = retry_once("list_workloads", "*", || self.backend.list_workloads()).await?;
        let exposures = retry_once("list_exposures", "*", || self.backend.list_exposures()).await?;
        let ports: HashMap<String, u16> = exposures
            .into_iter()
            .filter_map(|e| e.owner.map(|owner| (owner, e.port)))
            .collect();

        let now = Utc::now();
        let max = self.settings.max_session.as_secs();
        let mut sessions: Vec<SessionListing> = workloads
            .into_iter()
            .filter(|w| w.name.starts_with(SESSION_PREFIX))
            .map(|w| {
                let age = age_secs(&w.state, now);
                let username = w
                    .username
                    .clone()
                    .or_else(|| username_from_session(&w.name).map(str::to_string))
                    .unwrap_or_default();
                SessionListing {
                    username,
                    port: ports.get(&w.name).copied(),
                    session_name: w.name,
                    tier: w.tier,
                    phase: w.state.phase,
                    age_secs: age,
                    remaining_secs: age.map(|a| max.saturating_sub(a)),
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.session_name.cmp(&b.session_name));
        Ok(sessions)
    }
}
