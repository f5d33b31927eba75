//! Background enforcement of the maximum session lifetime.

use crate::error::Result;
use crate::naming::{username_from_session, SESSION_PREFIX};
use crate::session::SessionOrchestrator;
use chrono::Utc;
use rpod_config::ServiceConfig;
use serde::Serialize;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    pub max_lifetime: Duration,
    /// Final stretch of the lifetime in which a session is only flagged.
    pub warning_band: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapDecision {
    Keep,
    Warn { remaining: Duration },
    Reap,
}

impl ReapPolicy {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            max_lifetime: config.max_session(),
            warning_band: config.warning_band(),
            interval: config.reap_interval(),
        }
    }

    pub fn decide(&self, age: Duration) -> ReapDecision {
        if age > self.max_lifetime {
            ReapDecision::Reap
        } else if age > self.max_lifetime.saturating_sub(self.warning_band) {
            ReapDecision::Warn {
                remaining: self.max_lifetime - age,
            }
        } else {
            ReapDecision::Keep
        }
    }
}

/// What one reap cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub examined: usize,
    pub reaped: Vec<String>,
    pub warned: Vec<String>,
    pub failed: Vec<String>,
}

/// Tears down sessions older than the configured lifetime.
///
/// Takes no per-user locks and keeps no state between cycles; teardown is
/// idempotent, so overlapping with a request-driven stop is harmless.
pub struct SessionReaper {
    orchestrator: SessionOrchestrator,
    policy: ReapPolicy,
}

impl SessionReaper {
    pub fn new(orchestrator: SessionOrchestrator, policy: ReapPolicy) -> Self {
        Self {
            orchestrator,
            policy,
        }
    }

    /// Run a single cycle. Only the listing can fail the cycle; individual
    /// teardown failures are logged and reported.
    pub async fn reap_once(&self) -> Result<ReapReport> {
        let workloads = self.orchestrator.backend().list_workloads().await?;
        let now = Utc::now();
        let mut report = ReapReport::default();

        for workload in workloads
            .into_iter()
            .filter(|w| w.name.starts_with(SESSION_PREFIX))
        {
            report.examined += 1;
            let Some(age) = workload.state.age(now).and_then(|a| a.to_std().ok()) else {
                continue;
            };
            let username = workload
                .username
                .as_deref()
                .or_else(|| username_from_session(&workload.name))
                .unwrap_or("?");

            match self.policy.decide(age) {
                ReapDecision::Keep => {}
                ReapDecision::Warn { remaining } => {
                    warn!(
                        session = %workload.name,
                        username,
                        age_secs = age.as_secs(),
                        remaining_secs = remaining.as_secs(),
                        "session nearing maximum lifetime"
                    );
                    report.warned.push(workload.name);
                }
                ReapDecision::Reap => {
                    info!(
                        session = %workload.name,
                        username,
                        age_secs = age.as_secs(),
                        "session exceeded maximum lifetime, tearing down"
                    );
                    match self.orchestrator.teardown(&workload.name).await {
                        Ok(()) => report.reaped.push(workload.name),
                        Err(e) => {
                            error!(session = %workload.name, error = %e, "failed to reap session");
                            report.failed.push(workload.name);
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Loop until `shutdown` is cancelled. The first cycle runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.policy.interval.as_secs(),
            max_lifetime_secs = self.policy.max_lifetime.as_secs(),
            "session reaper running"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("session reaper stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.reap_once().await {
                Ok(report) if !report.reaped.is_empty() || !report.failed.is_empty() => {
                    info!(
                        examined = report.examined,
                        reaped = report.reaped.len(),
                        failed = report.failed.len(),
                        "reap cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "reap cycle failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReapPolicy {
        ReapPolicy {
            max_lifetime: Duration::from_secs(12 * 3600),
            warning_band: Duration::from_secs(1800),
            interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_decide() {
        let policy = policy();
        assert_eq!(policy.decide(Duration::from_secs(3600)), ReapDecision::Keep);
        assert_eq!(
            policy.decide(Duration::from_secs(12 * 3600 - 600)),
            ReapDecision::Warn {
                remaining: Duration::from_secs(600)
            }
        );
        assert_eq!(
            policy.decide(Duration::from_secs(12 * 3600)),
            ReapDecision::Warn {
                remaining: Duration::ZERO
            }
        );
        assert_eq!(
            policy.decide(Duration::from_secs(12 * 3600 + 1)),
            ReapDecision::Reap
        );
    }

    #[test]
    fn test_band_boundary_is_exclusive() {
        let policy = policy();
        assert_eq!(
            policy.decide(Duration::from_secs(12 * 3600 - 1800)),
            ReapDecision::Keep
        );
    }
}
