//! Live session state as reported by a backend.
//!
//! Nothing here is cached: every value is produced by a fresh backend query.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Absent,
    Starting,
    Running,
    Stopping,
    Stopped,
    Unknown,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Absent => "absent",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
            Phase::Unknown => "unknown",
        }
    }

    /// Starting or running: a session someone may be using.
    pub fn is_live(self) -> bool {
        matches!(self, Phase::Starting | Phase::Running)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase plus start time of a single workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: Phase,
    pub started_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn absent() -> Self {
        Self {
            phase: Phase::Absent,
            started_at: None,
        }
    }

    pub fn new(phase: Phase, started_at: Option<DateTime<Utc>>) -> Self {
        Self { phase, started_at }
    }

    pub fn exists(&self) -> bool {
        self.phase != Phase::Absent
    }

    /// Time since start, clamped at zero. `None` until the workload has started.
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.started_at
            .map(|started| (now - started).max(Duration::zero()))
    }
}

/// Opaque identifier returned by a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadHandle {
    pub name: String,
    pub id: String,
}

/// One entry of a backend's workload listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSummary {
    pub name: String,
    pub username: Option<String>,
    pub tier: Option<String>,
    pub state: SessionState,
}

/// An externally reachable port held by some exposure.
///
/// `owner` is the session name when the exposure belongs to an RPOD
/// session; other exposures still reserve their port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exposure {
    pub owner: Option<String>,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_is_clamped() {
        let now = Utc::now();
        let future = SessionState::new(Phase::Running, Some(now + Duration::seconds(30)));
        assert_eq!(future.age(now), Some(Duration::zero()));

        let past = SessionState::new(Phase::Running, Some(now - Duration::hours(2)));
        assert_eq!(past.age(now), Some(Duration::hours(2)));

        assert_eq!(SessionState::absent().age(now), None);
    }

    #[test]
    fn test_live_phases() {
        assert!(Phase::Starting.is_live());
        assert!(Phase::Running.is_live());
        assert!(!Phase::Stopped.is_live());
        assert!(!Phase::Stopping.is_live());
        assert!(!Phase::Absent.is_live());
    }
}
