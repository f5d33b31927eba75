//! In-memory backend for tests.
//!
//! Behaves like a cluster scheduler with atomic name uniqueness: workloads
//! and exposures are separate objects, creating an existing name fails with
//! `NameCollision`, and exposing a port held elsewhere fails with
//! `PortInUse`. Every call is recorded so tests can assert on what the
//! orchestrator actually asked for.

use crate::error::{BackendError, Result};
use crate::spec::{labels, WorkloadSpec};
use crate::state::{Exposure, Phase, SessionState, WorkloadHandle, WorkloadSummary};
use crate::ComputeBackend;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct MockWorkload {
    pub spec: Option<WorkloadSpec>,
    pub username: Option<String>,
    pub tier: Option<String>,
    pub phase: Phase,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MockState {
    workloads: BTreeMap<String, MockWorkload>,
    exposures: BTreeMap<String, u16>,
    foreign_ports: BTreeSet<u16>,
    calls: Vec<(String, String)>,
    fail_next: u32,
    broken: HashSet<(String, String)>,
    injected: HashMap<(String, String), VecDeque<BackendError>>,
    hidden: HashSet<String>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and apply any injected failure.
    fn enter(&self, op: &str, target: &str) -> Result<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls.push((op.to_string(), target.to_string()));
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BackendError::Unavailable(format!("injected failure on {op}")));
        }
        let key = (op.to_string(), target.to_string());
        if state.broken.contains(&key) {
            return Err(BackendError::CommandFailed(format!("{op} {target} is broken")));
        }
        if let Some(err) = state.injected.get_mut(&key).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }

    /// Place a workload directly, as if created out-of-band.
    pub fn insert_workload(
        &self,
        name: &str,
        username: &str,
        phase: Phase,
        started_at: Option<DateTime<Utc>>,
    ) {
        self.lock().workloads.insert(
            name.to_string(),
            MockWorkload {
                spec: None,
                username: Some(username.to_string()),
                tier: None,
                phase,
                started_at,
            },
        );
    }

    pub fn insert_exposure(&self, name: &str, port: u16) {
        self.lock().exposures.insert(name.to_string(), port);
    }

    /// Mark a port as held by something outside RPOD.
    pub fn reserve_foreign_port(&self, port: u16) {
        self.lock().foreign_ports.insert(port);
    }

    pub fn set_phase(&self, name: &str, phase: Phase) {
        if let Some(w) = self.lock().workloads.get_mut(name) {
            w.phase = phase;
        }
    }

    /// Shift a workload's start time into the past.
    pub fn age_workload(&self, name: &str, age: Duration) {
        if let Some(w) = self.lock().workloads.get_mut(name) {
            w.started_at = Some(Utc::now() - age);
        }
    }

    /// The next `n` calls fail with `Unavailable`.
    pub fn fail_next_calls(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Every `op` on `target` fails with a non-retryable error.
    pub fn break_op(&self, op: &str, target: &str) {
        self.lock()
            .broken
            .insert((op.to_string(), target.to_string()));
    }

    /// Queue `err` as the outcome of the next `op` on `target`. Queued
    /// errors are returned in order, one per call.
    pub fn inject_error(&self, op: &str, target: &str, err: BackendError) {
        self.lock()
            .injected
            .entry((op.to_string(), target.to_string()))
            .or_default()
            .push_back(err);
    }

    /// The next `inspect` and `exposed_port` of `name` report nothing, as
    /// if a concurrent creator had not become visible yet.
    pub fn hide_once(&self, name: &str) {
        self.lock().hidden.insert(name.to_string());
    }

    pub fn workload(&self, name: &str) -> Option<MockWorkload> {
        self.lock().workloads.get(name).cloned()
    }

    pub fn exposure(&self, name: &str) -> Option<u16> {
        self.lock().exposures.get(name).copied()
    }

    pub fn workload_count(&self) -> usize {
        self.lock().workloads.len()
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|(o, _)| o == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

fn port_holder(state: &MockState, port: u16) -> Option<String> {
    if state.foreign_ports.contains(&port) {
        return Some("<foreign>".to_string());
    }
    state
        .exposures
        .iter()
        .find(|(_, p)| **p == port)
        .map(|(owner, _)| owner.clone())
}

#[async_trait]
impl ComputeBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_and_start(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle> {
        tokio::task::yield_now().await;
        let mut state = self.enter("create_and_start", &spec.name)?;
        if state.workloads.contains_key(&spec.name) {
            return Err(BackendError::NameCollision(spec.name.clone()));
        }

        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        state.workloads.insert(
            spec.name.clone(),
            MockWorkload {
                spec: Some(spec.clone()),
                username: spec.label(labels::USER).map(str::to_string),
                tier: spec.label(labels::TIER).map(str::to_string),
                phase: Phase::Running,
                started_at: Some(Utc::now()),
            },
        );

        Ok(WorkloadHandle {
            name: spec.name.clone(),
            id,
        })
    }

    async fn inspect(&self, name: &str) -> Result<SessionState> {
        tokio::task::yield_now().await;
        let mut state = self.enter("inspect", name)?;
        if state.hidden.contains(name) {
            return Ok(SessionState::absent());
        }
        Ok(state
            .workloads
            .get(name)
            .map(|w| SessionState::new(w.phase, w.started_at))
            .unwrap_or_else(SessionState::absent))
    }

    async fn expose(&self, name: &str, _container_port: u16, external_port: u16) -> Result<u16> {
        tokio::task::yield_now().await;
        let mut state = self.enter("expose", name)?;
        if let Some(port) = state.exposures.get(name) {
            return Ok(*port);
        }
        if port_holder(&state, external_port).is_some() {
            return Err(BackendError::PortInUse(external_port));
        }
        state.exposures.insert(name.to_string(), external_port);
        Ok(external_port)
    }

    async fn exposed_port(&self, name: &str) -> Result<Option<u16>> {
        tokio::task::yield_now().await;
        let mut state = self.enter("exposed_port", name)?;
        if state.hidden.remove(name) {
            return Ok(None);
        }
        Ok(state.exposures.get(name).copied())
    }

    async fn list_exposures(&self) -> Result<Vec<Exposure>> {
        tokio::task::yield_now().await;
        let state = self.enter("list_exposures", "*")?;
        let mut exposures: Vec<Exposure> = state
            .exposures
            .iter()
            .map(|(owner, port)| Exposure {
                owner: Some(owner.clone()),
                port: *port,
            })
            .collect();
        exposures.extend(state.foreign_ports.iter().map(|port| Exposure {
            owner: None,
            port: *port,
        }));
        Ok(exposures)
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>> {
        tokio::task::yield_now().await;
        let state = self.enter("list_workloads", "*")?;
        Ok(state
            .workloads
            .iter()
            .map(|(name, w)| WorkloadSummary {
                name: name.clone(),
                username: w.username.clone(),
                tier: w.tier.clone(),
                state: SessionState::new(w.phase, w.started_at),
            })
            .collect())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.enter("stop", name)?;
        if let Some(w) = state.workloads.get_mut(name) {
            w.phase = Phase::Stopped;
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.enter("delete", name)?;
        state.workloads.remove(name);
        Ok(())
    }

    async fn delete_exposure(&self, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.enter("delete_exposure", name)?;
        state.exposures.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exposure_conflicts() {
        let backend = MockBackend::new();
        assert_eq!(backend.expose("session-a", 8787, 30810).await.unwrap(), 30810);
        assert_eq!(
            backend.expose("session-b", 8787, 30810).await.unwrap_err(),
            BackendError::PortInUse(30810)
        );
        // Re-exposing returns the existing binding.
        assert_eq!(backend.expose("session-a", 8787, 30811).await.unwrap(), 30810);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let backend = MockBackend::new();
        backend.fail_next_calls(1);
        assert!(backend.inspect("session-a").await.unwrap_err().is_retryable());
        assert_eq!(
            backend.inspect("session-a").await.unwrap(),
            SessionState::absent()
        );
        assert_eq!(backend.call_count("inspect"), 2);
    }

    #[tokio::test]
    async fn test_broken_op_fails_every_time() {
        let backend = MockBackend::new();
        backend.break_op("delete", "session-a");
        for _ in 0..2 {
            let err = backend.delete("session-a").await.unwrap_err();
            assert!(!err.is_retryable());
        }
        backend.delete("session-b").await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_errors_fire_once_each() {
        let backend = MockBackend::new();
        backend.inject_error("expose", "session-a", BackendError::PortInUse(30810));
        assert_eq!(
            backend.expose("session-a", 8787, 30810).await.unwrap_err(),
            BackendError::PortInUse(30810)
        );
        assert_eq!(backend.expose("session-a", 8787, 30810).await.unwrap(), 30810);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = MockBackend::new();
        backend.insert_workload("session-a", "a", Phase::Stopped, None);
        backend.delete("session-a").await.unwrap();
        backend.delete("session-a").await.unwrap();
        backend.delete_exposure("session-a").await.unwrap();
        assert_eq!(backend.workload_count(), 0);
    }
}
