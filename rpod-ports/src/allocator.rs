//! Port allocation derived from live backend exposures.
//!
//! The allocator keeps no persistent record of who owns which port. "In use"
//! is recomputed on every call from the backend's current exposures, so the
//! view heals itself after an orchestrator restart or a crash mid-create.
//! The only in-process state is a short-lived claim set covering the window
//! between picking a port and the backend reporting the new exposure.

use crate::error::PortError;
use crate::range::PortRange;
use rpod_provider::{BackendError, ComputeBackend};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type Claims = Arc<Mutex<BTreeSet<u16>>>;

/// Hands out external ports for new sessions.
#[derive(Clone)]
pub struct PortAllocator {
    range: PortRange,
    backend: Arc<dyn ComputeBackend>,
    claims: Claims,
}

/// A port picked for a launch that is not yet visible as an exposure.
///
/// Dropping the claim makes the port eligible again for other in-process
/// callers; once the exposure exists the backend keeps it reserved.
#[derive(Debug)]
pub struct PortClaim {
    port: u16,
    claims: Claims,
}

impl PortClaim {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        lock(&self.claims).remove(&self.port);
    }
}

/// Snapshot of port usage for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PortUsage {
    pub range: PortRange,
    pub used_ports: Vec<u16>,
    pub used_in_range: u32,
    pub available: u32,
}

fn lock(claims: &Claims) -> MutexGuard<'_, BTreeSet<u16>> {
    claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PortAllocator {
    pub fn new(range: PortRange, backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            range,
            backend,
            claims: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Ports bound by live exposures, as the backend sees them right now.
    pub async fn in_use(&self) -> Result<BTreeSet<u16>, BackendError> {
        Ok(self
            .backend
            .list_exposures()
            .await?
            .into_iter()
            .map(|exposure| exposure.port)
            .collect())
    }

    /// Lowest free port in the range.
    pub async fn allocate(&self) -> Result<PortClaim, PortError> {
        self.allocate_avoiding(&BTreeSet::new()).await
    }

    /// Lowest free port in the range that is not in `avoid`.
    ///
    /// `avoid` carries ports the backend already rejected during this
    /// launch, so a retry does not pick them again.
    pub async fn allocate_avoiding(&self, avoid: &BTreeSet<u16>) -> Result<PortClaim, PortError> {
        let used = self.in_use().await?;
        let mut claims = lock(&self.claims);

        let port = self
            .range
            .ports()
            .find(|p| !used.contains(p) && !claims.contains(p) && !avoid.contains(p))
            .ok_or(PortError::Exhausted { range: self.range })?;

        claims.insert(port);
        debug!(port, used = used.len(), "allocated port");
        Ok(PortClaim {
            port,
            claims: Arc::clone(&self.claims),
        })
    }

    /// Claim a specific port, e.g. a tier's fixed single-host port.
    pub async fn allocate_fixed(&self, port: u16) -> Result<PortClaim, PortError> {
        let exposures = self.backend.list_exposures().await?;
        if let Some(holder) = exposures.iter().find(|e| e.port == port) {
            return Err(PortError::Taken {
                port,
                holder: holder
                    .owner
                    .clone()
                    .unwrap_or_else(|| "another service".to_string()),
            });
        }

        let mut claims = lock(&self.claims);
        if !claims.insert(port) {
            return Err(PortError::Taken {
                port,
                holder: "a launch in progress".to_string(),
            });
        }
        Ok(PortClaim {
            port,
            claims: Arc::clone(&self.claims),
        })
    }

    /// The port already bound for `session_name`, if it has an exposure.
    pub async fn reuse(&self, session_name: &str) -> Result<Option<u16>, BackendError> {
        self.backend.exposed_port(session_name).await
    }

    /// Advisory: drops any in-flight claim on `port`. The port only becomes
    /// free for good once the backend exposure is deleted.
    pub fn release(&self, port: u16) {
        if lock(&self.claims).remove(&port) {
            debug!(port, "released in-flight claim");
        }
    }

    pub async fn usage(&self) -> Result<PortUsage, BackendError> {
        let used = self.in_use().await?;
        let used_in_range = used.iter().filter(|p| self.range.contains(**p)).count() as u32;
        Ok(PortUsage {
            range: self.range,
            used_ports: used.into_iter().collect(),
            used_in_range,
            available: self.range.size() - used_in_range,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpod_provider::mock::MockBackend;

    fn allocator(start: u16, end: u16) -> (Arc<MockBackend>, PortAllocator) {
        let backend = Arc::new(MockBackend::new());
        let allocator = PortAllocator::new(PortRange::new(start, end).unwrap(), backend.clone());
        (backend, allocator)
    }

    #[tokio::test]
    async fn test_allocates_lowest_free_port() {
        let (backend, allocator) = allocator(30810, 30815);
        backend.insert_exposure("session-a", 30810);
        backend.insert_exposure("session-b", 30812);

        let claim = allocator.allocate().await.unwrap();
        assert_eq!(claim.port(), 30811);
    }

    #[tokio::test]
    async fn test_never_returns_bound_or_foreign_port() {
        let (backend, allocator) = allocator(30810, 30812);
        backend.reserve_foreign_port(30810);
        backend.insert_exposure("session-a", 30811);

        let claim = allocator.allocate().await.unwrap();
        assert_eq!(claim.port(), 30812);
    }

    #[tokio::test]
    async fn test_claims_keep_concurrent_callers_apart() {
        let (_backend, allocator) = allocator(30810, 30811);
        let first = allocator.allocate().await.unwrap();
        let second = allocator.allocate().await.unwrap();
        assert_ne!(first.port(), second.port());

        let err = allocator.allocate().await.unwrap_err();
        assert!(matches!(err, PortError::Exhausted { .. }));

        drop(first);
        assert_eq!(allocator.allocate().await.unwrap().port(), 30810);
    }

    #[tokio::test]
    async fn test_exhausted_single_port_range() {
        let (backend, allocator) = allocator(30810, 30810);
        backend.insert_exposure("session-a", 30810);
        let err = allocator.allocate().await.unwrap_err();
        assert_eq!(
            err,
            PortError::Exhausted {
                range: PortRange::new(30810, 30810).unwrap()
            }
        );
    }

    #[tokio::test]
    async fn test_in_use_is_recomputed_from_backend() {
        let (backend, allocator) = allocator(30810, 30810);
        backend.insert_exposure("session-a", 30810);
        assert!(allocator.allocate().await.is_err());

        backend.delete_exposure("session-a").await.unwrap();
        assert_eq!(allocator.allocate().await.unwrap().port(), 30810);
    }

    #[tokio::test]
    async fn test_avoid_skips_rejected_ports() {
        let (_backend, allocator) = allocator(30810, 30812);
        let avoid: BTreeSet<u16> = [30810].into_iter().collect();
        assert_eq!(allocator.allocate_avoiding(&avoid).await.unwrap().port(), 30811);
    }

    #[tokio::test]
    async fn test_fixed_port_taken() {
        let (backend, allocator) = allocator(30810, 30812);
        backend.insert_exposure("session-a", 8810);
        let err = allocator.allocate_fixed(8810).await.unwrap_err();
        assert!(matches!(err, PortError::Taken { port: 8810, .. }));
        assert_eq!(allocator.allocate_fixed(8820).await.unwrap().port(), 8820);
    }

    #[tokio::test]
    async fn test_reuse_and_usage() {
        let (backend, allocator) = allocator(30810, 30819);
        backend.insert_exposure("session-a", 30813);
        backend.reserve_foreign_port(8080);

        assert_eq!(allocator.reuse("session-a").await.unwrap(), Some(30813));
        assert_eq!(allocator.reuse("session-b").await.unwrap(), None);

        let usage = allocator.usage().await.unwrap();
        assert_eq!(usage.used_ports, vec![8080, 30813]);
        assert_eq!(usage.used_in_range, 1);
        assert_eq!(usage.available, 9);
    }

    #[tokio::test]
    async fn test_backend_failure_is_surfaced() {
        let (backend, allocator) = allocator(30810, 30812);
        backend.fail_next_calls(1);
        let err = allocator.allocate().await.unwrap_err();
        assert!(matches!(err, PortError::Backend(BackendError::Unavailable(_))));
    }
}
