//! Per-username serialization of the launch and stop paths.
//!
//! Distinct usernames never contend. Entries are weak so the table only
//! holds users with a request in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct SessionLocks {
    table: Arc<Mutex<HashMap<String, Weak<AsyncMutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `username`'s session.
    pub async fn acquire(&self, username: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
            table.retain(|_, weak| weak.strong_count() > 0);
            match table.get(username).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    table.insert(username.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        table.values().filter(|weak| weak.strong_count() > 0).count()
    }
}
