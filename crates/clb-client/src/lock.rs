//! Per-load-balancer serialization.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Process-wide map of async mutexes, one per `(region, lb_id)`.
///
/// Entries are created on first use and never removed.
#[derive(Debug, Default)]
pub struct LbLocks {
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl LbLocks {
    /// Empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to one load balancer.
    pub async fn lock(&self, region: &str, lb_id: &str) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(
            self.locks
                .entry((region.to_string(), lb_id.to_string()))
                .or_default()
                .value(),
        );
        mutex.lock_owned().await
    }

    /// Number of load balancers seen so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no load balancer was locked yet.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
