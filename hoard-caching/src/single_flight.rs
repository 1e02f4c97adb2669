//! Per-key in-process mutual exclusion for recomputations
//!
//! Opt-in companion of the soft-TTL policy: while one caller recomputes a
//! key, other callers in this process wait for it and then re-read the
//! backend. Callers in other processes are not coordinated.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Registry of in-flight keys
#[derive(Debug, Default, Clone)]
pub struct SingleFlight {
    locks: LockMap,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other caller holds `key`, then hold it until the guard
    /// is dropped.
    ///
    /// Dropping the returned future while it waits gives up the place in line.
    pub async fn acquire(&self, key: &str) -> FlightGuard {
        let lock = {
            let mut locks = self.locks.lock();
            prune_idle(&mut locks);
            locks.entry(key.to_string()).or_default().clone()
        };

        // Declared before the wait so a cancelled waiter still prunes on drop
        let mut flight = FlightGuard {
            locks: self.locks.clone(),
            guard: None,
        };
        flight.guard = Some(lock.lock_owned().await);
        flight
    }

    /// Number of keys currently held or awaited
    pub fn in_flight(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Drop keys nobody holds or waits for; the map itself keeps one reference
fn prune_idle(locks: &mut HashMap<String, Arc<AsyncMutex<()>>>) {
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
}

/// Held while a caller owns a key
#[derive(Debug)]
pub struct FlightGuard {
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Release first so strong counts only reflect waiters
        drop(self.guard.take());
        prune_idle(&mut self.locks.lock());
    }
}
