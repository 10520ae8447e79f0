//! Advisory reconciliation suppression.
//!
//! After the operator writes to a watched resource, the next watch event
//! for that write takes a moment to land in the local cache; reconciling
//! again before it does wastes a full pass on stale state. Writers record
//! a hint here and the controller loop requeues instead of reconciling
//! while the hint is fresh. This is a heuristic, not a correctness
//! guarantee: reconciliation is idempotent either way.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Grace period giving the watch event time to come back and update the
/// cache. Covers the vast majority of cases without guaranteeing sync.
pub const CACHE_SYNC_GRACE: Duration = Duration::from_secs(2);

/// Sink for advisory "skip reconciling this object for a moment" hints.
pub trait ReconciliationHintSink: Send + Sync {
    fn skip_until_cache_synced(&self, namespace: &str, name: &str);
}

/// Shared hint store consulted by the controller loops.
pub struct ReconciliationHints {
    grace: Duration,
    earliest: Mutex<HashMap<(String, String), Instant>>,
}

impl ReconciliationHints {
    pub fn new() -> Self {
        Self::with_grace(CACHE_SYNC_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            grace,
            earliest: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining suppression delay for the object, if any. Expired hints
    /// are dropped on the way out.
    pub fn should_skip(&self, namespace: &str, name: &str) -> Option<Duration> {
        let key = (namespace.to_string(), name.to_string());
        let mut earliest = self.earliest.lock().unwrap();
        match earliest.get(&key) {
            Some(time) => {
                let now = Instant::now();
                if *time > now {
                    Some(*time - now)
                } else {
                    earliest.remove(&key);
                    None
                }
            }
            None => None,
        }
    }
}

impl Default for ReconciliationHints {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationHintSink for ReconciliationHints {
    fn skip_until_cache_synced(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        self.earliest
            .lock()
            .unwrap()
            .insert(key, Instant::now() + self.grace);
    }
}
