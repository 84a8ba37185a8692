//! Per-key single-flight for `GetSet`.
//!
//! Concurrent misses on the same key queue behind one async mutex; the
//! first caller produces and stores the value, the rest re-read it. Slots
//! are dropped from the map once nobody is holding or waiting on them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub(crate) struct SingleFlight {
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl SingleFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive use of `key`.
    pub(crate) async fn lock(&self, key: &str) -> FlightGuard<'_> {
        let slot = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = slot.lock_owned().await;
        FlightGuard {
            flights: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys with an active or queued producer.
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

pub(crate) struct FlightGuard<'a> {
    flights: &'a SingleFlight,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let slot = Arc::clone(OwnedMutexGuard::mutex(&guard));
        drop(guard);
        // Map entry plus `slot`: nobody else is waiting.
        self.flights
            .inflight
            .remove_if(&self.key, |_, v| Arc::ptr_eq(v, &slot) && Arc::strong_count(v) == 2);
    }
}
