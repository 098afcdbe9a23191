use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::DeviceState;

/// Shared last-known-state map with per-device wakeups.
///
/// Each device gets its own watch channel, so a `put` wakes only waiters for
/// that device and waiters on different devices never contend. The mutex
/// guards map shape only and is never held across an await.
#[derive(Clone, Default)]
pub struct StateStore {
    slots: Arc<Mutex<HashMap<String, watch::Sender<Option<DeviceState>>>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, device_id: &str) -> watch::Receiver<Option<DeviceState>> {
        let mut slots = self.slots.lock().expect("state map lock poisoned");
        slots
            .entry(device_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Overwrite the record for a device and wake anyone waiting on it.
    pub fn put(&self, record: DeviceState) {
        let mut slots = self.slots.lock().expect("state map lock poisoned");
        slots
            .entry(record.device_id.clone())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(record));
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceState> {
        let slots = self.slots.lock().expect("state map lock poisoned");
        slots.get(device_id).and_then(|s| s.borrow().clone())
    }

    /// Block until the store holds any record for the device, or `wait`
    /// elapses. Timeout is an expected outcome, reported as `None`.
    pub async fn wait_for_state(&self, device_id: &str, wait: Duration) -> Option<DeviceState> {
        let mut rx = self.slot(device_id);
        match timeout(wait, rx.wait_for(|r| r.is_some())).await {
            Ok(Ok(record)) => record.clone(),
            // The sender lives in the map for as long as the store does.
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(device_id, ?wait, "timed out waiting for state");
                None
            }
        }
    }

    /// Block until the cached state for the device differs from `previous`,
    /// or `wait` elapses. A `previous` of `None` matches any record.
    pub async fn wait_for_state_change(
        &self,
        device_id: &str,
        previous: Option<&str>,
        wait: Duration,
    ) -> Option<DeviceState> {
        let mut rx = self.slot(device_id);
        let changed = |r: &Option<DeviceState>| match r {
            Some(record) => previous.is_none() || record.state.as_deref() != previous,
            None => false,
        };
        match timeout(wait, rx.wait_for(changed)).await {
            Ok(Ok(record)) => {
                let record = record.clone();
                if let Some(record) = &record {
                    debug!(
                        device_id,
                        ?previous,
                        current = ?record.state,
                        "state change observed"
                    );
                }
                record
            }
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(device_id, ?previous, ?wait, "timed out waiting for state change");
                None
            }
        }
    }

    /// Non-blocking freshness-bounded read. Returns the cached record only
    /// if it arrived no longer than `max_age` ago.
    pub fn get_cached_state(&self, device_id: &str, max_age: Duration) -> Option<DeviceState> {
        let record = self.get(device_id)?;
        let age = record.age();
        if age <= max_age {
            Some(record)
        } else {
            warn!(device_id, ?age, ?max_age, "cached state is too old");
            None
        }
    }
}
