pub mod cache;

pub use cache::StateStore;

use std::time::Duration;

use tokio::time::Instant;

/// Last state a device reported, exactly as it arrived off the wire.
///
/// Replaced as a whole on every arrival; the delivery task is the only
/// writer for a given device.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub device_id: String,
    /// The `state` token from the payload ("on"/"off" for switches).
    /// `None` when the payload decoded but carried no string `state` field.
    pub state: Option<String>,
    pub observed_at: Instant,
    /// Undecoded body, kept for diagnostics.
    pub raw_payload: serde_json::Value,
}

impl DeviceState {
    pub fn new(
        device_id: impl Into<String>,
        state: Option<String>,
        raw_payload: serde_json::Value,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            state,
            observed_at: Instant::now(),
            raw_payload,
        }
    }

    pub fn age(&self) -> Duration {
        self.observed_at.elapsed()
    }
}
