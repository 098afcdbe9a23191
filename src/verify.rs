use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::TimingConfig;
use crate::dispatch::CommandDispatcher;
use crate::telemetry::{DeviceState, StateStore};

/// Command token that asks a device to republish its current state.
pub const STATE_COMMAND: &str = "state";

/// Wire error code for caller-visible failures. The backend protocol only
/// distinguishes reachable from unreachable for switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "DEVICE_UNREACHABLE")]
    DeviceUnreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionError {
    pub code: ErrorCode,
    pub message: String,
}

impl ActionError {
    fn unreachable(message: String) -> Self {
        Self {
            code: ErrorCode::DeviceUnreachable,
            message,
        }
    }
}

/// Terminal outcome of one verification request. Always a structured value;
/// transport faults never surface here as anything but an error verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status")]
pub enum Verdict {
    #[serde(rename = "DONE")]
    Done { observed: String },
    #[serde(rename = "ERROR")]
    Error {
        #[serde(flatten)]
        error: ActionError,
    },
}

impl Verdict {
    fn error(message: String) -> Self {
        Verdict::Error {
            error: ActionError::unreachable(message),
        }
    }
}

/// Runs the request/confirm/verify protocol: ask the device to report,
/// capture a baseline, send the command, then wait for the reported state
/// to move off the baseline and match the desired value.
pub struct ActionVerifier<D> {
    store: StateStore,
    dispatcher: D,
    timing: TimingConfig,
}

impl<D: CommandDispatcher> ActionVerifier<D> {
    pub fn new(store: StateStore, dispatcher: D, timing: TimingConfig) -> Self {
        Self {
            store,
            dispatcher,
            timing,
        }
    }

    /// Request the device's current state and wait for the report. This is
    /// the read-only half of the protocol; it never sends a mutating
    /// command.
    pub async fn query_state(&self, mqtt_device_id: &str) -> Verdict {
        match self.baseline(mqtt_device_id).await {
            Ok(record) => match record.state {
                Some(observed) => Verdict::Done { observed },
                None => Verdict::error(format!(
                    "device {mqtt_device_id} reported no state token"
                )),
            },
            Err(error) => Verdict::Error { error },
        }
    }

    /// Full verification: baseline, command, change-wait, fallback read,
    /// expected-vs-actual check.
    pub async fn verify_action(
        &self,
        mqtt_device_id: &str,
        command: &str,
        desired: &str,
    ) -> Verdict {
        let baseline = match self.baseline(mqtt_device_id).await {
            Ok(record) => record,
            Err(error) => return Verdict::Error { error },
        };
        let previous = baseline.state;
        info!(mqtt_device_id, ?previous, desired, "baseline captured");

        if let Err(e) = self.dispatcher.send_command(mqtt_device_id, command).await {
            error!(mqtt_device_id, command, error = %e, "command dispatch failed");
            return Verdict::error(format!(
                "failed to send command '{command}' to {mqtt_device_id}: {e}"
            ));
        }
        info!(mqtt_device_id, command, "command sent");

        let confirmation = match self
            .store
            .wait_for_state_change(
                mqtt_device_id,
                previous.as_deref(),
                self.timing.change_timeout,
            )
            .await
        {
            Some(record) => Some(record),
            None => {
                // A change notification can be lost, or the device may have
                // already been in the desired state. A fresh cached record
                // still confirms the outcome.
                warn!(
                    mqtt_device_id,
                    "no state change observed, falling back to cached state"
                );
                self.store
                    .get_cached_state(mqtt_device_id, self.timing.cache_max_age)
            }
        };

        let Some(record) = confirmation else {
            error!(mqtt_device_id, "no confirmation after command");
            return Verdict::error(format!(
                "device {mqtt_device_id} unreachable: no confirmation"
            ));
        };

        match record.state.as_deref() {
            Some(actual) if actual == desired => {
                info!(mqtt_device_id, actual, "action verified");
                Verdict::Done {
                    observed: actual.to_string(),
                }
            }
            actual => {
                error!(
                    mqtt_device_id,
                    desired,
                    ?actual,
                    raw = %record.raw_payload,
                    "action not verified"
                );
                Verdict::error(format!(
                    "expected '{desired}', got '{}'",
                    actual.unwrap_or("<no state>")
                ))
            }
        }
    }

    /// Shared opening moves: dispatch a state request, then wait for any
    /// report. A dispatch failure aborts the whole request rather than
    /// proceeding blind to the command step.
    async fn baseline(&self, mqtt_device_id: &str) -> Result<DeviceState, ActionError> {
        if let Err(e) = self
            .dispatcher
            .send_command(mqtt_device_id, STATE_COMMAND)
            .await
        {
            error!(mqtt_device_id, error = %e, "state request dispatch failed");
            return Err(ActionError::unreachable(format!(
                "failed to request state from {mqtt_device_id}: {e}"
            )));
        }
        info!(mqtt_device_id, "state request sent");

        match self
            .store
            .wait_for_state(mqtt_device_id, self.timing.state_timeout)
            .await
        {
            Some(record) => Ok(record),
            None => {
                warn!(mqtt_device_id, "no baseline state before timeout");
                Err(ActionError::unreachable(format!(
                    "no baseline state from {mqtt_device_id}"
                )))
            }
        }
    }
}
