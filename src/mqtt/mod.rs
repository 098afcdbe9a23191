pub mod client;

pub use client::{LinkStatus, TelemetryLink};

use crate::error::DecodeError;

/// Parse a telemetry topic into its device id.
/// Expected format: {prefix}/{device_id}/state
pub fn parse_state_topic<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (device_id, suffix) = rest.split_once('/')?;
    if device_id.is_empty() || suffix != "state" {
        return None;
    }
    Some(device_id)
}

/// Decode a telemetry body into its `state` token plus the raw JSON.
/// A decodable payload without a string `state` field is still a valid
/// report; only unparseable bodies are errors.
pub fn decode_state_payload(
    payload: &[u8],
) -> Result<(Option<String>, serde_json::Value), DecodeError> {
    let raw: serde_json::Value = serde_json::from_slice(payload)?;
    let state = raw.get("state").and_then(|v| v.as_str()).map(String::from);
    Ok((state, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_state_topics() {
        assert_eq!(
            parse_state_topic("$devices/are0abc123/state", "$devices"),
            Some("are0abc123")
        );
        assert_eq!(parse_state_topic("$devices/are0abc123/commands", "$devices"), None);
        assert_eq!(parse_state_topic("$devices//state", "$devices"), None);
        assert_eq!(parse_state_topic("other/are0abc123/state", "$devices"), None);
        assert_eq!(parse_state_topic("$devices/are0abc123", "$devices"), None);
    }

    #[test]
    fn decodes_state_field() {
        let (state, raw) = decode_state_payload(br#"{"state": "on", "rssi": -61}"#).unwrap();
        assert_eq!(state.as_deref(), Some("on"));
        assert_eq!(raw["rssi"], -61);
    }

    #[test]
    fn payload_without_state_token_is_kept() {
        let (state, raw) = decode_state_payload(br#"{"uptime": 12}"#).unwrap();
        assert!(state.is_none());
        assert_eq!(raw["uptime"], 12);
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        assert!(decode_state_payload(b"not json").is_err());
    }
}
