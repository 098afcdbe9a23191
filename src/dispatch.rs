use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use tracing::{error, info};

use crate::config::{Config, DispatchConfig};
use crate::error::DispatchError;

/// Outbound command boundary. Success means the transport accepted the
/// call, not that the device acted on it; eventual effect is observed
/// separately through telemetry.
pub trait CommandDispatcher {
    fn send_command(
        &self,
        mqtt_device_id: &str,
        command: &str,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send;
}

/// Sends commands through the vendor publish endpoint, which relays them
/// onto the device's command topic.
pub struct HttpDispatcher {
    http: reqwest::Client,
    config: DispatchConfig,
    topic_prefix: String,
}

impl HttpDispatcher {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: config.dispatch.clone(),
            topic_prefix: config.mqtt.topic_prefix.clone(),
        }
    }

    fn publish_url(&self) -> String {
        format!(
            "{}/registries/{}/publish",
            self.config.base_url, self.config.registry_id
        )
    }
}

/// Wire body for the publish call: the command topic plus the command
/// token, transport-encoded as base64.
fn publish_body(topic_prefix: &str, mqtt_device_id: &str, command: &str) -> serde_json::Value {
    json!({
        "topic": format!("{topic_prefix}/{mqtt_device_id}/commands"),
        "data": BASE64.encode(command),
    })
}

impl CommandDispatcher for HttpDispatcher {
    async fn send_command(&self, mqtt_device_id: &str, command: &str) -> Result<(), DispatchError> {
        let body = publish_body(&self.topic_prefix, mqtt_device_id, command);
        let response = self
            .http
            .post(self.publish_url())
            .bearer_auth(&self.config.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(mqtt_device_id, command, "command accepted by publish endpoint");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            error!(mqtt_device_id, command, %status, "publish endpoint rejected command");
            Err(DispatchError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}
