use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub timing: TimingConfig,
    pub dispatch: DispatchConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    pub topic_prefix: String,
    pub client_id: String,
    pub auth: AuthMode,
    pub lifetime: ConnectionLifetime,
}

/// Broker credentials. Both modes talk to the same host/port; which one is
/// used is a deployment choice, not a build choice.
#[derive(Debug, Clone)]
pub enum AuthMode {
    Password {
        username: String,
        password: String,
        /// CA bundle for TLS; plain TCP when absent.
        ca_path: Option<PathBuf>,
    },
    Certificate {
        ca_path: PathBuf,
        cert_path: PathBuf,
        key_path: PathBuf,
    },
}

/// How long the broker link lives relative to one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLifetime {
    /// Connect, answer one request, disconnect. A connection error just
    /// fails the request in flight.
    PerRequest,
    /// Keep the link up across requests, reconnecting and resubscribing
    /// after errors.
    Persistent,
}

/// Wait windows for the verification protocol.
#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    /// How long to wait for a baseline state report.
    pub state_timeout: Duration,
    /// How long to wait for the state to move off the baseline.
    pub change_timeout: Duration,
    /// How old a cached record may be and still confirm an action.
    pub cache_max_age: Duration,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub base_url: String,
    pub registry_id: String,
    pub token: String,
}

/// Static mapping of a logical device id to its transport-level identity.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: String,
    pub mqtt_device_id: String,
    pub name: String,
}

// Serde struct for parsing the devices inventory JSON
#[derive(Deserialize)]
struct RawDevice {
    id: String,
    mqtt_device_id: String,
    #[serde(default)]
    name: Option<String>,
}

fn env_required(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("{key} environment variable is required"))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let devices_file = env_or_default("DEVICES_FILE", "devices.json".to_string());
        let content = std::fs::read_to_string(&devices_file)
            .map_err(|e| format!("Failed to read {devices_file}: {e}"))?;
        let devices = parse_devices(&content)
            .map_err(|e| format!("Failed to parse {devices_file}: {e}"))?;

        let auth = match env_optional("MQTT_CLIENT_CERT") {
            Some(cert_path) => AuthMode::Certificate {
                ca_path: env_required("MQTT_CA_CERT")?.into(),
                cert_path: cert_path.into(),
                key_path: env_required("MQTT_CLIENT_KEY")?.into(),
            },
            None => AuthMode::Password {
                username: env_required("MQTT_USERNAME")?,
                password: env_required("MQTT_PASSWORD")?,
                ca_path: env_optional("MQTT_CA_CERT").map(Into::into),
            },
        };

        let lifetime = match env_or_default("MQTT_LIFETIME", "per-request".to_string()).as_str() {
            "per-request" => ConnectionLifetime::PerRequest,
            "persistent" => ConnectionLifetime::Persistent,
            other => {
                return Err(format!(
                    "MQTT_LIFETIME must be per-request or persistent, got {other}"
                ));
            }
        };

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_or_default(
                    "MQTT_BROKER_HOST",
                    "mqtt.cloud.yandex.net".to_string(),
                ),
                broker_port: env_or_default("MQTT_BROKER_PORT", 8883),
                keepalive: Duration::from_secs(env_or_default("MQTT_KEEPALIVE_SECS", 60)),
                connect_timeout: Duration::from_secs(env_or_default(
                    "MQTT_CONNECT_TIMEOUT_SECS",
                    10,
                )),
                topic_prefix: env_or_default("MQTT_TOPIC_PREFIX", "$devices".to_string()),
                client_id: env_or_default("MQTT_CLIENT_ID", "home-to-mqtt".to_string()),
                auth,
                lifetime,
            },
            timing: TimingConfig {
                state_timeout: Duration::from_secs(env_or_default("STATE_TIMEOUT_SECS", 5)),
                change_timeout: Duration::from_secs(env_or_default("CHANGE_TIMEOUT_SECS", 5)),
                cache_max_age: Duration::from_secs(env_or_default("CACHE_MAX_AGE_SECS", 5)),
            },
            dispatch: DispatchConfig {
                base_url: env_or_default(
                    "DISPATCH_BASE_URL",
                    "https://iot-data.api.cloud.yandex.net/iot-devices/v1".to_string(),
                ),
                registry_id: env_required("REGISTRY_ID")?,
                token: env_required("DISPATCH_TOKEN")?,
            },
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.mqtt.topic_prefix.is_empty() {
            return Err("MQTT_TOPIC_PREFIX must not be empty".into());
        }
        if self.mqtt.keepalive.is_zero() {
            return Err("MQTT_KEEPALIVE_SECS must be > 0".into());
        }
        if self.devices.is_empty() {
            return Err("No devices found in devices file".into());
        }
        // A freshness bound beyond the change window would let a stale
        // pre-action state pass for confirmation.
        if self.timing.cache_max_age > self.timing.change_timeout {
            return Err("CACHE_MAX_AGE_SECS must not exceed CHANGE_TIMEOUT_SECS".into());
        }
        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }
}

impl MqttConfig {
    /// Telemetry topic for one device: {prefix}/{device_id}/state
    pub fn state_topic(&self, mqtt_device_id: &str) -> String {
        format!("{}/{}/state", self.topic_prefix, mqtt_device_id)
    }
}

fn parse_devices(content: &str) -> Result<Vec<DeviceConfig>, String> {
    let raw_devices: Vec<RawDevice> = serde_json::from_str(content).map_err(|e| e.to_string())?;

    let mut devices = Vec::with_capacity(raw_devices.len());
    for raw in raw_devices {
        if raw.id.is_empty() || raw.mqtt_device_id.is_empty() {
            return Err("Device entries need non-empty 'id' and 'mqtt_device_id'".into());
        }
        if devices.iter().any(|d: &DeviceConfig| d.id == raw.id) {
            return Err(format!("Duplicate device id: {}", raw.id));
        }
        devices.push(DeviceConfig {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            mqtt_device_id: raw.mqtt_device_id,
        });
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt_config() -> MqttConfig {
        MqttConfig {
            broker_host: "mqtt.cloud.yandex.net".into(),
            broker_port: 8883,
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            topic_prefix: "$devices".into(),
            client_id: "home-to-mqtt".into(),
            auth: AuthMode::Password {
                username: "registry".into(),
                password: "secret".into(),
                ca_path: None,
            },
            lifetime: ConnectionLifetime::PerRequest,
        }
    }

    #[test]
    fn parses_inventory_and_defaults_name() {
        let devices = parse_devices(
            r#"[
                {"id": "pusher", "mqtt_device_id": "are0abc123", "name": "Button Pusher"},
                {"id": "watering-system", "mqtt_device_id": "are0def456"}
            ]"#,
        )
        .unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "Button Pusher");
        assert_eq!(devices[1].name, "watering-system");
        assert_eq!(devices[1].mqtt_device_id, "are0def456");
    }

    #[test]
    fn rejects_duplicate_device_ids() {
        let err = parse_devices(
            r#"[
                {"id": "pusher", "mqtt_device_id": "a"},
                {"id": "pusher", "mqtt_device_id": "b"}
            ]"#,
        )
        .unwrap_err();
        assert!(err.contains("Duplicate"));
    }

    #[test]
    fn builds_wire_topics() {
        let mqtt = test_mqtt_config();
        assert_eq!(mqtt.state_topic("are0abc123"), "$devices/are0abc123/state");
    }

    fn test_config_with_freshness(cache_max_age: Duration) -> Config {
        Config {
            mqtt: test_mqtt_config(),
            timing: TimingConfig {
                state_timeout: Duration::from_secs(5),
                change_timeout: Duration::from_secs(5),
                cache_max_age,
            },
            dispatch: DispatchConfig {
                base_url: "https://iot-data.api.cloud.yandex.net/iot-devices/v1".into(),
                registry_id: "registry".into(),
                token: "token".into(),
            },
            devices: vec![DeviceConfig {
                id: "pusher".into(),
                mqtt_device_id: "are0abc123".into(),
                name: "Button Pusher".into(),
            }],
        }
    }

    #[test]
    fn rejects_freshness_bound_beyond_change_window() {
        let err = test_config_with_freshness(Duration::from_secs(6))
            .validate()
            .unwrap_err();
        assert!(err.contains("CACHE_MAX_AGE_SECS"));
    }

    #[test]
    fn accepts_freshness_bound_up_to_change_window() {
        test_config_with_freshness(Duration::from_secs(5))
            .validate()
            .unwrap();
    }
}
