use std::path::Path;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{AuthMode, ConnectionLifetime, MqttConfig};
use crate::error::ConnectionError;
use crate::telemetry::{DeviceState, StateStore};

use super::{decode_state_payload, parse_state_topic};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Connection lifecycle as seen by foreground callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Owns the one subscriber connection per unit of work and the background
/// task that drains telemetry into the shared [`StateStore`].
pub struct TelemetryLink {
    config: MqttConfig,
    store: StateStore,
    status_tx: watch::Sender<LinkStatus>,
    client: Option<AsyncClient>,
    task: Option<JoinHandle<()>>,
}

impl TelemetryLink {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            store: StateStore::new(),
            status_tx: watch::channel(LinkStatus::Disconnected).0,
            client: None,
            task: None,
        }
    }

    /// Handle to the shared state cache, for wait primitives.
    pub fn store(&self) -> StateStore {
        self.store.clone()
    }

    pub fn status(&self) -> LinkStatus {
        *self.status_tx.borrow()
    }

    /// Connect to the broker, spawn the delivery task, and subscribe to
    /// every topic in `topics`. Blocks until the broker acknowledges the
    /// connection or the connect timeout lapses. Topics are (re)subscribed
    /// on every ConnAck, so a persistent link picks them back up after a
    /// reconnect. A rejected subscription is logged but does not fail the
    /// overall call.
    pub async fn connect_and_subscribe(
        &mut self,
        topics: Vec<String>,
    ) -> Result<(), ConnectionError> {
        if self.task.is_some() {
            warn!("connect_and_subscribe called on a live link, ignoring");
            return Ok(());
        }

        let options = build_options(&self.config)?;
        let (client, eventloop) = AsyncClient::new(options, 100);

        self.status_tx.send_replace(LinkStatus::Connecting);
        let mut status_rx = self.status_tx.subscribe();

        info!(
            host = %self.config.broker_host,
            port = self.config.broker_port,
            "connecting to MQTT broker"
        );

        let task = tokio::spawn(run_delivery(
            eventloop,
            client.clone(),
            self.store.clone(),
            self.status_tx.clone(),
            topics,
            self.config.topic_prefix.clone(),
            self.config.lifetime,
        ));
        self.client = Some(client);
        self.task = Some(task);

        let wait = status_rx.wait_for(|s| {
            matches!(s, LinkStatus::Connected | LinkStatus::Failed)
        });
        let status = match timeout(self.config.connect_timeout, wait).await {
            Ok(Ok(status)) => *status,
            Ok(Err(_)) => LinkStatus::Failed,
            Err(_) => {
                error!(
                    timeout = ?self.config.connect_timeout,
                    "broker did not acknowledge connection in time"
                );
                self.teardown();
                return Err(ConnectionError::Timeout(self.config.connect_timeout));
            }
        };

        match status {
            LinkStatus::Connected => Ok(()),
            _ => {
                self.teardown();
                Err(ConnectionError::Refused)
            }
        }
    }

    /// Stop the delivery task and close the transport. Safe to call at any
    /// point, including when connect never succeeded or after a previous
    /// disconnect.
    pub async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "disconnect on an already-dead connection");
            }
        }
        // The delivery task exits on its own once the Disconnect packet hits
        // the socket; only a stuck link gets aborted.
        if let Some(mut task) = self.task.take() {
            if timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        if self.status_tx.send_replace(LinkStatus::Disconnected) != LinkStatus::Disconnected {
            info!("disconnected from MQTT broker");
        }
    }

    fn teardown(&mut self) {
        self.client = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.status_tx.send_replace(LinkStatus::Failed);
    }
}

fn build_options(config: &MqttConfig) -> Result<MqttOptions, ConnectionError> {
    let mut options = MqttOptions::new(
        &config.client_id,
        &config.broker_host,
        config.broker_port,
    );
    options.set_keep_alive(config.keepalive);

    match &config.auth {
        AuthMode::Password {
            username,
            password,
            ca_path,
        } => {
            options.set_credentials(username, password);
            if let Some(ca_path) = ca_path {
                let ca = read_pem(ca_path)?;
                options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: None,
                }));
            }
        }
        AuthMode::Certificate {
            ca_path,
            cert_path,
            key_path,
        } => {
            let ca = read_pem(ca_path)?;
            let cert = read_pem(cert_path)?;
            let key = read_pem(key_path)?;
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((cert, key)),
            }));
        }
    }

    Ok(options)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConnectionError> {
    std::fs::read(path).map_err(|source| ConnectionError::Credentials {
        path: path.to_path_buf(),
        source,
    })
}

/// Background delivery loop. Decodes arriving telemetry into the store and
/// keeps draining for all devices while foreground callers wait on specific
/// ones. Never propagates a decode failure to a caller.
async fn run_delivery(
    mut eventloop: EventLoop,
    client: AsyncClient,
    store: StateStore,
    status_tx: watch::Sender<LinkStatus>,
    topics: Vec<String>,
    topic_prefix: String,
    lifetime: ConnectionLifetime,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("connected to MQTT broker");
                    status_tx.send_replace(LinkStatus::Connected);
                    for topic in &topics {
                        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                            error!(topic = %topic, error = %e, "failed to subscribe");
                        }
                    }
                } else {
                    // Bad credentials will not get better on retry.
                    error!(code = ?ack.code, "broker rejected the connection");
                    status_tx.send_replace(LinkStatus::Failed);
                    return;
                }
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                for code in &ack.return_codes {
                    if matches!(code, SubscribeReasonCode::Failure) {
                        error!("broker rejected a subscription");
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                ingest(&store, &topic_prefix, &publish.topic, &publish.payload);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnect packet flushed, stopping delivery");
                return;
            }
            Ok(_) => {}
            Err(e) => match lifetime {
                ConnectionLifetime::PerRequest => {
                    error!(error = %e, "MQTT connection error, link failed");
                    status_tx.send_replace(LinkStatus::Failed);
                    return;
                }
                ConnectionLifetime::Persistent => {
                    error!(error = %e, "MQTT connection error, reconnecting");
                    status_tx.send_replace(LinkStatus::Connecting);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            },
        }
    }
}

/// Decode one arriving message and cache it. Malformed payloads and foreign
/// topics are dropped here; a caller waiting on that device just keeps
/// waiting.
fn ingest(store: &StateStore, prefix: &str, topic: &str, payload: &[u8]) {
    let Some(device_id) = parse_state_topic(topic, prefix) else {
        debug!(topic, "ignoring message on non-state topic");
        return;
    };
    match decode_state_payload(payload) {
        Ok((state, raw)) => {
            debug!(device_id, ?state, "telemetry received");
            store.put(DeviceState::new(device_id, state, raw));
        }
        Err(e) => {
            warn!(device_id, topic, error = %e, "dropping malformed telemetry payload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ingest_caches_valid_telemetry() {
        let store = StateStore::new();
        ingest(
            &store,
            "$devices",
            "$devices/are0abc123/state",
            br#"{"state": "on"}"#,
        );
        let record = store.get("are0abc123").unwrap();
        assert_eq!(record.state.as_deref(), Some("on"));
        assert_eq!(record.raw_payload["state"], "on");
    }

    #[tokio::test]
    async fn ingest_drops_malformed_payloads() {
        let store = StateStore::new();
        ingest(
            &store,
            "$devices",
            "$devices/are0abc123/state",
            b"\x00\x01 not json",
        );
        assert!(store.get("are0abc123").is_none());
    }

    #[tokio::test]
    async fn ingest_ignores_foreign_topics() {
        let store = StateStore::new();
        ingest(
            &store,
            "$devices",
            "$devices/are0abc123/commands",
            br#"{"state": "on"}"#,
        );
        ingest(&store, "$devices", "$monitoring/json", br#"{"state": "on"}"#);
        assert!(store.get("are0abc123").is_none());
    }

    fn test_config() -> crate::config::MqttConfig {
        crate::config::MqttConfig {
            broker_host: "localhost".into(),
            broker_port: 1883,
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            topic_prefix: "$devices".into(),
            client_id: "test".into(),
            auth: AuthMode::Password {
                username: "u".into(),
                password: "p".into(),
                ca_path: None,
            },
            lifetime: ConnectionLifetime::PerRequest,
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_without_connect() {
        let mut link = TelemetryLink::new(test_config());
        assert_eq!(link.status(), LinkStatus::Disconnected);
        link.disconnect().await;
        link.disconnect().await;
        assert_eq!(link.status(), LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn connect_timeout_marks_link_failed() {
        // A listener that accepts TCP but never speaks MQTT, so the ConnAck
        // wait runs out.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => sockets.push(socket),
                    Err(_) => return,
                }
            }
        });

        let mut config = test_config();
        config.broker_port = port;
        config.broker_host = "127.0.0.1".into();
        config.connect_timeout = Duration::from_millis(250);

        let mut link = TelemetryLink::new(config);
        let err = link
            .connect_and_subscribe(vec!["$devices/are0abc123/state".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(_)));
        assert_eq!(link.status(), LinkStatus::Failed);

        link.disconnect().await;
        assert_eq!(link.status(), LinkStatus::Disconnected);
    }

    #[test]
    fn missing_credential_file_is_a_connection_error() {
        let err = read_pem(Path::new("/nonexistent/rootCA.crt")).unwrap_err();
        assert!(matches!(err, ConnectionError::Credentials { .. }));
    }
}
