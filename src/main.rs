mod config;
mod dispatch;
mod error;
mod mqtt;
mod telemetry;
mod verify;

use tracing::{error, info};

use crate::dispatch::HttpDispatcher;
use crate::mqtt::TelemetryLink;
use crate::verify::{ActionVerifier, Verdict};

enum Request {
    /// Report the device's current state without touching it.
    Query { device_id: String },
    /// Switch the device and verify the reported effect.
    Action { device_id: String, on: bool },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let request = match parse_args(std::env::args().skip(1).collect()) {
        Some(r) => r,
        None => {
            eprintln!("Usage: home-to-mqtt query <device-id>");
            eprintln!("       home-to-mqtt action <device-id> <on|off>");
            std::process::exit(2);
        }
    };

    let device_id = match &request {
        Request::Query { device_id } | Request::Action { device_id, .. } => device_id.clone(),
    };
    let Some(device) = config.device(&device_id) else {
        error!("Unknown device: {}", device_id);
        std::process::exit(1);
    };

    info!(
        "Starting home-to-mqtt bridge (mqtt={}:{}, devices={})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.devices.len(),
    );

    for d in &config.devices {
        info!("  Device: {} ({}) -> {}", d.name, d.id, d.mqtt_device_id);
    }

    // Subscribe for the whole fleet up front so concurrent requests against
    // a persistent link all land in the same cache.
    let topics: Vec<String> = config
        .devices
        .iter()
        .map(|d| config.mqtt.state_topic(&d.mqtt_device_id))
        .collect();

    let mut link = TelemetryLink::new(config.mqtt.clone());
    if let Err(e) = link.connect_and_subscribe(topics).await {
        error!("Failed to establish MQTT link ({:?}): {}", link.status(), e);
        std::process::exit(1);
    }

    let dispatcher = HttpDispatcher::new(&config);
    let verifier = ActionVerifier::new(link.store(), dispatcher, config.timing);

    let verdict = match request {
        Request::Query { .. } => verifier.query_state(&device.mqtt_device_id).await,
        Request::Action { on, .. } => {
            let (command, desired) = if on { ("1", "on") } else { ("0", "off") };
            verifier
                .verify_action(&device.mqtt_device_id, command, desired)
                .await
        }
    };

    link.disconnect().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&verdict).expect("verdict serializes")
    );
    if matches!(verdict, Verdict::Error { .. }) {
        std::process::exit(1);
    }
}

fn parse_args(args: Vec<String>) -> Option<Request> {
    let mut args = args.into_iter();
    let kind = args.next()?;
    let device_id = args.next()?;
    match (kind.as_str(), args.next()) {
        ("query", None) => Some(Request::Query { device_id }),
        ("action", Some(state)) => match state.as_str() {
            "on" => Some(Request::Action { device_id, on: true }),
            "off" => Some(Request::Action {
                device_id,
                on: false,
            }),
            _ => None,
        },
        _ => None,
    }
}
