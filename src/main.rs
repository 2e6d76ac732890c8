mod config;
mod controller;
mod error;
mod handler;
mod miio;
mod mqtt;
mod notify;
mod sensor;

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::controller::Controller;
use crate::handler::EventHandler;
use crate::miio::client::MiioClient;
use crate::notify::BarkNotifier;

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

    info!(
        "Starting purifier control (mqtt={}:{}, purifier={}, ranges={})",
        config.mqtt.broker,
        config.mqtt.port,
        config.purifier.ip,
        config.purifier.air_quality_ranges.len(),
    );

    for (i, range) in config.purifier.air_quality_ranges.iter().enumerate() {
        info!(
            "  Range {}: co2 >= {} or pm2.5 >= {} -> {:?}{}",
            i,
            range.co2_threshold,
            range.pm25_threshold,
            range.action,
            range.speed.map(|s| format!(" (speed {s})")).unwrap_or_default(),
        );
    }

    let device = MiioClient::new(config.purifier.ip, config.purifier.token);
    match device.info().await {
        Ok(info) => info!(
            "Purifier {} (id {}, firmware {})",
            info.model, info.device_id, info.firmware
        ),
        Err(e) => warn!("Could not identify purifier at {}: {}", config.purifier.ip, e),
    }

    let notifier = match BarkNotifier::new(&config.bark) {
        Ok(n) => n,
        Err(e) => {
            error!("Failed to set up notifications: {}", e);
            std::process::exit(1);
        }
    };
    if !notifier.is_enabled() {
        info!("Notifications disabled: bark.api_url is empty");
    }

    let controller = Controller::new(
        device,
        notifier,
        config.purifier.air_quality_ranges.clone(),
        config.purifier.modes,
    );

    // Channels
    let (message_tx, mut message_rx) = mpsc::channel::<mqtt::client::MqttMessage>(100);
    let (request_tx, request_rx) = mpsc::channel::<mqtt::RequestData>(10);

    let mut handler = EventHandler::new(controller, request_tx);

    let mqtt_client = mqtt::client::MqttClient::new(&config);
    let mqtt = mqtt_client.handle();
    let mut mqtt_handle = tokio::spawn(async move {
        mqtt_client.run(message_tx, request_rx).await;
    });

    let event_topic = config.event_topic();

    // Main loop: feed sensor reports to the handler + handle shutdown
    loop {
        tokio::select! {
            Some(msg) = message_rx.recv() => {
                if msg.topic == event_topic {
                    handler.handle(&msg.payload).await;
                } else {
                    debug!("Ignoring message on {}", msg.topic);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = terminate() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    handler.shutdown();
    if let Err(e) = mqtt.disconnect().await {
        warn!("Failed to disconnect from MQTT broker: {}", e);
    }
    if tokio::time::timeout(Duration::from_secs(3), &mut mqtt_handle)
        .await
        .is_err()
    {
        mqtt_handle.abort();
    }
    info!("purifier control stopped");
}

/// Resolves on SIGTERM. Never resolves if the handler cannot be installed.
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
