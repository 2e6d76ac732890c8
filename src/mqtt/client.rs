use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;

use super::{REQUEST_PAYLOAD, RequestData};

pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    event_topic: String,
    command_topic: String,
}

impl MqttClient {
    pub fn new(config: &Config) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker,
            config.mqtt.port,
        );
        mqttopts.set_keep_alive(std::time::Duration::from_secs(60));
        mqttopts.set_credentials(&config.mqtt.username, &config.mqtt.password);

        let (client, eventloop) = AsyncClient::new(mqttopts, 10);

        Self {
            client,
            eventloop,
            event_topic: config.event_topic(),
            command_topic: config.command_topic(),
        }
    }

    /// Handle used to disconnect from outside the event loop.
    pub fn handle(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Run the MQTT event loop. Subscribes to the sensor's event topic and asks
    /// for a first reading on every connect, forwards incoming publishes
    /// through `message_tx`, and publishes a data request for each signal on
    /// `request_rx`. Returns once a disconnect has been sent.
    pub async fn run(
        mut self,
        message_tx: mpsc::Sender<MqttMessage>,
        mut request_rx: mpsc::Receiver<RequestData>,
    ) {
        loop {
            tokio::select! {
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("Connected to MQTT broker");

                            if let Err(e) = self
                                .client
                                .subscribe(&self.event_topic, QoS::AtMostOnce)
                                .await
                            {
                                error!("Failed to subscribe to {}: {}", self.event_topic, e);
                            }
                            request_data(&self.client, &self.command_topic).await;
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let msg = MqttMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            };
                            if message_tx.send(msg).await.is_err() {
                                warn!("Message channel closed");
                            }
                        }
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                            info!("Disconnected from MQTT broker");
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                }
                Some(RequestData) = request_rx.recv() => {
                    request_data(&self.client, &self.command_topic).await;
                }
            }
        }
    }
}

async fn request_data(client: &AsyncClient, command_topic: &str) {
    info!("Requesting sensor data on {}", command_topic);
    if let Err(e) = client
        .publish(command_topic, QoS::AtMostOnce, false, REQUEST_PAYLOAD)
        .await
    {
        warn!("Failed to publish data request: {}", e);
    }
}
