//! MQTT publisher for egress events
//!
//! Publishes engine events to MQTT topics for downstream consumers:
//! - sentinel/alerts - Alert snapshots on each status change (QoS 1)
//! - sentinel/zones - Zone entry/exit events (QoS 0)
//! - sentinel/metrics - Periodic metrics snapshots (QoS 0)

use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EgressMessage>,
    alerts_topic: String,
    zones_topic: String,
    metrics_topic: String,
}

impl MqttPublisher {
    /// Connects to the broker at the configured MQTT host/port
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let client_id = format!("sentinel-{}-{}", config.device_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            rx,
            alerts_topic: config.mqtt_alerts_topic().to_string(),
            zones_topic: config.mqtt_zones_topic().to_string(),
            metrics_topic: config.mqtt_metrics_topic().to_string(),
        }
    }

    /// Runs until the shutdown signal, then drains what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            alerts = %self.alerts_topic,
            zones = %self.zones_topic,
            metrics = %self.metrics_topic,
            "mqtt_egress_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.publish_message(msg).await,
                    None => return,
                },
            }
        }
    }

    async fn publish_message(&self, msg: EgressMessage) {
        match msg {
            EgressMessage::Alert(payload) => {
                // At-least-once so no status change is lost downstream
                if let Err(e) = self
                    .client
                    .publish(&self.alerts_topic, QoS::AtLeastOnce, false, payload.json.into_bytes())
                    .await
                {
                    error!(error = %e, "mqtt_egress_alert_failed");
                }
            }
            EgressMessage::ZoneEvent(payload) => {
                if let Ok(json) = serde_json::to_string(&payload) {
                    if let Err(e) = self
                        .client
                        .publish(&self.zones_topic, QoS::AtMostOnce, false, json.into_bytes())
                        .await
                    {
                        debug!(error = %e, "mqtt_egress_zone_failed");
                    }
                }
            }
            EgressMessage::Metrics(payload) => {
                if let Err(e) = self
                    .client
                    .publish(&self.metrics_topic, QoS::AtMostOnce, false, payload.json.into_bytes())
                    .await
                {
                    debug!(error = %e, "mqtt_egress_metrics_failed");
                }
            }
        }
    }
}
