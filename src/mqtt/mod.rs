//! Broker session, message routing, Home Assistant discovery, and the
//! publish surface handed to device handler loops.

pub mod discovery;
pub mod session;

use std::sync::Arc;

use log::warn;

use crate::devices::{Device, DeviceCore};
use crate::devices::entities::join_topic;
use crate::error::Result;

pub use discovery::DiscoveryPublisher;
pub use session::{MessageRouter, MqttPublisher, MqttSession, QosLevel};

/// The publish capability a device sees while its supervisor runs it:
/// base-topic-relative state publishing, availability, and the once-per-
/// connection discovery config.
#[derive(Clone)]
pub struct DevicePublisher {
    mqtt: Arc<dyn MqttPublisher>,
    base_topic: String,
    discovery: Arc<DiscoveryPublisher>,
}

impl DevicePublisher {
    pub fn new(
        mqtt: Arc<dyn MqttPublisher>,
        base_topic: String,
        discovery: Arc<DiscoveryPublisher>,
    ) -> Self {
        Self {
            mqtt,
            base_topic,
            discovery,
        }
    }

    /// Broker blips while a device is mid-loop are logged, not raised; the
    /// fleet coordinator owns the broker lifecycle.
    async fn publish_relative(&self, topic: &str, payload: &str) {
        if !self.mqtt.is_connected() {
            warn!("mqtt is disconnected, dropping publish to {topic}");
            return;
        }
        let full = join_topic([self.base_topic.as_str(), topic]);
        if let Err(err) = self
            .mqtt
            .publish(&full, payload.as_bytes(), QosLevel::AtLeastOnce, false)
            .await
        {
            warn!("error publishing to {full}: {err}");
        }
    }

    /// Publish a state value, then availability. Sequential on purpose so
    /// Home Assistant has the new value before the entity goes available.
    pub async fn publish_state(&self, core: &DeviceCore, subtopic: &str, payload: &str) {
        let topic = join_topic([core.unique_id().as_str(), subtopic]);
        self.publish_relative(&topic, payload).await;
        self.send_availability(core, true).await;
    }

    pub async fn send_availability(&self, core: &DeviceCore, online: bool) {
        self.publish_relative(
            &core.availability_topic(),
            if online { "online" } else { "offline" },
        )
        .await;
    }

    /// Per-iteration housekeeping for `handle` loops: send the discovery
    /// config once per connection and refresh RSSI from the live client.
    pub async fn update_device_data(&self, device: &dyn Device) -> Result<()> {
        let core = device.core();
        if !core.config_sent() {
            self.discovery
                .send_device_config(self.mqtt.as_ref(), device)
                .await?;
            core.set_config_sent();
        }
        if let Some(client) = core.client().await {
            if let Some(rssi) = client.rssi().await {
                core.set_rssi(rssi);
            }
        }
        Ok(())
    }
}
