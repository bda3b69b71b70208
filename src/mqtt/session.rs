//! MQTT broker session built on `rumqttc`.
//!
//! The rest of the bridge consumes the broker through the [`MqttPublisher`]
//! capability only. The event loop runs in its own driver task which routes
//! inbound messages to devices and reports the disconnect reason through a
//! oneshot; the fleet coordinator races that oneshot, never the driver
//! itself, so teardown publishes can still flush through a live connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, LastWill, MqttOptions, Packet};

use crate::config::Config;
use crate::devices::Device;
use crate::devices::entities::InboundMessage;
use crate::error::{BridgeError, Result};

const MQTT_CHANNEL_CAPACITY: usize = 10;
const KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

/// The broker capability consumed by supervisors and devices.
#[async_trait]
pub trait MqttPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        retain: bool,
    ) -> Result<()>;
    async fn subscribe(&self, topics: &[String]) -> Result<()>;
    fn is_connected(&self) -> bool;
}

fn mqtt_error<E: std::fmt::Display>(err: E) -> BridgeError {
    BridgeError::Mqtt(err.to_string())
}

/// Classify an event-loop error: refused credentials are fatal, everything
/// else is a retryable connection loss.
fn classify_connection_error(err: &ConnectionError) -> BridgeError {
    match err {
        ConnectionError::ConnectionRefused(code) => {
            BridgeError::Config(format!("broker refused connection: {code:?}"))
        }
        other => BridgeError::Mqtt(other.to_string()),
    }
}

pub struct MqttSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttSession {
    /// Build the client with the bridge's last will (`availability =
    /// offline`, retained) so the broker reports us gone on an ungraceful
    /// drop.
    pub fn new(config: &Config, availability_topic: &str) -> (Self, EventLoop) {
        let client_id = format!("{}_{:x}", config.base_topic, std::process::id());
        let mut options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
        options.set_keep_alive(KEEP_ALIVE);
        if let (Some(user), Some(password)) = (&config.mqtt_user, &config.mqtt_password) {
            options.set_credentials(user.clone(), password.clone());
        }
        options.set_last_will(LastWill::new(
            availability_topic,
            "offline",
            rumqttc::QoS::AtLeastOnce,
            true,
        ));
        let (client, eventloop) = AsyncClient::new(options, MQTT_CHANNEL_CAPACITY);
        (
            Self {
                client,
                connected: Arc::new(AtomicBool::new(false)),
            },
            eventloop,
        )
    }

    /// Poll the event loop until the broker acknowledges the connection.
    pub async fn wait_connected(&self, eventloop: &mut EventLoop, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(BridgeError::Timeout("broker connection".to_string()));
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        self.connected.store(true, Ordering::SeqCst);
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(err) => return Err(classify_connection_error(&err)),
                },
            }
        }
    }

    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Err(err) = self.client.disconnect().await {
            debug!("mqtt disconnect: {err}");
        }
    }

    /// Drive the event loop until it fails, routing inbound publishes to
    /// the owning devices. Returns the disconnect reason.
    pub async fn drive(
        &self,
        mut eventloop: EventLoop,
        router: Arc<MessageRouter>,
    ) -> BridgeError {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.connected.store(true, Ordering::SeqCst);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    router.route(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(err) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return classify_connection_error(&err);
                }
            }
        }
    }
}

#[async_trait]
impl MqttPublisher for MqttSession {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        retain: bool,
    ) -> Result<()> {
        self.client
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(mqtt_error)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        for topic in topics {
            self.client
                .subscribe(topic.clone(), rumqttc::QoS::AtLeastOnce)
                .await
                .map_err(mqtt_error)?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Resolves which registered device owns an inbound command topic and
/// forwards the payload onto that device's queue.
pub struct MessageRouter {
    base_topic: String,
    devices: Vec<Arc<dyn Device>>,
}

impl MessageRouter {
    pub fn new(base_topic: String, devices: Vec<Arc<dyn Device>>) -> Self {
        Self {
            base_topic,
            devices,
        }
    }

    pub fn route(&self, topic: &str, payload: &[u8]) {
        let prefix = format!("{}/", self.base_topic);
        let Some(relative) = topic.strip_prefix(prefix.as_str()) else {
            return;
        };
        for device in &self.devices {
            if !device
                .subscribed_topics()
                .iter()
                .any(|t| t.as_str() == relative)
            {
                continue;
            }
            if !device.core().is_connected() {
                warn!(
                    "[{}] message on {relative} dropped, device is offline",
                    device.label()
                );
                return;
            }
            let value = serde_json::from_slice(payload).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(payload).into_owned())
            });
            let message = InboundMessage {
                topic: relative.to_string(),
                value,
            };
            if !device.core().enqueue_message(message) {
                warn!(
                    "[{}] message queue full, dropping message on {relative}",
                    device.label()
                );
            }
            return;
        }
        debug!("no device subscribed to {topic}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceEntry;
    use crate::devices::create_device;

    fn kettle() -> Arc<dyn Device> {
        create_device(&DeviceEntry {
            device_type: "redmond200".to_string(),
            address: "aa:bb:cc:dd:ee:ff".to_string(),
            friendly_name: None,
            key: None,
            passive: None,
            threshold: None,
            connection_failures_limit: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn messages_reach_the_owning_device_queue() {
        let device = kettle();
        device.core().connected_event().set();
        let router = MessageRouter::new("blemqtt".to_string(), vec![device.clone()]);

        router.route("blemqtt/0xaabbccddeeff/boil/set", b"ON");
        let message = device.core().next_message().await.unwrap();
        assert_eq!(message.topic, "0xaabbccddeeff/boil/set");
        assert_eq!(message.value_str(), "ON");
    }

    #[test]
    fn messages_for_offline_devices_are_dropped() {
        let device = kettle();
        let router = MessageRouter::new("blemqtt".to_string(), vec![device.clone()]);

        router.route("blemqtt/0xaabbccddeeff/boil/set", b"ON");
        assert!(!device.core().is_connected());
        // The queue stayed empty: nothing to consume.
        assert!(
            device
                .core()
                .enqueue_message(InboundMessage {
                    topic: "probe".to_string(),
                    value: serde_json::Value::Null,
                }),
            "queue should be empty apart from this probe"
        );
    }

    #[test]
    fn unrelated_topics_are_ignored() {
        let device = kettle();
        device.core().connected_event().set();
        let router = MessageRouter::new("blemqtt".to_string(), vec![device.clone()]);

        router.route("blemqtt/0xaabbccddeeff/temperature", b"20");
        router.route("otherroot/0xaabbccddeeff/boil/set", b"ON");
        assert!(device.core().enqueue_message(InboundMessage {
            topic: "probe".to_string(),
            value: serde_json::Value::Null,
        }));
    }

    #[tokio::test]
    async fn json_payloads_are_parsed_and_raw_strings_fall_back() {
        let device = kettle();
        device.core().connected_event().set();
        let router = MessageRouter::new("blemqtt".to_string(), vec![device.clone()]);

        router.route("blemqtt/0xaabbccddeeff/boil/set", b"{\"state\": \"ON\"}");
        router.route("blemqtt/0xaabbccddeeff/boil/set", b"OFF");

        let first = device.core().next_message().await.unwrap();
        assert!(first.value.is_object());
        let second = device.core().next_message().await.unwrap();
        assert_eq!(second.value_str(), "OFF");
    }
}
