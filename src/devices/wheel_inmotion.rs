//! InMotion electric unicycle: live telemetry sensors plus a headlight
//! switch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::ble::backend::AddressType;
use crate::config::DeviceEntry;
use crate::devices::entities::{
    EntityDesc, EntityDomain, EntityMap, SET_POSTFIX, split_command_topic,
};
use crate::devices::{
    ConnectionMode, Device, DeviceCore, DeviceSpec, resolve_connection_mode,
};
use crate::error::{BridgeError, Result};
use crate::mqtt::DevicePublisher;
use crate::protocols::CharacteristicSink;
use crate::protocols::inmotion::{InmotionProtocol, WheelSnapshot};
use crate::protocols::queue::CommandQueue;

pub const DEVICE_TYPE: &str = "inmotion";

const UUID_WRITE_CHAR: Uuid = Uuid::from_u128(0x0000ffe9_0000_1000_8000_00805f9b34fb);
const UUID_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x0000ffe4_0000_1000_8000_00805f9b34fb);

const SPEED_ENTITY: &str = "speed";
const VOLTAGE_ENTITY: &str = "voltage";
const BATTERY_ENTITY: &str = "battery";
const TEMPERATURE_ENTITY: &str = "temperature";
const LIGHT_ENTITY: &str = "light";

static SPEC: DeviceSpec = DeviceSpec {
    device_type: DEVICE_TYPE,
    manufacturer: Some("InMotion"),
    supports_passive: false,
    supports_active: true,
    active_mode: ConnectionMode::ActiveKeepConnection,
    drops_connection: false,
    address_type: AddressType::Public,
    reconnection_interval: Duration::from_secs(30),
    active_interval: Duration::from_secs(5),
    passive_interval: Duration::from_secs(60),
    not_ready_interval: Duration::from_secs(5),
    connection_failures_limit: 5,
};

pub struct InmotionWheel {
    core: DeviceCore,
    protocol: std::sync::Mutex<Option<InmotionProtocol>>,
    snapshot: std::sync::Mutex<Option<WheelSnapshot>>,
    initial_state_sent: AtomicBool,
}

impl InmotionWheel {
    pub fn from_config(entry: &DeviceEntry) -> Result<Self> {
        let mode = resolve_connection_mode(&SPEC, entry.passive)?;
        Ok(Self {
            core: DeviceCore::new(
                &entry.address,
                SPEC.address_type,
                entry.friendly_name.clone(),
                mode,
            )?
                .with_failures_limit(entry.connection_failures_limit),
            protocol: std::sync::Mutex::new(None),
            snapshot: std::sync::Mutex::new(None),
            initial_state_sent: AtomicBool::new(false),
        })
    }

    fn protocol(&self) -> Result<InmotionProtocol> {
        self.protocol
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BridgeError::Transport("no active connection".to_string()))
    }

    async fn notify_state(&self, publisher: &DevicePublisher) {
        let Some(snapshot) = *self.snapshot.lock().unwrap() else {
            return;
        };
        let mut payload = json!({
            SPEED_ENTITY: (snapshot.speed_kmh * 10.0).round() / 10.0,
            VOLTAGE_ENTITY: (snapshot.voltage * 100.0).round() / 100.0,
            BATTERY_ENTITY: snapshot.battery,
            TEMPERATURE_ENTITY: snapshot.temperature,
        });
        if let Some(lqi) = self.core.linkquality() {
            payload["linkquality"] = json!(lqi);
        }
        info!("[{}] send state={payload}", self.label());
        publisher
            .publish_state(&self.core, "", &payload.to_string())
            .await;
        self.initial_state_sent.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Device for InmotionWheel {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn spec(&self) -> &DeviceSpec {
        &SPEC
    }

    fn entities(&self) -> EntityMap {
        vec![
            (
                EntityDomain::Sensor,
                vec![
                    EntityDesc {
                        name: SPEED_ENTITY,
                        unit: Some("km/h"),
                        icon: Some("speedometer"),
                        ..Default::default()
                    },
                    EntityDesc {
                        name: VOLTAGE_ENTITY,
                        device_class: Some("voltage"),
                        unit: Some("V"),
                        ..Default::default()
                    },
                    EntityDesc {
                        name: BATTERY_ENTITY,
                        device_class: Some("battery"),
                        unit: Some("%"),
                        ..Default::default()
                    },
                    EntityDesc {
                        name: TEMPERATURE_ENTITY,
                        device_class: Some("temperature"),
                        unit: Some("\u{b0}C"),
                        ..Default::default()
                    },
                ],
            ),
            (
                EntityDomain::Switch,
                vec![EntityDesc {
                    name: LIGHT_ENTITY,
                    topic: Some(LIGHT_ENTITY),
                    icon: Some("car-light-high"),
                    ..Default::default()
                }],
            ),
        ]
    }

    async fn get_device_data(&self) -> Result<()> {
        let client = self
            .core
            .client()
            .await
            .ok_or_else(|| BridgeError::Transport("no active connection".to_string()))?;
        let notifications = client.start_notify(UUID_NOTIFY_CHAR).await?;
        let sink = Arc::new(CharacteristicSink::new(client, UUID_WRITE_CHAR, true));
        let protocol = InmotionProtocol::new(CommandQueue::spawn(sink, notifications));
        *self.protocol.lock().unwrap() = Some(protocol);

        self.core.set_model("V8".to_string());
        self.initial_state_sent.store(false, Ordering::SeqCst);

        let snapshot = self.protocol()?.get_fast_info().await?;
        *self.snapshot.lock().unwrap() = Some(snapshot);
        Ok(())
    }

    async fn handle(&self, publisher: &DevicePublisher) -> Result<()> {
        loop {
            publisher.update_device_data(self).await?;
            let snapshot = self.protocol()?.get_fast_info().await?;
            *self.snapshot.lock().unwrap() = Some(snapshot);
            self.notify_state(publisher).await;
            tokio::time::sleep(SPEC.active_interval).await;
        }
    }

    async fn handle_messages(&self, publisher: &DevicePublisher) -> Result<()> {
        loop {
            let Some(message) = self.core.next_message().await else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };
            let (entity, action) = split_command_topic(&self.core.unique_id(), &message.topic);
            if entity != LIGHT_ENTITY || action != Some(SET_POSTFIX) {
                warn!("[{}] unexpected command topic {}", self.label(), message.topic);
                continue;
            }
            let value = message.value_str();
            let on = matches!(value.to_uppercase().as_str(), "ON" | "1" | "TRUE");
            info!("[{}] set light to {value}", self.label());
            match self.protocol()?.set_light(on).await {
                Ok(()) => {
                    publisher
                        .publish_state(&self.core, LIGHT_ENTITY, if on { "ON" } else { "OFF" })
                        .await;
                }
                Err(BridgeError::Protocol(err)) => {
                    warn!("[{}] light command failed: {err}", self.label());
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn close(&self) {
        if let Some(protocol) = self.protocol.lock().unwrap().take() {
            protocol.shutdown();
        }
        self.core.close_client().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_sensors_and_light_switch() {
        let entry = DeviceEntry {
            device_type: DEVICE_TYPE.to_string(),
            address: "0f:55:aa:bb:cc:dd".to_string(),
            friendly_name: None,
            key: None,
            passive: None,
            threshold: None,
            connection_failures_limit: None,
        };
        let wheel = InmotionWheel::from_config(&entry).unwrap();
        assert_eq!(
            wheel.subscribed_topics(),
            vec!["0x0f55aabbccdd/light/set".to_string()]
        );
        let entities = wheel.entities();
        let sensors = &entities
            .iter()
            .find(|(d, _)| *d == EntityDomain::Sensor)
            .unwrap()
            .1;
        assert_eq!(sensors.len(), 4);
    }
}
