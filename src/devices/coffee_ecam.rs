//! De'Longhi ECAM coffee machine: a power switch plus a status sensor.
//!
//! The machine only exposes a wake-from-standby command over BLE; turning
//! it off again is done on the machine itself, so an OFF command is
//! acknowledged with a warning and the real state follows from the next
//! status poll.

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
use crate::protocols::ecam::{EcamProtocol, MachineStatus};
use crate::protocols::queue::CommandQueue;

pub const DEVICE_TYPE: &str = "ecam";

const DATA_CHAR: Uuid = Uuid::from_u128(0x00035b03_58e6_07dd_021a_08123a000301);

const POWER_ENTITY: &str = "power";
const STATUS_ENTITY: &str = "status";

static SPEC: DeviceSpec = DeviceSpec {
    device_type: DEVICE_TYPE,
    manufacturer: Some("Delonghi"),
    supports_passive: false,
    supports_active: true,
    active_mode: ConnectionMode::ActiveKeepConnection,
    drops_connection: false,
    address_type: AddressType::Public,
    reconnection_interval: Duration::from_secs(60),
    active_interval: Duration::from_secs(30),
    passive_interval: Duration::from_secs(60),
    not_ready_interval: Duration::from_secs(5),
    connection_failures_limit: 5,
};

pub struct EcamMachine {
    core: DeviceCore,
    protocol: std::sync::Mutex<Option<EcamProtocol>>,
    status: std::sync::Mutex<Option<MachineStatus>>,
    initial_state_sent: AtomicBool,
}

impl EcamMachine {
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
            status: std::sync::Mutex::new(None),
            initial_state_sent: AtomicBool::new(false),
        })
    }

    fn protocol(&self) -> Result<EcamProtocol> {
        self.protocol
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BridgeError::Transport("no active connection".to_string()))
    }

    async fn refresh_status(&self) -> Result<()> {
        let status = self.protocol()?.get_state().await?;
        *self.status.lock().unwrap() = Some(status);
        Ok(())
    }

    async fn notify_state(&self, publisher: &DevicePublisher) {
        let Some(status) = *self.status.lock().unwrap() else {
            return;
        };
        let mut payload = json!({
            STATUS_ENTITY: status.function(),
            "alarms": status.alarms(),
        });
        if let Some(lqi) = self.core.linkquality() {
            payload["linkquality"] = json!(lqi);
        }
        info!("[{}] send state={payload}", self.label());
        publisher
            .publish_state(&self.core, "", &payload.to_string())
            .await;
        publisher
            .publish_state(
                &self.core,
                POWER_ENTITY,
                if status.is_on() { "ON" } else { "OFF" },
            )
            .await;
        self.initial_state_sent.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Device for EcamMachine {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn spec(&self) -> &DeviceSpec {
        &SPEC
    }

    fn entities(&self) -> EntityMap {
        vec![
            (
                EntityDomain::Switch,
                vec![EntityDesc {
                    name: POWER_ENTITY,
                    topic: Some(POWER_ENTITY),
                    icon: Some("coffee-maker"),
                    ..Default::default()
                }],
            ),
            (
                EntityDomain::Sensor,
                vec![EntityDesc {
                    name: STATUS_ENTITY,
                    icon: Some("state-machine"),
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
        let notifications = client.start_notify(DATA_CHAR).await?;
        let sink = Arc::new(CharacteristicSink::new(client, DATA_CHAR, true));
        let protocol = EcamProtocol::new(CommandQueue::spawn(sink, notifications));
        *self.protocol.lock().unwrap() = Some(protocol);

        self.core.set_model("ECAM".to_string());
        self.initial_state_sent.store(false, Ordering::SeqCst);
        self.refresh_status().await
    }

    async fn handle(&self, publisher: &DevicePublisher) -> Result<()> {
        loop {
            publisher.update_device_data(self).await?;
            self.refresh_status().await?;
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
            if entity != POWER_ENTITY || action != Some(SET_POSTFIX) {
                warn!("[{}] unexpected command topic {}", self.label(), message.topic);
                continue;
            }
            let value = message.value_str();
            if matches!(value.to_uppercase().as_str(), "ON" | "1" | "TRUE") {
                info!("[{}] power on", self.label());
                match self.protocol()?.power_on().await {
                    Ok(()) => {
                        self.refresh_status().await?;
                        self.notify_state(publisher).await;
                    }
                    Err(BridgeError::Protocol(err)) => {
                        warn!("[{}] power on failed: {err}", self.label());
                    }
                    Err(err) => return Err(err),
                }
            } else {
                warn!(
                    "[{}] the machine cannot be switched off over BLE",
                    self.label()
                );
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
